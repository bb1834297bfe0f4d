// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::OnceLock;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use klaus_core::{AgentError, RunOutcome, RunRequest};
use klaus_store::{
    MessageRecord, SessionRecord, StoreError, TokenTotals, ToolCallStats,
};

use crate::state::AppState;

const SESSION_LIST_LIMIT: usize = 50;
const SESSION_MESSAGES_LIMIT: usize = 1000;
const DOCKER_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// ── Error type ────────────────────────────────────────────────────────────────

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, sanitize_error(&message.to_string()))
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::not_found(format!("session not found: {id}")),
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Strip filesystem paths from text that leaves the process.  Callers never
/// need our directory layout, and storage errors love to embed it.
pub fn sanitize_error(message: &str) -> String {
    static PATH_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = PATH_RE.get_or_init(|| {
        regex::Regex::new(r"(?:/[A-Za-z0-9._-]+){2,}").expect("invalid path pattern")
    });
    let cleaned = re.replace_all(message, "[path]");
    cleaned.chars().take(500).collect()
}

// ── Health and usage ──────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Response {
    let database = state.runner.store().get_total_token_usage().is_ok();
    let docker = docker_available().await;
    let usage = state
        .runner
        .store()
        .get_total_token_usage()
        .unwrap_or_default();

    let healthy = database && docker;
    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "activeSessions": state.runner.active_sessions(),
        "maxConcurrentSessions": state.config.max_concurrent_sessions,
        "tokenBudget": state.config.token_budget,
        "totalTokensUsed": usage.total_tokens,
        "estimatedCostUsd": usage.estimated_cost_usd,
        "checks": { "database": database, "docker": docker },
    });
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body)).into_response()
}

async fn docker_available() -> bool {
    let probe = tokio::process::Command::new("docker")
        .arg("version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    matches!(
        tokio::time::timeout(DOCKER_PROBE_TIMEOUT, probe).await,
        Ok(Ok(status)) if status.success()
    )
}

pub async fn usage(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let total = state.runner.store().get_total_token_usage()?;
    Ok(Json(json!({ "total": usage_json(&total) })))
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    if !state.config.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    crate::metrics::render(&state).into_response()
}

// ── Prompt and cancel ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptBody {
    pub message: Option<String>,
    pub session_id: Option<String>,
    pub model: Option<String>,
}

pub async fn prompt(
    State(state): State<AppState>,
    Json(body): Json<PromptBody>,
) -> Result<Json<Value>, ApiError> {
    let message = body
        .message
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("message is required"))?;

    let outcome = state
        .runner
        .run(RunRequest { prompt: message, session_id: body.session_id, model: body.model })
        .await;

    match outcome {
        Ok(outcome) => Ok(Json(outcome_json(&outcome))),
        Err(e @ AgentError::ConcurrencyExceeded { .. }) => {
            Err(ApiError::new(StatusCode::TOO_MANY_REQUESTS, e.to_string()))
        }
        Err(e @ (AgentError::PromptTooLarge { .. } | AgentError::ModelNotAllowed(_))) => {
            Err(ApiError::bad_request(e.to_string()))
        }
        Err(e) => {
            error!(error = %e, "run failed");
            Err(ApiError::internal(e))
        }
    }
}

pub async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Value> {
    let cancelled = state.runner.cancel(&id);
    Json(json!({ "success": cancelled, "sessionId": id }))
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>, ApiError> {
    let store = state.runner.store();
    let sessions = match params.q.as_deref().filter(|q| !q.trim().is_empty()) {
        Some(query) => store.search_sessions(query, SESSION_LIST_LIMIT)?,
        None => store.list_sessions(SESSION_LIST_LIMIT)?,
    };
    let mut payload = Vec::with_capacity(sessions.len());
    for session in &sessions {
        let usage = store.get_session_token_usage(&session.id)?;
        let mut entry = session_json(session);
        entry["tokenUsage"] = usage_json(&usage);
        payload.push(entry);
    }
    Ok(Json(json!({ "sessions": payload })))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = state.runner.store();
    let session = store
        .get_session(&id)?
        .ok_or_else(|| ApiError::not_found(format!("session not found: {id}")))?;
    let messages = store.get_messages(&id, SESSION_MESSAGES_LIMIT)?;
    let usage = store.get_session_token_usage(&id)?;
    let stats = store.get_tool_call_stats(Some(&id))?;
    Ok(Json(json!({
        "session": session_json(&session),
        "messages": messages.iter().map(message_json).collect::<Vec<_>>(),
        "tokenUsage": usage_json(&usage),
        "toolStats": stats.iter().map(stats_json).collect::<Vec<_>>(),
    })))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.runner.store().delete_session(&id)? {
        Ok(Json(json!({ "success": true })))
    } else {
        Err(ApiError::not_found(format!("session not found: {id}")))
    }
}

#[derive(Debug, Deserialize)]
pub struct RenameBody {
    pub name: Option<String>,
}

pub async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<Json<Value>, ApiError> {
    let name = body
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("name is required"))?;
    state.runner.store().update_session_summary(&id, &name)?;
    Ok(Json(json!({ "success": true, "name": name })))
}

pub async fn pin_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let pinned = state.runner.store().toggle_pin(&id)?;
    Ok(Json(json!({ "pinned": pinned })))
}

#[derive(Debug, Deserialize)]
pub struct TagsBody {
    pub tags: Option<Vec<String>>,
}

pub async fn set_tags(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TagsBody>,
) -> Result<Json<Value>, ApiError> {
    let tags = body.tags.ok_or_else(|| ApiError::bad_request("tags array is required"))?;
    let tags = state.runner.store().set_tags(&id, &tags)?;
    Ok(Json(json!({ "tags": tags })))
}

// ── JSON mapping (camelCase wire shapes) ──────────────────────────────────────

pub fn session_json(session: &SessionRecord) -> Value {
    json!({
        "id": session.id,
        "workspaceDir": session.workspace_dir,
        "summary": session.summary,
        "inputTokens": session.input_tokens,
        "outputTokens": session.output_tokens,
        "pinned": session.pinned,
        "tags": session.tags,
        "createdAt": session.created_at,
        "updatedAt": session.updated_at,
    })
}

pub fn message_json(message: &MessageRecord) -> Value {
    json!({
        "id": message.id,
        "sessionId": message.session_id,
        "role": message.role,
        "content": message.content,
        "toolName": message.tool_name,
        "metadata": message.metadata,
        "createdAt": message.created_at,
    })
}

pub fn usage_json(usage: &TokenTotals) -> Value {
    json!({
        "inputTokens": usage.input_tokens,
        "outputTokens": usage.output_tokens,
        "totalTokens": usage.total_tokens,
        "estimatedCostUsd": usage.estimated_cost_usd,
    })
}

pub fn stats_json(stats: &ToolCallStats) -> Value {
    json!({
        "toolName": stats.tool_name,
        "calls": stats.calls,
        "successes": stats.successes,
        "avgDurationMs": stats.avg_duration_ms,
    })
}

pub fn outcome_json(outcome: &RunOutcome) -> Value {
    json!({
        "success": true,
        "sessionId": outcome.session_id,
        "status": outcome.status,
        "summary": outcome.summary,
        "toolCallsCount": outcome.tool_calls_count,
        "durationMs": outcome.duration_ms,
        "tokenUsage": {
            "inputTokens": outcome.token_usage.input_tokens,
            "outputTokens": outcome.token_usage.output_tokens,
            "totalTokens": outcome.token_usage.total_tokens,
        },
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
