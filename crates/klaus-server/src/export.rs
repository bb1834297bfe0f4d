// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Session export: the full stored record as JSON, or a human-readable
//! markdown transcript.  Either way the response downloads as a file.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use klaus_store::{MessageRecord, SessionRecord, TokenTotals};

use crate::routes::{message_json, session_json, usage_json, ApiError};
use crate::state::AppState;

const EXPORT_MESSAGES_LIMIT: usize = 10_000;

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    pub format: Option<String>,
}

pub async fn export_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ExportParams>,
) -> Result<Response, ApiError> {
    let store = state.runner.store();
    let session = store
        .get_session(&id)?
        .ok_or_else(|| ApiError::not_found(format!("session not found: {id}")))?;
    let messages = store.get_messages(&id, EXPORT_MESSAGES_LIMIT)?;
    let usage = store.get_session_token_usage(&id)?;

    match params.format.as_deref().unwrap_or("json") {
        "markdown" | "md" => {
            let body = render_markdown(&session, &messages, &usage);
            Ok(download(body, &format!("session-{id}.md"), "text/markdown; charset=utf-8"))
        }
        "json" => {
            let body = json!({
                "session": session_json(&session),
                "messages": messages.iter().map(message_json).collect::<Vec<_>>(),
                "tokenUsage": usage_json(&usage),
            });
            let text = serde_json::to_string_pretty(&body)
                .map_err(ApiError::internal)?;
            Ok(download(text, &format!("session-{id}.json"), "application/json"))
        }
        other => Err(ApiError::bad_request(format!(
            "unsupported format '{other}' (expected json or markdown)"
        ))),
    }
}

fn download(body: String, filename: &str, content_type: &str) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}

fn render_markdown(
    session: &SessionRecord,
    messages: &[MessageRecord],
    usage: &TokenTotals,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Session {}\n\n", session.id));
    if let Some(summary) = &session.summary {
        out.push_str(&format!("**Summary:** {summary}\n\n"));
    }
    out.push_str(&format!(
        "- Workspace: `{}`\n- Created: {}\n- Updated: {}\n",
        session.workspace_dir,
        session.created_at.to_rfc3339(),
        session.updated_at.to_rfc3339(),
    ));
    if !session.tags.is_empty() {
        out.push_str(&format!("- Tags: {}\n", session.tags.join(", ")));
    }

    out.push_str("\n## Conversation\n\n");
    for message in messages {
        let heading = match (message.role.as_str(), &message.tool_name) {
            ("tool", Some(tool)) => format!("Tool · {tool}"),
            (role, _) => {
                let mut chars = role.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => role.to_string(),
                }
            }
        };
        out.push_str(&format!(
            "### {heading} — {}\n\n{}\n\n",
            message.created_at.to_rfc3339(),
            message.content,
        ));
    }

    out.push_str(&format!(
        "## Token Usage\n\n- Input: {}\n- Output: {}\n- Total: {}\n- Estimated cost: ${:.4}\n",
        usage.input_tokens, usage.output_tokens, usage.total_tokens, usage.estimated_cost_usd,
    ));
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
