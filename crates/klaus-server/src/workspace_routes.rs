// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Workspace inspection over HTTP: the file tree (ETag-cached), single-file
//! reads (jailed, size-capped), and rollback to the last checkpoint.

use std::path::Path as FsPath;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use klaus_tools::{git, workspace::resolve_path};

use crate::routes::ApiError;
use crate::state::AppState;

const MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;
const MAX_TREE_ENTRIES: usize = 2000;
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv", "__pycache__"];

// ── Tree ──────────────────────────────────────────────────────────────────────

pub async fn tree(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let workspace = &state.config.workspace_dir;
    let tree = build_tree(workspace);
    let body = json!({
        "tree": tree,
        "workspace": workspace.display().to_string(),
    });

    let serialized = body.to_string();
    let etag = format!("\"{}\"", hex::encode(Sha256::digest(serialized.as_bytes())));

    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == etag)
        .unwrap_or(false)
    {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    (
        StatusCode::OK,
        [
            (header::ETAG, etag),
            (header::CACHE_CONTROL, "private, max-age=5".to_string()),
            (header::CONTENT_TYPE, "application/json".to_string()),
        ],
        serialized,
    )
        .into_response()
}

/// Flat listing of `{path, size}` entries, sorted, bounded.  A flat shape
/// keeps the ETag stable under serialization and is trivial for clients to
/// fold into a tree view.
fn build_tree(workspace: &FsPath) -> Vec<Value> {
    let mut entries: Vec<Value> = WalkDir::new(workspace)
        .into_iter()
        .filter_entry(|e| {
            e.file_name()
                .to_str()
                .map(|n| !SKIP_DIRS.contains(&n))
                .unwrap_or(true)
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .take(MAX_TREE_ENTRIES)
        .map(|e| {
            let size = e.metadata().map(|m| m.len()).unwrap_or(0);
            let path = e
                .path()
                .strip_prefix(workspace)
                .unwrap_or(e.path())
                .display()
                .to_string();
            json!({ "path": path, "size": size })
        })
        .collect();
    entries.sort_by(|a, b| a["path"].as_str().cmp(&b["path"].as_str()));
    entries
}

// ── File ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct FileParams {
    pub path: Option<String>,
}

pub async fn file(
    State(state): State<AppState>,
    Query(params): Query<FileParams>,
) -> Result<Json<Value>, ApiError> {
    let raw_path = params
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("path query parameter is required"))?;

    let resolved = resolve_path(&state.config.workspace_dir, &raw_path)
        .map_err(|_| ApiError::new(StatusCode::FORBIDDEN, "path is outside the workspace"))?;

    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|_| ApiError::not_found(format!("file not found: {raw_path}")))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found(format!("file not found: {raw_path}")));
    }
    if metadata.len() > MAX_FILE_BYTES {
        return Err(ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("file exceeds {} bytes", MAX_FILE_BYTES),
        ));
    }

    let bytes = tokio::fs::read(&resolved)
        .await
        .map_err(|_| ApiError::not_found(format!("file not found: {raw_path}")))?;
    Ok(Json(json!({
        "content": String::from_utf8_lossy(&bytes),
        "size": metadata.len(),
        "path": raw_path,
    })))
}

// ── Rollback ──────────────────────────────────────────────────────────────────

pub async fn rollback(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    git::rollback(&state.config.workspace_dir)
        .await
        .map_err(|e| ApiError::internal(format!("rollback failed: {e}")))?;
    Ok(Json(json!({ "success": true })))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
