// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use similar::TextDiff;
use tracing::debug;

use crate::approval::{PatchGate, PatchOperation};
use crate::builtin::require_str;
use crate::tool::{ProgressSink, Tool, ToolCall, ToolOutput};
use crate::workspace::{relative_display, resolve_path};

pub struct WriteFileTool {
    pub workspace: PathBuf,
    pub gate: Option<PatchGate>,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a file in the workspace, overwriting any existing content. \
         Parent directories are created automatically. Prefer apply_patch \
         for small edits to existing files."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" },
                "content": { "type": "string", "description": "Full new file content" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolOutput {
        let path = match require_str(call, "path") {
            Ok(p) => p,
            Err(e) => return *e,
        };
        let content = match require_str(call, "content") {
            Ok(c) => c,
            Err(e) => return *e,
        };
        let resolved = match resolve_path(&self.workspace, path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e),
        };
        let rel = relative_display(&self.workspace, &resolved);

        if let Some(gate) = &self.gate {
            let old = tokio::fs::read_to_string(&resolved).await.unwrap_or_default();
            let operation = if resolved.exists() {
                PatchOperation::Modify
            } else {
                PatchOperation::Create
            };
            let diff = TextDiff::from_lines(old.as_str(), content)
                .unified_diff()
                .header(&rel, &rel)
                .to_string();
            if !gate.approve(&call.session_id, &rel, diff, operation).await {
                return ToolOutput::err(&call.id, format!("Patch denied: {rel}"));
            }
        }

        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(&call.id, format!("mkdir error: {e}"));
            }
        }
        debug!(path = %rel, bytes = content.len(), "write_file");
        match tokio::fs::write(&resolved, content).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("wrote {} bytes to {rel}", content.len())),
            Err(e) => ToolOutput::err(&call.id, format!("write error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
