// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use similar::TextDiff;

use crate::approval::{PatchGate, PatchOperation};
use crate::builtin::require_str;
use crate::tool::{ProgressSink, Tool, ToolCall, ToolOutput};
use crate::workspace::{relative_display, resolve_path};

pub struct DeleteFileTool {
    pub workspace: PathBuf,
    pub gate: Option<PatchGate>,
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a single file from the workspace. Directories cannot be \
         deleted with this tool."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolOutput {
        let path = match require_str(call, "path") {
            Ok(p) => p,
            Err(e) => return *e,
        };
        let resolved = match resolve_path(&self.workspace, path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e),
        };
        let rel = relative_display(&self.workspace, &resolved);

        if !resolved.is_file() {
            return ToolOutput::err(&call.id, format!("not a file: {rel}"));
        }

        if let Some(gate) = &self.gate {
            let old = tokio::fs::read_to_string(&resolved).await.unwrap_or_default();
            let diff = TextDiff::from_lines(old.as_str(), "")
                .unified_diff()
                .header(&rel, "/dev/null")
                .to_string();
            if !gate.approve(&call.session_id, &rel, diff, PatchOperation::Delete).await {
                return ToolOutput::err(&call.id, format!("Patch denied: {rel}"));
            }
        }

        match tokio::fs::remove_file(&resolved).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("deleted {rel}")),
            Err(e) => ToolOutput::err(&call.id, format!("delete error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
