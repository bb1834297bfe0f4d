// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::builtin::require_str;
use crate::tool::{ProgressSink, Tool, ToolCall, ToolOutput};
use crate::workspace::resolve_path;

pub struct ReadFileTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace. Returns the full content, or a line \
         range when offset/limit are given. Paths are workspace-relative."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" },
                "offset": { "type": "integer", "description": "1-based first line to return" },
                "limit": { "type": "integer", "description": "Maximum number of lines" }
            },
            "required": ["path"]
        })
    }

    fn read_only(&self) -> bool {
        true
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

        let bytes = match tokio::fs::read(&resolved).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };
        let content = String::from_utf8_lossy(&bytes);

        let offset = call.args.get("offset").and_then(|v| v.as_u64());
        let limit = call.args.get("limit").and_then(|v| v.as_u64());
        let text = match (offset, limit) {
            (None, None) => content.into_owned(),
            _ => {
                let skip = offset.unwrap_or(1).saturating_sub(1) as usize;
                let take = limit.unwrap_or(u64::MAX) as usize;
                content
                    .lines()
                    .skip(skip)
                    .take(take)
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };
        ToolOutput::ok(&call.id, text)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
