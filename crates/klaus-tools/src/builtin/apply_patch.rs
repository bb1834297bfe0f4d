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

/// Exact-match search/replace edit.  The `old_text` must occur exactly once
/// so an edit can never silently land in the wrong place.
pub struct ApplyPatchTool {
    pub workspace: PathBuf,
    pub gate: Option<PatchGate>,
}

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Edit an existing file by replacing old_text with new_text. old_text \
         must match exactly one location in the file; include enough \
         surrounding context to make it unique."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" },
                "old_text": { "type": "string", "description": "Exact text to replace" },
                "new_text": { "type": "string", "description": "Replacement text" }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolOutput {
        let path = match require_str(call, "path") {
            Ok(p) => p,
            Err(e) => return *e,
        };
        let old_text = match require_str(call, "old_text") {
            Ok(t) => t,
            Err(e) => return *e,
        };
        let new_text = match require_str(call, "new_text") {
            Ok(t) => t,
            Err(e) => return *e,
        };
        let resolved = match resolve_path(&self.workspace, path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e),
        };
        let rel = relative_display(&self.workspace, &resolved);

        let current = match tokio::fs::read_to_string(&resolved).await {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };

        let occurrences = current.matches(old_text).count();
        if occurrences == 0 {
            return ToolOutput::err(&call.id, format!("old_text not found in {rel}"));
        }
        if occurrences > 1 {
            return ToolOutput::err(
                &call.id,
                format!("old_text is ambiguous in {rel} ({occurrences} matches); add more context"),
            );
        }
        let updated = current.replacen(old_text, new_text, 1);

        if let Some(gate) = &self.gate {
            let diff = TextDiff::from_lines(&current, &updated)
                .unified_diff()
                .header(&rel, &rel)
                .to_string();
            if !gate.approve(&call.session_id, &rel, diff, PatchOperation::Modify).await {
                return ToolOutput::err(&call.id, format!("Patch denied: {rel}"));
            }
        }

        match tokio::fs::write(&resolved, &updated).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("patched {rel}")),
            Err(e) => ToolOutput::err(&call.id, format!("write error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
