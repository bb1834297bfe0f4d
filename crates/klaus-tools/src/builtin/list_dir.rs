// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::tool::{OutputCategory, ProgressSink, Tool, ToolCall, ToolOutput};
use crate::workspace::{relative_display, resolve_path};

/// Directories that are never worth listing to the model.
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv", "__pycache__"];

const MAX_ENTRIES: usize = 5000;

pub struct ListDirTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "Recursively list files under a workspace directory. Returns a JSON \
         array of workspace-relative paths. Build caches and VCS internals \
         are skipped."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default: workspace root)" }
            }
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::Listing
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolOutput {
        let path = call.args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let root = match resolve_path(&self.workspace, path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e),
        };
        if !root.is_dir() {
            return ToolOutput::err(&call.id, format!("not a directory: {path}"));
        }

        let mut entries: Vec<String> = WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| !SKIP_DIRS.contains(&n))
                    .unwrap_or(true)
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| relative_display(&self.workspace, e.path()))
            .take(MAX_ENTRIES)
            .collect();
        entries.sort();

        match serde_json::to_string(&entries) {
            Ok(listing) => ToolOutput::ok(&call.id, listing),
            Err(e) => ToolOutput::err(&call.id, format!("serialization error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
