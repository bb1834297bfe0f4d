// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::builtin::require_str;
use crate::tool::{OutputCategory, ProgressSink, Tool, ToolCall, ToolOutput};
use crate::workspace::{relative_display, resolve_path};

const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv", "__pycache__"];
const MAX_MATCHES: usize = 500;

pub struct SearchFilesTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search workspace files line-by-line with a regular expression. \
         Returns a JSON array of {file, line, text} match objects, capped at \
         500 matches. Binary files are skipped."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regular expression to search for" },
                "path": { "type": "string", "description": "Directory to search (default: workspace root)" }
            },
            "required": ["pattern"]
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::Matches
    }

    async fn execute(&self, call: &ToolCall, progress: &ProgressSink) -> ToolOutput {
        let pattern = match require_str(call, "pattern") {
            Ok(p) => p,
            Err(e) => return *e,
        };
        let re = match regex::Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => return ToolOutput::err(&call.id, format!("invalid pattern: {e}")),
        };
        let path = call.args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let root = match resolve_path(&self.workspace, path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e),
        };

        let mut matches: Vec<Value> = Vec::new();
        let mut scanned = 0usize;
        'files: for entry in WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| !SKIP_DIRS.contains(&n))
                    .unwrap_or(true)
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            scanned += 1;
            if scanned % 200 == 0 {
                progress.report(99.min(scanned / 50) as u8, format!("scanned {scanned} files"));
            }
            let Ok(bytes) = tokio::fs::read(entry.path()).await else { continue };
            if bytes.contains(&0) {
                continue; // binary
            }
            let content = String::from_utf8_lossy(&bytes);
            for (i, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    matches.push(json!({
                        "file": relative_display(&self.workspace, entry.path()),
                        "line": i + 1,
                        "text": line.trim_end(),
                    }));
                    if matches.len() >= MAX_MATCHES {
                        break 'files;
                    }
                }
            }
        }

        match serde_json::to_string(&matches) {
            Ok(out) => ToolOutput::ok(&call.id, out),
            Err(e) => ToolOutput::err(&call.id, format!("serialization error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
