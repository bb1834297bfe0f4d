// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::git::run_git;
use crate::tool::{ProgressSink, Tool, ToolCall, ToolOutput};

pub struct GitDiffTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for GitDiffTool {
    fn name(&self) -> &str {
        "git_diff"
    }

    fn description(&self) -> &str {
        "Show uncommitted changes in the workspace. Pass staged=true for the \
         staged diff instead of the working-tree diff."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "staged": { "type": "boolean", "description": "Diff the index instead of the working tree" }
            }
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolOutput {
        let staged = call.args.get("staged").and_then(|v| v.as_bool()).unwrap_or(false);
        let args: &[&str] = if staged { &["diff", "--cached"] } else { &["diff"] };
        match run_git(&self.workspace, args).await {
            Ok(out) if out.trim().is_empty() => ToolOutput::ok(&call.id, "no changes"),
            Ok(out) => ToolOutput::ok(&call.id, out),
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
}
