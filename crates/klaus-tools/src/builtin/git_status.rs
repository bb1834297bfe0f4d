// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::git::run_git;
use crate::tool::{ProgressSink, Tool, ToolCall, ToolOutput};

pub struct GitStatusTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for GitStatusTool {
    fn name(&self) -> &str {
        "git_status"
    }

    fn description(&self) -> &str {
        "Show the workspace git status in porcelain format."
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolOutput {
        match run_git(&self.workspace, &["status", "--porcelain"]).await {
            Ok(out) if out.trim().is_empty() => {
                ToolOutput::ok(&call.id, "working tree clean")
            }
            Ok(out) => ToolOutput::ok(&call.id, out),
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
}
