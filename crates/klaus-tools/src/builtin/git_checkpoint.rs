// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::git::{checkpoint, ensure_repo};
use crate::tool::{ProgressSink, Tool, ToolCall, ToolOutput};

/// Commit everything in the workspace as an agent-authored checkpoint.
///
/// The agent loop scans the staged diff for secrets BEFORE this tool is
/// dispatched; a hit synthesises a failed result and this handler never
/// runs.
pub struct GitCheckpointTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for GitCheckpointTool {
    fn name(&self) -> &str {
        "git_checkpoint"
    }

    fn description(&self) -> &str {
        "Stage all workspace changes and commit them as a checkpoint. Use \
         after completing a coherent unit of work so it can be rolled back \
         to later."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string", "description": "Commit message (default: 'checkpoint')" }
            }
        })
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolOutput {
        let message = call
            .args
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("checkpoint");

        if let Err(e) = ensure_repo(&self.workspace).await {
            return ToolOutput::err(&call.id, e);
        }
        match checkpoint(&self.workspace, message).await {
            Ok(hash) => ToolOutput::ok(&call.id, format!("checkpoint {hash}")),
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::run_git;

    #[tokio::test]
    async fn creates_an_agent_authored_commit() {
        let dir = tempfile::tempdir().unwrap();
        ensure_repo(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("work.txt"), "done").unwrap();

        let t = GitCheckpointTool { workspace: dir.path().to_path_buf() };
        let call = ToolCall {
            id: "g1".into(),
            session_id: "s".into(),
            name: "git_checkpoint".into(),
            args: json!({"message": "add work"}),
        };
        let out = t.execute(&call, &ProgressSink::discard()).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.starts_with("checkpoint "));

        let author = run_git(dir.path(), &["log", "-1", "--format=%an"]).await.unwrap();
        assert_eq!(author.trim(), "AI Agent");
    }
}
