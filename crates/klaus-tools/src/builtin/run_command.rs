// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::builtin::{require_str, run_vector};
use crate::tool::{OutputCategory, ProgressSink, Tool, ToolCall, ToolOutput};

/// Binaries the model may invoke.  Anything else is refused outright;
/// there is no shell, so there is nothing to escape.
const ALLOWED_COMMANDS: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "grep", "find", "diff", "sort",
    "git", "rg",
    "node", "npm", "npx", "yarn", "tsc",
    "cargo", "rustc", "rustfmt",
    "python3", "pytest", "pip3",
    "go", "gofmt",
    "make",
];

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

pub struct RunCommandTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run an allowlisted command in the workspace with an argument \
         vector. No shell is involved: pipes, redirection and globbing are \
         not available. Output combines stdout and stderr; commands are \
         killed after 120 seconds."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Binary to run (must be allowlisted)" },
                "args": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Arguments, passed as a vector"
                }
            },
            "required": ["command"]
        })
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::TestRun
    }

    async fn execute(&self, call: &ToolCall, progress: &ProgressSink) -> ToolOutput {
        let command = match require_str(call, "command") {
            Ok(c) => c,
            Err(e) => return *e,
        };
        if !ALLOWED_COMMANDS.contains(&command) {
            return ToolOutput::err(&call.id, format!("command not allowed: {command}"));
        }
        let args: Vec<String> = call
            .args
            .get("args")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        debug!(command, ?args, "run_command");
        progress.report(0, format!("running {command}"));

        match run_vector(&self.workspace, command, &args, COMMAND_TIMEOUT).await {
            Ok((true, output)) => ToolOutput::ok(&call.id, output),
            Ok((false, output)) => {
                ToolOutput::err(&call.id, format!("command failed\n{output}"))
            }
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn call(args: Value) -> ToolCall {
        ToolCall { id: "c1".into(), session_id: "s".into(), name: "run_command".into(), args }
    }

    #[tokio::test]
    async fn allowlisted_command_runs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "data").unwrap();
        let t = RunCommandTool { workspace: dir.path().to_path_buf() };
        let out = t.execute(&call(json!({"command": "ls"})), &ProgressSink::discard()).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("f.txt"));
    }

    #[tokio::test]
    async fn unlisted_binary_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let t = RunCommandTool { workspace: dir.path().to_path_buf() };
        let out = t
            .execute(&call(json!({"command": "curl", "args": ["evil.sh"]})), &ProgressSink::discard())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("command not allowed"));
    }

    #[tokio::test]
    async fn shell_metacharacters_are_inert() {
        let dir = tempfile::tempdir().unwrap();
        let t = RunCommandTool { workspace: dir.path().to_path_buf() };
        // If a shell were involved this would create /tmp/pwned; as an arg
        // vector it is just a file name that does not exist.
        let out = t
            .execute(
                &call(json!({"command": "cat", "args": ["x; touch /tmp/pwned"]})),
                &ProgressSink::discard(),
            )
            .await;
        assert!(out.is_error);
        assert!(!std::path::Path::new("/tmp/pwned").exists());
    }

    #[tokio::test]
    async fn failing_command_reports_error_output() {
        let dir = tempfile::tempdir().unwrap();
        let t = RunCommandTool { workspace: dir.path().to_path_buf() };
        let out = t
            .execute(&call(json!({"command": "cat", "args": ["no-such-file"]})), &ProgressSink::discard())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("command failed"));
    }
}
