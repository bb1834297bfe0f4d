// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::builtin::run_vector;
use crate::tool::{OutputCategory, ProgressSink, Tool, ToolCall, ToolOutput};

const CHECK_TIMEOUT: Duration = Duration::from_secs(300);

/// Type-check-only compilation.  Produces diagnostics without emitting
/// artifacts, so it counts as read-only and may run in parallel with other
/// reads.
pub struct CheckTypesTool {
    pub workspace: PathBuf,
}

impl CheckTypesTool {
    /// Pick the checker from the project files present in the workspace.
    fn detect(&self) -> Option<(&'static str, Vec<String>)> {
        let has = |name: &str| self.workspace.join(name).exists();
        if has("tsconfig.json") {
            Some(("npx", vec!["tsc".into(), "--noEmit".into()]))
        } else if has("Cargo.toml") {
            Some(("cargo", vec!["check".into(), "--quiet".into()]))
        } else if has("go.mod") {
            Some(("go", vec!["vet".into(), "./...".into()]))
        } else {
            None
        }
    }
}

#[async_trait]
impl Tool for CheckTypesTool {
    fn name(&self) -> &str {
        "check_types"
    }

    fn description(&self) -> &str {
        "Run the project's type checker without building anything: tsc \
         --noEmit for TypeScript, cargo check for Rust, go vet for Go. The \
         checker is chosen from the project files in the workspace."
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn read_only(&self) -> bool {
        true
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::TestRun
    }

    async fn execute(&self, call: &ToolCall, progress: &ProgressSink) -> ToolOutput {
        let Some((program, args)) = self.detect() else {
            return ToolOutput::err(
                &call.id,
                "no type-check target detected (looked for tsconfig.json, Cargo.toml, go.mod)",
            );
        };
        progress.report(0, format!("running {program}"));
        match run_vector(&self.workspace, program, &args, CHECK_TIMEOUT).await {
            Ok((true, output)) => {
                let output = if output.trim().is_empty() {
                    "type check passed".to_string()
                } else {
                    output
                };
                ToolOutput::ok(&call.id, output)
            }
            Ok((false, output)) => ToolOutput::err(&call.id, output),
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_typescript_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tsconfig.json"), "{}").unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        let t = CheckTypesTool { workspace: dir.path().to_path_buf() };
        assert_eq!(t.detect().unwrap().0, "npx");
    }

    #[test]
    fn detects_rust() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        let t = CheckTypesTool { workspace: dir.path().to_path_buf() };
        assert_eq!(t.detect().unwrap().0, "cargo");
    }

    #[tokio::test]
    async fn empty_workspace_has_no_target() {
        let dir = tempfile::tempdir().unwrap();
        let t = CheckTypesTool { workspace: dir.path().to_path_buf() };
        let call = ToolCall {
            id: "t1".into(),
            session_id: "s".into(),
            name: "check_types".into(),
            args: json!({}),
        };
        let out = t.execute(&call, &ProgressSink::discard()).await;
        assert!(out.is_error);
        assert!(out.content.contains("no type-check target"));
    }
}
