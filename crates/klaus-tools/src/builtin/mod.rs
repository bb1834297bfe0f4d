// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The builtin tool set.
//!
//! Filesystem tools resolve every path through the workspace jail; shell
//! tools run allowlisted binaries with argument vectors.  File-mutating
//! tools optionally carry a [`PatchGate`] so every write can be held for
//! operator approval.

mod apply_patch;
mod check_types;
mod delete_file;
mod git_checkpoint;
mod git_diff;
mod git_status;
mod list_dir;
mod memory_get;
mod memory_set;
mod read_file;
mod run_command;
mod search_files;
mod write_file;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use klaus_store::Store;

pub use apply_patch::ApplyPatchTool;
pub use check_types::CheckTypesTool;
pub use delete_file::DeleteFileTool;
pub use git_checkpoint::GitCheckpointTool;
pub use git_diff::GitDiffTool;
pub use git_status::GitStatusTool;
pub use list_dir::ListDirTool;
pub use memory_get::MemoryGetTool;
pub use memory_set::MemorySetTool;
pub use read_file::ReadFileTool;
pub use run_command::RunCommandTool;
pub use search_files::SearchFilesTool;
pub use write_file::WriteFileTool;

use crate::{approval::PatchGate, ToolCall, ToolOutput, ToolRegistry};

/// Build the full builtin registry for one workspace.
pub fn standard_registry(
    workspace: PathBuf,
    store: Arc<Store>,
    gate: Option<PatchGate>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool { workspace: workspace.clone() });
    registry.register(ListDirTool { workspace: workspace.clone() });
    registry.register(SearchFilesTool { workspace: workspace.clone() });
    registry.register(WriteFileTool { workspace: workspace.clone(), gate: gate.clone() });
    registry.register(ApplyPatchTool { workspace: workspace.clone(), gate: gate.clone() });
    registry.register(DeleteFileTool { workspace: workspace.clone(), gate });
    registry.register(RunCommandTool { workspace: workspace.clone() });
    registry.register(CheckTypesTool { workspace: workspace.clone() });
    registry.register(GitStatusTool { workspace: workspace.clone() });
    registry.register(GitDiffTool { workspace: workspace.clone() });
    registry.register(GitCheckpointTool { workspace });
    registry.register(MemoryGetTool { store: Arc::clone(&store) });
    registry.register(MemorySetTool { store });
    registry
}

/// Extract a required string argument, or produce the error result the
/// model will see.  The dispatcher validates schemas up front; this guard
/// keeps tools safe when invoked directly.
pub(crate) fn require_str<'a>(
    call: &'a ToolCall,
    key: &str,
) -> Result<&'a str, Box<ToolOutput>> {
    call.args
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            Box::new(ToolOutput::err(
                &call.id,
                format!("missing required parameter '{key}'"),
            ))
        })
}

/// Run `program args...` in `workspace` with a hard timeout, merging stdout
/// and stderr.  Used by the shell-like tools; never goes through a shell.
pub(crate) async fn run_vector(
    workspace: &Path,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<(bool, String), String> {
    let child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(workspace)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| format!("command timed out after {}s", timeout.as_secs()))?
        .map_err(|e| format!("failed to run {program}: {e}"))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr.trim_end());
    }
    Ok((output.status.success(), text))
}
