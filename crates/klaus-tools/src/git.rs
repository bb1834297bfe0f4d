// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Git plumbing shared by the git tools and the agent loop's checkpoint
//! gate.  Everything goes through argument vectors; no shell.

use std::path::Path;

use tokio::process::Command;
use tracing::debug;

pub const CHECKPOINT_AUTHOR_NAME: &str = "AI Agent";
pub const CHECKPOINT_AUTHOR_EMAIL: &str = "klaus-code@localhost";

/// Run `git <args>` in `workspace`.  Returns stdout on success; the error
/// string carries stderr for tool results.
pub async fn run_git(workspace: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace)
        .output()
        .await
        .map_err(|e| format!("failed to run git: {e}"))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// Initialise the workspace repository if `.git` is missing, configuring
/// the checkpoint author identity.
pub async fn ensure_repo(workspace: &Path) -> Result<(), String> {
    if workspace.join(".git").exists() {
        return Ok(());
    }
    debug!(workspace = %workspace.display(), "initialising git repository");
    run_git(workspace, &["init", "--quiet"]).await?;
    run_git(workspace, &["config", "user.name", CHECKPOINT_AUTHOR_NAME]).await?;
    run_git(workspace, &["config", "user.email", CHECKPOINT_AUTHOR_EMAIL]).await?;
    Ok(())
}

/// Stage everything and return the staged diff.  This is what the secret
/// scanner inspects before a checkpoint is allowed to run.
pub async fn staged_diff(workspace: &Path) -> Result<String, String> {
    run_git(workspace, &["add", "-A"]).await?;
    run_git(workspace, &["diff", "--cached"]).await
}

/// Stage everything and commit as the agent author.  Returns the new commit
/// hash.  An empty stage is reported as an error string ("nothing to
/// commit"), not a success.
pub async fn checkpoint(workspace: &Path, message: &str) -> Result<String, String> {
    run_git(workspace, &["add", "-A"]).await?;
    run_git(
        workspace,
        &[
            "-c",
            &format!("user.name={CHECKPOINT_AUTHOR_NAME}"),
            "-c",
            &format!("user.email={CHECKPOINT_AUTHOR_EMAIL}"),
            "commit",
            "--quiet",
            "-m",
            message,
        ],
    )
    .await?;
    let hash = run_git(workspace, &["rev-parse", "HEAD"]).await?;
    Ok(hash.trim().to_string())
}

/// Discard all uncommitted changes (tracked and untracked).
pub async fn rollback(workspace: &Path) -> Result<(), String> {
    run_git(workspace, &["reset", "--hard", "HEAD"]).await?;
    run_git(workspace, &["clean", "-fd", "--quiet"]).await?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        ensure_repo(dir.path()).await.unwrap();
        dir
    }

    #[tokio::test]
    async fn ensure_repo_is_idempotent() {
        let dir = repo().await;
        ensure_repo(dir.path()).await.unwrap();
        assert!(dir.path().join(".git").exists());
    }

    #[tokio::test]
    async fn staged_diff_shows_new_files() {
        let dir = repo().await;
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let diff = staged_diff(dir.path()).await.unwrap();
        assert!(diff.contains("a.txt"));
        assert!(diff.contains("+hello"));
    }

    #[tokio::test]
    async fn checkpoint_creates_a_commit() {
        let dir = repo().await;
        std::fs::write(dir.path().join("a.txt"), "v1\n").unwrap();
        let hash = checkpoint(dir.path(), "first checkpoint").await.unwrap();
        assert_eq!(hash.len(), 40);

        let log = run_git(dir.path(), &["log", "-1", "--format=%an <%ae> %s"])
            .await
            .unwrap();
        assert!(log.contains("AI Agent <klaus-code@localhost> first checkpoint"));
    }

    #[tokio::test]
    async fn empty_checkpoint_is_an_error() {
        let dir = repo().await;
        assert!(checkpoint(dir.path(), "nothing staged").await.is_err());
    }

    #[tokio::test]
    async fn rollback_discards_uncommitted_changes() {
        let dir = repo().await;
        std::fs::write(dir.path().join("a.txt"), "v1\n").unwrap();
        checkpoint(dir.path(), "base").await.unwrap();
        std::fs::write(dir.path().join("a.txt"), "v2\n").unwrap();
        std::fs::write(dir.path().join("junk.txt"), "x\n").unwrap();

        rollback(dir.path()).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "v1\n");
        assert!(!dir.path().join("junk.txt").exists());
    }
}
