// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The workspace jail.
//!
//! Every user- or model-supplied path is resolved through [`resolve_path`]
//! before any filesystem access.  Leading separators are stripped (an
//! "absolute" path from the model means workspace-relative), `..` components
//! are resolved lexically, and the result must be the workspace itself or a
//! descendant of it, checked on component boundaries, so a sibling
//! directory like `/ws-evil` can never pass for `/ws`.

use std::path::{Component, Path, PathBuf};

/// Resolve `user_path` inside `workspace`.
///
/// Returns the absolute resolved path, or an error string suitable for a
/// tool result when the path would land outside the workspace.
pub fn resolve_path(workspace: &Path, user_path: &str) -> Result<PathBuf, String> {
    let trimmed = user_path.trim_start_matches(['/', '\\']);
    let joined = workspace.join(trimmed);

    let mut resolved = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(format!("path is outside the workspace: {user_path}"));
                }
            }
            Component::CurDir => {}
            other => resolved.push(other),
        }
    }

    if resolved == workspace || resolved.starts_with(workspace) {
        Ok(resolved)
    } else {
        Err(format!("path is outside the workspace: {user_path}"))
    }
}

/// Workspace-relative display form for logs and tool results.
pub fn relative_display(workspace: &Path, path: &Path) -> String {
    path.strip_prefix(workspace)
        .unwrap_or(path)
        .display()
        .to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ws() -> PathBuf {
        PathBuf::from("/home/agent/workspace")
    }

    #[test]
    fn relative_path_resolves_inside() {
        let p = resolve_path(&ws(), "src/main.rs").unwrap();
        assert_eq!(p, ws().join("src/main.rs"));
    }

    #[test]
    fn leading_slash_is_workspace_relative() {
        let p = resolve_path(&ws(), "/src/main.rs").unwrap();
        assert_eq!(p, ws().join("src/main.rs"));
    }

    #[test]
    fn parent_traversal_is_rejected() {
        assert!(resolve_path(&ws(), "../../etc/passwd").is_err());
        assert!(resolve_path(&ws(), "src/../../../etc/passwd").is_err());
    }

    #[test]
    fn internal_parent_components_resolve_lexically() {
        let p = resolve_path(&ws(), "src/../docs/readme.md").unwrap();
        assert_eq!(p, ws().join("docs/readme.md"));
    }

    #[test]
    fn sibling_prefix_does_not_fool_the_boundary_check() {
        // /home/agent/workspace-evil shares a string prefix with the
        // workspace but is not a descendant.
        let evil = resolve_path(&ws(), "../workspace-evil/x");
        assert!(evil.is_err());
    }

    #[test]
    fn workspace_root_itself_is_allowed() {
        let p = resolve_path(&ws(), ".").unwrap();
        assert_eq!(p, ws());
    }

    #[test]
    fn relative_display_strips_workspace_prefix() {
        let p = ws().join("src/a.rs");
        assert_eq!(relative_display(&ws(), &p), "src/a.rs");
    }
}
