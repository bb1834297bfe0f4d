// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Human-in-the-loop patch approval.
//!
//! A file-mutating tool that needs sign-off calls [`ApprovalBroker::request`]
//! and suspends until the operator answers, or until the timeout fires, in
//! which case the patch is denied.  Silence means no.
//!
//! The broker is process-wide state keyed by opaque patch id; the façade
//! resolves entries from `patch_approval_response` WebSocket messages
//! without ever seeing the requesting tool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOperation {
    Create,
    Modify,
    Delete,
}

/// What the operator is asked to approve.
#[derive(Debug, Clone, Serialize)]
pub struct PatchRequest {
    pub patch_id: String,
    pub file_path: String,
    pub diff: String,
    pub operation: PatchOperation,
}

#[derive(Default)]
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the request, emit it to the operator, and wait for the
    /// verdict.  Returns `false` on explicit denial or after `timeout`.
    ///
    /// At most one outstanding handle per patch id; ids are fresh UUIDs, so
    /// a collision is a caller bug.
    pub async fn request(
        &self,
        request: PatchRequest,
        emit: impl FnOnce(&PatchRequest),
        timeout: Duration,
    ) -> bool {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            let previous = pending.insert(request.patch_id.clone(), tx);
            debug_assert!(previous.is_none(), "duplicate patch id {}", request.patch_id);
        }
        emit(&request);
        debug!(patch = %request.patch_id, file = %request.file_path, "awaiting patch approval");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(approved)) => approved,
            // Sender dropped without an answer: treat like a denial.
            Ok(Err(_)) => false,
            Err(_) => {
                self.pending.lock().unwrap().remove(&request.patch_id);
                warn!(patch = %request.patch_id, "patch approval timed out, denying");
                false
            }
        }
    }

    /// Deliver the operator's verdict.  Returns `false` when the patch id is
    /// unknown (already resolved, timed out, or never requested).
    pub fn resolve(&self, patch_id: &str, approved: bool) -> bool {
        match self.pending.lock().unwrap().remove(patch_id) {
            Some(tx) => tx.send(approved).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Everything a file-mutating tool needs to ask for sign-off: the broker,
/// the configured timeout, and an emitter that routes the request to the
/// owning session's subscribers.
#[derive(Clone)]
pub struct PatchGate {
    pub broker: Arc<ApprovalBroker>,
    pub timeout: Duration,
    pub emit: Arc<dyn Fn(&str, &PatchRequest) + Send + Sync>,
}

impl PatchGate {
    /// Ask the operator to approve `operation` on `file_path`.
    pub async fn approve(
        &self,
        session_id: &str,
        file_path: &str,
        diff: String,
        operation: PatchOperation,
    ) -> bool {
        let request = PatchRequest {
            patch_id: uuid_like_id(),
            file_path: file_path.to_string(),
            diff,
            operation,
        };
        let session = session_id.to_string();
        let emit = Arc::clone(&self.emit);
        self.broker
            .request(request, move |req| emit(&session, req), self.timeout)
            .await
    }
}

/// Unique patch id without pulling uuid into this crate's public surface.
fn uuid_like_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("patch-{nanos:x}-{:x}", std::process::id())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
