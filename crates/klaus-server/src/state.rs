// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::sync::broadcast;

use klaus_config::Config;
use klaus_core::AgentRunner;
use klaus_tools::ApprovalBroker;

use crate::auth::RateLimiter;

/// Shared façade state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<AgentRunner>,
    pub broker: Arc<ApprovalBroker>,
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub owners: Arc<SessionOwners>,
    /// Fired once at shutdown so WebSocket clients get a goodbye frame.
    pub shutdown: broadcast::Sender<()>,
    pub started_at: Instant,
}

/// WebSocket session ownership.
///
/// The first socket to join a session id becomes its owner; later sockets
/// may join only when the session already exists in the store.  Each entry
/// holds a weak handle to the owning connection's liveness token, so
/// entries whose owner vanished are swept without any unregister call.
#[derive(Default)]
pub struct SessionOwners {
    owners: Mutex<HashMap<String, OwnerEntry>>,
}

struct OwnerEntry {
    socket_id: String,
    alive: Weak<()>,
}

impl SessionOwners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to join `session_id` from `socket_id`.
    pub fn try_join(
        &self,
        session_id: &str,
        socket_id: &str,
        alive: &Arc<()>,
        exists_in_store: bool,
    ) -> Result<(), &'static str> {
        let mut owners = self.owners.lock().unwrap();
        match owners.get(session_id) {
            Some(entry) if entry.alive.upgrade().is_some() => {
                if entry.socket_id == socket_id || exists_in_store {
                    Ok(())
                } else {
                    Err("session is owned by another connection")
                }
            }
            // No owner, or the owner's socket is gone: take ownership.
            _ => {
                owners.insert(
                    session_id.to_string(),
                    OwnerEntry {
                        socket_id: socket_id.to_string(),
                        alive: Arc::downgrade(alive),
                    },
                );
                Ok(())
            }
        }
    }

    /// Drop entries whose owning socket has disconnected.
    pub fn sweep(&self) -> usize {
        let mut owners = self.owners.lock().unwrap();
        let before = owners.len();
        owners.retain(|_, entry| entry.alive.upgrade().is_some());
        before - owners.len()
    }

    pub fn len(&self) -> usize {
        self.owners.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
