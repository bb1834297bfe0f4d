// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-session event fan-out.
//!
//! Each run publishes [`AgentEvent`]s; subscribers (WebSocket bridges,
//! tests) receive them in emission order through a broadcast channel.
//! Delivery is best-effort: a subscriber joining mid-run misses what came
//! before, a lagging subscriber loses the oldest buffered events, and the
//! message log in the store remains the source of truth.  Subscribers run
//! in their own tasks, so nothing they do can fail the publishing run.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Buffered events per subscriber before the oldest are dropped.
const CHANNEL_CAPACITY: usize = 256;

/// Prune disconnected channels once the map grows past this.
const PRUNE_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Everything a run can tell its subscribers.  `complete` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    Thinking {},
    StreamDelta {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: String,
        success: bool,
        duration_ms: u64,
    },
    ToolProgress {
        tool_call_id: String,
        tool_name: String,
        progress: u8,
        status: String,
        elapsed_ms: u64,
    },
    Message {
        role: String,
        content: String,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retrying: Option<bool>,
        /// Human-readable backoff delay, set when `retrying` is true.
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_in: Option<String>,
    },
    BudgetWarning {
        used: u64,
        budget: u64,
        percent: f64,
    },
    BudgetExceeded {
        used: u64,
        budget: u64,
    },
    ToolLimitExceeded {
        used: usize,
        limit: usize,
    },
    TurnComplete {
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
        total_input_tokens: u64,
        total_output_tokens: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        budget_percent: Option<f64>,
    },
    PatchApprovalRequired {
        patch_id: String,
        file_path: String,
        diff: String,
        operation: String,
    },
    Complete {
        session_id: String,
        tool_calls_count: usize,
        duration_ms: u64,
        summary: String,
        token_usage: TokenUsageSummary,
    },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

/// The wire envelope: the tagged event plus its emission timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: AgentEvent,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn now(event: AgentEvent) -> Self {
        Self { event, timestamp: Utc::now() }
    }
}

/// Per-session broadcast fan-out.
#[derive(Default)]
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish to the session's subscribers.  No subscribers, no delivery;
    /// that is the contract, not an error.
    pub fn publish(&self, session_id: &str, event: AgentEvent) {
        let mut channels = self.channels.lock().unwrap();
        if channels.len() > PRUNE_THRESHOLD {
            channels.retain(|_, tx| tx.receiver_count() > 0);
        }
        let tx = channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        let _ = tx.send(Envelope::now(event));
    }

    /// Subscribe to a session's events from this point on.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<Envelope> {
        self.channels
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop channels with no live subscribers.
    pub fn prune(&self) {
        self.channels
            .lock()
            .unwrap()
            .retain(|_, tx| tx.receiver_count() > 0);
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
