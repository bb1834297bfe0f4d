// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Durable persistence for agent sessions.
//!
//! A single embedded SQLite database holds sessions, their append-only
//! message log, tool-call records, the token-usage ledger, and the
//! process-wide knowledge key-value store.  Sessions own their messages,
//! tool calls and token usage by composition: deleting a session cascades.
//!
//! The connection lives behind a mutex; SQLite serialises writes anyway,
//! and a single writer keeps the WAL small.  All read paths go through the
//! same handle.
//!
//! Dollar cost is never stored.  It is recomputed from the per-model price
//! table on every query so a price correction retroactively fixes history.

mod error;
mod pricing;
mod store;

pub use error::StoreError;
pub use pricing::{estimate_cost, pricing_for, ModelPricing};
pub use store::{
    FileChange, KnowledgeRecord, MessageRecord, NewMessage, NewToolCall, SessionRecord, Store,
    TokenTotals, ToolCallRecord, ToolCallStats,
};
