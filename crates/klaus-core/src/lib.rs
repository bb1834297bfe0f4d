// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The agent orchestration runtime.
//!
//! [`AgentRunner::run`] drives one run: admission (model allow-set,
//! concurrency slot, prompt size), context assembly, the model ↔ tool turn
//! loop with budget/tool-limit/cancellation enforcement, and the terminal
//! summary.  Progress streams to subscribers through the per-session
//! [`EventBus`]; everything durable goes through `klaus-store`.

mod agent;
mod context;
mod error;
mod events;
mod limits;
mod shrink;
#[cfg(test)]
mod tests;

pub use agent::{AgentRunner, RunOutcome, RunRequest, RunStatus};
pub use context::ContextBuilder;
pub use error::AgentError;
pub use events::{AgentEvent, Envelope, EventBus, TokenUsageSummary};
pub use limits::{CancelRegistry, SessionCounter, SessionPermit};
pub use shrink::shrink_tool_result;
