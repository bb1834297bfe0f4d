// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Tool catalogue and dispatcher.
//!
//! Every capability the model can invoke is a [`Tool`]: a name, a JSON
//! Schema for its input, a read-only flag, and an async handler.  The
//! [`ToolRegistry`] holds the catalogue; the [`ToolDispatcher`] validates
//! input BEFORE the handler runs, executes, and records every invocation
//! in the store, including unknown-tool and validation failures.
//!
//! Read-only tools (file reads, listings, searches, git status/diff, memory
//! reads, type checks) are safe to run in parallel within one turn; all
//! other tools mutate the workspace and run strictly sequentially.
//!
//! Filesystem tools never touch a path outside the workspace: see
//! [`workspace::resolve_path`].  Shell execution passes argument vectors;
//! there is no shell string interpretation anywhere in this crate.

pub mod approval;
pub mod builtin;
pub mod git;
pub mod registry;
pub mod secrets;
pub mod tool;
pub mod workspace;

pub use approval::{ApprovalBroker, PatchGate, PatchOperation, PatchRequest};
pub use registry::{DispatchResult, ToolDispatcher, ToolRegistry};
pub use tool::{OutputCategory, ProgressSink, Tool, ToolCall, ToolOutput, ToolProgress};
