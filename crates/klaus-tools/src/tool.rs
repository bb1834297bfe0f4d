// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model, forwarded verbatim.
    pub id: String,
    /// Session this call executes on behalf of.
    pub session_id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// True when the tool failed non-fatally; the message goes back to the
    /// model as an error result.
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: content.into(), is_error: false }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: msg.into(), is_error: true }
    }
}

/// Describes the shape of a tool's output so the loop can pick the right
/// shrinking strategy when a result exceeds the context cap.  Each tool
/// declares its own category; nothing upstream hard-codes tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// A JSON array of paths (directory listings).
    Listing,
    /// A JSON array of match objects (file search).
    Matches,
    /// Process output where the preamble and the verdict both matter
    /// (test runners, type checkers).
    TestRun,
    /// Anything else.
    #[default]
    Generic,
}

/// Advisory progress report from a long-running tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolProgress {
    pub tool_call_id: String,
    pub tool_name: String,
    /// Percentage in `[0, 100]`.
    pub progress: u8,
    pub status: String,
    pub elapsed_ms: u64,
}

/// Handed to every tool execution; reports are forwarded to the run's
/// subscriber and never flow-controlled.
#[derive(Clone)]
pub struct ProgressSink {
    call_id: String,
    tool_name: String,
    started: Instant,
    emit: Option<Arc<dyn Fn(ToolProgress) + Send + Sync>>,
}

impl ProgressSink {
    pub fn new(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        emit: Option<Arc<dyn Fn(ToolProgress) + Send + Sync>>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            started: Instant::now(),
            emit,
        }
    }

    /// A sink that discards everything, for tests and direct invocations.
    pub fn discard() -> Self {
        Self::new("", "", None)
    }

    pub fn report(&self, progress: u8, status: impl Into<String>) {
        if let Some(emit) = &self.emit {
            emit(ToolProgress {
                tool_call_id: self.call_id.clone(),
                tool_name: self.tool_name.clone(),
                progress: progress.min(100),
                status: status.into(),
                elapsed_ms: self.started.elapsed().as_millis() as u64,
            });
        }
    }
}

/// Trait every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object.
    fn input_schema(&self) -> Value;
    /// Whether this tool mutates nothing; read-only tools of one turn run
    /// in parallel.
    fn read_only(&self) -> bool {
        false
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Execute the call.  Failures are reported via [`ToolOutput::err`],
    /// never as panics.
    async fn execute(&self, call: &ToolCall, progress: &ProgressSink) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
