// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! A scripted model provider for tests.
//!
//! Responses are consumed front-to-back, one per `complete()` call.  Every
//! request is recorded so tests can assert on what the loop actually sent.
//! When the script runs dry the provider returns an empty `end_turn`; that
//! keeps auxiliary calls (context summaries, session summaries) from
//! failing tests that only scripted the main turns.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    provider::ResponseStream, CompletionRequest, ModelError, ModelProvider, ResponseEvent,
    StopReason, Usage,
};

/// One scripted model turn.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    pub text: String,
    pub tool_uses: Vec<(String, String, serde_json::Value)>,
    pub usage: Usage,
    pub stop_reason: Option<StopReason>,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Default::default() }
    }

    pub fn tool_use(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        self.tool_uses.push((id.into(), name.into(), input));
        self
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Usage { input_tokens, output_tokens };
        self
    }

    pub fn with_stop(mut self, stop_reason: StopReason) -> Self {
        self.stop_reason = Some(stop_reason);
        self
    }

    fn effective_stop(&self) -> StopReason {
        self.stop_reason.unwrap_or(if self.tool_uses.is_empty() {
            StopReason::EndTurn
        } else {
            StopReason::ToolUse
        })
    }
}

#[derive(Debug)]
pub enum ScriptedResponse {
    Turn(ScriptedTurn),
    Error(ModelError),
    /// A stream that never produces anything, for cancellation tests.
    Stall,
}

#[derive(Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: ScriptedResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        self.push(ScriptedResponse::Turn(turn));
    }

    /// Every request received so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError> {
        self.requests.lock().unwrap().push(req);

        let next = self.script.lock().unwrap().pop_front();
        let turn = match next {
            Some(ScriptedResponse::Turn(turn)) => turn,
            Some(ScriptedResponse::Error(e)) => return Err(e),
            Some(ScriptedResponse::Stall) => {
                return Ok(Box::pin(futures::stream::pending()));
            }
            None => ScriptedTurn::default(),
        };

        let mut events: Vec<Result<ResponseEvent, ModelError>> = Vec::new();
        if !turn.text.is_empty() {
            // Split into two deltas so consumers exercise accumulation.
            let mid = turn.text.len() / 2;
            let mid = (0..=mid).rev().find(|i| turn.text.is_char_boundary(*i)).unwrap_or(0);
            let (a, b) = turn.text.split_at(mid);
            for part in [a, b] {
                if !part.is_empty() {
                    events.push(Ok(ResponseEvent::TextDelta(part.to_string())));
                }
            }
        }
        for (i, (id, name, input)) in turn.tool_uses.iter().enumerate() {
            events.push(Ok(ResponseEvent::ToolUseStart {
                index: i as u32,
                id: id.clone(),
                name: name.clone(),
            }));
            events.push(Ok(ResponseEvent::ToolUseDelta {
                index: i as u32,
                partial_json: input.to_string(),
            }));
        }
        events.push(Ok(ResponseEvent::Usage(turn.usage)));
        events.push(Ok(ResponseEvent::Done { stop_reason: turn.effective_stop() }));

        Ok(Box::pin(futures::stream::iter(events)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn scripted_turn_streams_text_then_done() {
        let mock = MockProvider::new();
        mock.push_turn(ScriptedTurn::text("hello world").with_usage(10, 5));

        let mut stream = mock.complete(CompletionRequest::default()).await.unwrap();
        let mut text = String::new();
        let mut stop = None;
        let mut usage = Usage::default();
        while let Some(ev) = stream.next().await {
            match ev.unwrap() {
                ResponseEvent::TextDelta(t) => text.push_str(&t),
                ResponseEvent::Usage(u) => usage = u,
                ResponseEvent::Done { stop_reason } => stop = Some(stop_reason),
                _ => {}
            }
        }
        assert_eq!(text, "hello world");
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(stop, Some(StopReason::EndTurn));
    }

    #[tokio::test]
    async fn tool_uses_imply_tool_use_stop() {
        let mock = MockProvider::new();
        mock.push_turn(
            ScriptedTurn::default().tool_use("tu_1", "read_file", serde_json::json!({"path": "a"})),
        );
        let mut stream = mock.complete(CompletionRequest::default()).await.unwrap();
        let mut saw_start = false;
        let mut stop = None;
        while let Some(ev) = stream.next().await {
            match ev.unwrap() {
                ResponseEvent::ToolUseStart { name, .. } => {
                    saw_start = true;
                    assert_eq!(name, "read_file");
                }
                ResponseEvent::Done { stop_reason } => stop = Some(stop_reason),
                _ => {}
            }
        }
        assert!(saw_start);
        assert_eq!(stop, Some(StopReason::ToolUse));
    }

    #[tokio::test]
    async fn scripted_error_is_returned() {
        let mock = MockProvider::new();
        mock.push(ScriptedResponse::Error(ModelError::Api {
            status: 500,
            message: "boom".into(),
            retry_after: None,
        }));
        assert!(mock.complete(CompletionRequest::default()).await.is_err());
    }

    #[tokio::test]
    async fn drained_script_yields_empty_end_turn() {
        let mock = MockProvider::new();
        let mut stream = mock.complete(CompletionRequest::default()).await.unwrap();
        let mut saw_done = false;
        while let Some(ev) = stream.next().await {
            if matches!(ev.unwrap(), ResponseEvent::Done { stop_reason: StopReason::EndTurn }) {
                saw_done = true;
            }
        }
        assert!(saw_done);
    }

    #[tokio::test]
    async fn requests_are_recorded_in_order() {
        let mock = MockProvider::new();
        let mut req = CompletionRequest::default();
        req.model = "claude-haiku-4-5".into();
        let _ = mock.complete(req).await.unwrap();
        assert_eq!(mock.requests().len(), 1);
        assert_eq!(mock.requests()[0].model, "claude-haiku-4-5");
    }
}
