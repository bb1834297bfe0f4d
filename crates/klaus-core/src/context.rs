// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Context assembly: turning a session's stored history into the message
//! sequence for the next model call.
//!
//! Short histories pass through verbatim.  Once the history outgrows the
//! configured window, the oldest half is folded into a rolling summary
//! (generated on the cheap internal model tier and persisted in the
//! knowledge store), the newest half is kept verbatim, and the two are
//! stitched together with a synthetic summary/ack turn pair.
//!
//! Hosted model APIs require strict user/assistant alternation, so
//! consecutive same-role messages are merged before the sequence is
//! returned; the final element is always the current user prompt.

use std::sync::Arc;

use tracing::{debug, warn};

use klaus_model::{collect_text, CompletionRequest, Message, ModelProvider, Role};
use klaus_store::{MessageRecord, Store};

use crate::AgentError;

const SUMMARY_PROMPT: &str = "\
You are a context summarisation assistant for a coding agent. Summarise the \
conversation below in 2-4 dense paragraphs. Preserve: decisions made and \
why, files created or modified, patterns and conventions established, and \
errors that were encountered and resolved. The summary replaces the \
original history, so include everything future work depends on.";

const SUMMARY_ACK: &str = "Understood. Continuing from where we left off.";

const SUMMARY_MAX_TOKENS: u32 = 1024;

pub struct ContextBuilder {
    store: Arc<Store>,
    internal: Arc<dyn ModelProvider>,
    internal_model: String,
    max_context_messages: usize,
}

impl ContextBuilder {
    pub fn new(
        store: Arc<Store>,
        internal: Arc<dyn ModelProvider>,
        internal_model: impl Into<String>,
        max_context_messages: usize,
    ) -> Self {
        Self {
            store,
            internal,
            internal_model: internal_model.into(),
            // A window below 2 cannot alternate.
            max_context_messages: max_context_messages.max(2),
        }
    }

    /// Assemble the message sequence for the next turn of `session_id`.
    /// `prompt` is the current user prompt, already appended to the store.
    pub async fn build(&self, session_id: &str, prompt: &str) -> Result<Vec<Message>, AgentError> {
        let n = self.max_context_messages;
        let total = self.store.count_messages(session_id)?;

        let mut messages: Vec<Message> = Vec::new();
        if total <= n {
            for record in self.store.get_recent_messages(session_id, n)? {
                messages.push(record_to_message(&record));
            }
        } else {
            let half = n / 2;
            if let Some(summary) = self.ensure_summary(session_id, total, half).await? {
                messages.push(Message::user(format!(
                    "[CONTEXT SUMMARY — earlier conversation]\n{summary}"
                )));
                messages.push(Message::assistant(SUMMARY_ACK));
            }
            for record in self.store.get_recent_messages(session_id, half)? {
                messages.push(record_to_message(&record));
            }
        }

        let prompt_already_last = messages
            .last()
            .map(|m| m.role == Role::User && m.text() == prompt)
            .unwrap_or(false);
        if !prompt_already_last {
            messages.push(Message::user(prompt));
        }

        Ok(merge_alternating(messages))
    }

    /// Return the session's rolling summary, regenerating it when none is
    /// stored or the message count hits a refresh boundary.  A failed or
    /// empty regeneration degrades to the stale summary rather than failing
    /// the run.
    async fn ensure_summary(
        &self,
        session_id: &str,
        total: usize,
        half: usize,
    ) -> Result<Option<String>, AgentError> {
        let key = format!("ctx_summary_{session_id}");
        let existing = self.store.get_knowledge(&key)?;

        let refresh_due = half > 0 && total % half == 0;
        if existing.is_some() && !refresh_due {
            return Ok(existing);
        }

        let oldest = self.store.get_messages(session_id, half)?;
        let transcript = serialize_history(&oldest);
        let request = CompletionRequest {
            model: self.internal_model.clone(),
            system: String::new(),
            messages: vec![Message::user(format!("{SUMMARY_PROMPT}\n\n---\n\n{transcript}"))],
            tools: vec![],
            max_tokens: SUMMARY_MAX_TOKENS,
        };

        match collect_text(self.internal.as_ref(), request).await {
            Ok((text, _)) if !text.trim().is_empty() => {
                let summary = text.trim().to_string();
                self.store.set_knowledge(&key, &summary, "context")?;
                debug!(session = %session_id, "context summary refreshed");
                Ok(Some(summary))
            }
            Ok(_) => {
                warn!(session = %session_id, "context summary came back empty, keeping stale one");
                Ok(existing)
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "context summary call failed");
                Ok(existing)
            }
        }
    }
}

/// Stored roles map onto the two wire roles: everything that is not the
/// assistant speaks as the user.
fn record_to_message(record: &MessageRecord) -> Message {
    if record.role == "assistant" {
        Message::assistant(&record.content)
    } else {
        Message::user(&record.content)
    }
}

/// Merge consecutive same-role messages with a blank-line separator.
fn merge_alternating(messages: Vec<Message>) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match merged.last_mut() {
            Some(last) if last.role == message.role => {
                let combined = format!("{}\n\n{}", last.text(), message.text());
                *last = match message.role {
                    Role::User => Message::user(combined),
                    Role::Assistant => Message::assistant(combined),
                };
            }
            _ => merged.push(message),
        }
    }
    merged
}

fn serialize_history(records: &[MessageRecord]) -> String {
    records
        .iter()
        .map(|r| format!("{}: {}", r.role, r.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
