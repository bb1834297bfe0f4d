// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single block inside a message.  Tool-use blocks are produced by the
/// assistant; tool-result blocks are sent back in the following user turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// One conversation message as sent to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// A user turn carrying tool results, in the order the model requested
    /// the corresponding tool uses.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self { role: Role::User, content: results }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Total character count, used for rough context budgeting.
    pub fn char_len(&self) -> usize {
        self.content
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => text.len(),
                ContentBlock::ToolUse { name, input, .. } => {
                    name.len() + input.to_string().len()
                }
                ContentBlock::ToolResult { content, .. } => content.len(),
            })
            .sum()
    }
}

/// A tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object.
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    /// System prompt.  Stable across turns of one session, so providers mark
    /// it cacheable.
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
}

/// Why the model stopped emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

impl StopReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "end_turn" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            _ => Self::Other,
        }
    }
}

/// Token usage reported by the provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A single streamed event from the model.
///
/// Tool-use input JSON arrives in fragments; the consumer keys fragments by
/// `index` and joins them when the stream finishes.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    TextDelta(String),
    ToolUseStart {
        index: u32,
        id: String,
        name: String,
    },
    ToolUseDelta {
        index: u32,
        partial_json: String,
    },
    Usage(Usage),
    Done {
        stop_reason: StopReason,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_has_single_text_block() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.text(), "hello");
    }

    #[test]
    fn text_skips_non_text_blocks() {
        let m = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text { text: "a".into() },
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "read_file".into(),
                    input: serde_json::json!({"path": "x"}),
                },
                ContentBlock::Text { text: "b".into() },
            ],
        };
        assert_eq!(m.text(), "a\nb");
    }

    #[test]
    fn char_len_counts_all_block_kinds() {
        let m = Message {
            role: Role::User,
            content: vec![
                ContentBlock::Text { text: "1234".into() },
                ContentBlock::ToolResult {
                    tool_use_id: "t".into(),
                    content: "5678".into(),
                    is_error: false,
                },
            ],
        };
        assert_eq!(m.char_len(), 8);
    }

    #[test]
    fn stop_reason_parses_known_labels() {
        assert_eq!(StopReason::parse("end_turn"), StopReason::EndTurn);
        assert_eq!(StopReason::parse("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::parse("max_tokens"), StopReason::MaxTokens);
        assert_eq!(StopReason::parse("stop_sequence"), StopReason::Other);
    }

    #[test]
    fn content_block_serialises_with_type_tag() {
        let b = ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: "ok".into(),
            is_error: false,
        };
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["tool_use_id"], "t1");
    }
}
