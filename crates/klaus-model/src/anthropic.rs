// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::ResponseStream, CompletionRequest, ContentBlock, Message, ModelError, ModelProvider,
    ResponseEvent, Role, StopReason, Usage,
};

pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError> {
        let mut body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "stream": true,
            "messages": wire_messages(&req.messages),
        });

        // The system prompt is stable across the turns of one run, so it is
        // marked cacheable; the growing message history stays uncached.
        if !req.system.is_empty() {
            body["system"] = json!([{
                "type": "text",
                "text": req.system,
                "cache_control": { "type": "ephemeral" },
            }]);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(req
                .tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                }))
                .collect::<Vec<_>>());
        }

        debug!(model = %req.model, messages = req.messages.len(), "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(ModelError::from_reqwest)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let message = resp.text().await.unwrap_or_default();
            return Err(ModelError::Api { status, message, retry_after });
        }

        // SSE lines can be split across TCP chunks, so a remainder buffer is
        // carried forward; only complete lines are parsed.
        let events = resp
            .bytes_stream()
            .scan(String::new(), |buf, chunk| {
                let out: Vec<Result<ResponseEvent, ModelError>> = match chunk {
                    Err(e) => vec![Err(ModelError::from_reqwest(e))],
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        let mut events = Vec::new();
                        while let Some(pos) = buf.find('\n') {
                            let line = buf[..pos].trim_end_matches('\r').to_string();
                            buf.drain(..=pos);
                            events.extend(parse_sse_line(&line).into_iter().map(Ok));
                        }
                        events
                    }
                };
                futures::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(events))
    }
}

/// Serialise messages into the Anthropic wire format.
fn wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let content: Vec<Value> = m
                .content
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                    ContentBlock::ToolUse { id, name, input } => {
                        json!({"type": "tool_use", "id": id, "name": name, "input": input})
                    }
                    ContentBlock::ToolResult { tool_use_id, content, is_error } => json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": content,
                        "is_error": is_error,
                    }),
                })
                .collect();
            json!({"role": role, "content": content})
        })
        .collect()
}

/// Parse one SSE line into zero or more response events.
///
/// Only `data:` lines carry payloads; `event:` lines and keep-alive blanks
/// are dropped.  Unknown payload types are ignored rather than failing the
/// stream; the wire format grows fields over time.
fn parse_sse_line(line: &str) -> Vec<ResponseEvent> {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return vec![];
    };
    let Ok(payload) = serde_json::from_str::<Value>(data) else {
        return vec![];
    };

    match payload["type"].as_str().unwrap_or("") {
        "message_start" => {
            let input = payload["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0);
            vec![ResponseEvent::Usage(Usage { input_tokens: input, output_tokens: 0 })]
        }
        "content_block_start" => {
            let block = &payload["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                vec![ResponseEvent::ToolUseStart {
                    index: payload["index"].as_u64().unwrap_or(0) as u32,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                }]
            } else {
                vec![]
            }
        }
        "content_block_delta" => {
            let delta = &payload["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => delta["text"]
                    .as_str()
                    .filter(|t| !t.is_empty())
                    .map(|t| vec![ResponseEvent::TextDelta(t.to_string())])
                    .unwrap_or_default(),
                "input_json_delta" => delta["partial_json"]
                    .as_str()
                    .map(|j| {
                        vec![ResponseEvent::ToolUseDelta {
                            index: payload["index"].as_u64().unwrap_or(0) as u32,
                            partial_json: j.to_string(),
                        }]
                    })
                    .unwrap_or_default(),
                _ => vec![],
            }
        }
        "message_delta" => {
            let mut events = Vec::new();
            if let Some(output) = payload["usage"]["output_tokens"].as_u64() {
                events.push(ResponseEvent::Usage(Usage {
                    input_tokens: 0,
                    output_tokens: output,
                }));
            }
            if let Some(stop) = payload["delta"]["stop_reason"].as_str() {
                events.push(ResponseEvent::Done { stop_reason: StopReason::parse(stop) });
            }
            events
        }
        // ping, message_stop, content_block_stop
        _ => vec![],
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_data_lines_are_ignored() {
        assert!(parse_sse_line("event: message_start").is_empty());
        assert!(parse_sse_line("").is_empty());
        assert!(parse_sse_line(": keep-alive").is_empty());
    }

    #[test]
    fn message_start_yields_input_usage() {
        let events = parse_sse_line(
            r#"data: {"type":"message_start","message":{"usage":{"input_tokens":123}}}"#,
        );
        assert!(matches!(
            events.as_slice(),
            [ResponseEvent::Usage(Usage { input_tokens: 123, output_tokens: 0 })]
        ));
    }

    #[test]
    fn text_delta_is_extracted() {
        let events = parse_sse_line(
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
        );
        match &events[..] {
            [ResponseEvent::TextDelta(t)] => assert_eq!(t, "hi"),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn tool_use_start_and_json_delta() {
        let start = parse_sse_line(
            r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_1","name":"read_file"}}"#,
        );
        match &start[..] {
            [ResponseEvent::ToolUseStart { index, id, name }] => {
                assert_eq!(*index, 1);
                assert_eq!(id, "tu_1");
                assert_eq!(name, "read_file");
            }
            other => panic!("unexpected events: {other:?}"),
        }

        let delta = parse_sse_line(
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"pa"}}"#,
        );
        match &delta[..] {
            [ResponseEvent::ToolUseDelta { index: 1, partial_json }] => {
                assert_eq!(partial_json, "{\"pa");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn message_delta_yields_usage_then_done() {
        let events = parse_sse_line(
            r#"data: {"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":42}}"#,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            ResponseEvent::Usage(Usage { input_tokens: 0, output_tokens: 42 })
        ));
        assert!(matches!(
            events[1],
            ResponseEvent::Done { stop_reason: StopReason::ToolUse }
        ));
    }

    #[test]
    fn wire_messages_map_tool_results() {
        let msgs = vec![Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "tu_1".into(),
            content: "output".into(),
            is_error: true,
        }])];
        let wire = wire_messages(&msgs);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"][0]["type"], "tool_result");
        assert_eq!(wire[0]["content"][0]["is_error"], true);
    }

    #[test]
    fn text_content_round_trips_to_wire_shape() {
        let wire = wire_messages(&[Message::assistant("done")]);
        assert_eq!(wire[0]["role"], "assistant");
        assert_eq!(wire[0]["content"][0]["text"], "done");
    }
}
