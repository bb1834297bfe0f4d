// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use klaus_store::Store;

use crate::builtin::require_str;
use crate::tool::{ProgressSink, Tool, ToolCall, ToolOutput};

pub struct MemoryGetTool {
    pub store: Arc<Store>,
}

#[async_trait]
impl Tool for MemoryGetTool {
    fn name(&self) -> &str {
        "memory_get"
    }

    fn description(&self) -> &str {
        "Look up a fact previously saved with memory_set. Knowledge is \
         shared across sessions and survives restarts."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "description": "Knowledge key" }
            },
            "required": ["key"]
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolOutput {
        let key = match require_str(call, "key") {
            Ok(k) => k,
            Err(e) => return *e,
        };
        match self.store.get_knowledge(key) {
            Ok(Some(value)) => ToolOutput::ok(&call.id, value),
            Ok(None) => ToolOutput::err(&call.id, format!("no knowledge under key '{key}'")),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_stored_value() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.set_knowledge("build", "use make", "general").unwrap();
        let t = MemoryGetTool { store };
        let call = ToolCall {
            id: "m1".into(),
            session_id: "s".into(),
            name: "memory_get".into(),
            args: json!({"key": "build"}),
        };
        let out = t.execute(&call, &ProgressSink::discard()).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "use make");
    }

    #[tokio::test]
    async fn unknown_key_is_an_error() {
        let t = MemoryGetTool { store: Arc::new(Store::open_in_memory().unwrap()) };
        let call = ToolCall {
            id: "m2".into(),
            session_id: "s".into(),
            name: "memory_get".into(),
            args: json!({"key": "ghost"}),
        };
        let out = t.execute(&call, &ProgressSink::discard()).await;
        assert!(out.is_error);
    }
}
