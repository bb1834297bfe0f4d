// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use klaus_store::Store;

use crate::builtin::require_str;
use crate::tool::{ProgressSink, Tool, ToolCall, ToolOutput};

pub struct MemorySetTool {
    pub store: Arc<Store>,
}

#[async_trait]
impl Tool for MemorySetTool {
    fn name(&self) -> &str {
        "memory_set"
    }

    fn description(&self) -> &str {
        "Save a fact for future runs: conventions discovered, decisions \
         made, commands that work. Overwrites any existing value under the \
         same key."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "description": "Knowledge key" },
                "value": { "type": "string", "description": "Fact to remember" },
                "category": { "type": "string", "description": "Grouping category (default 'general')" }
            },
            "required": ["key", "value"]
        })
    }

    async fn execute(&self, call: &ToolCall, _progress: &ProgressSink) -> ToolOutput {
        let key = match require_str(call, "key") {
            Ok(k) => k,
            Err(e) => return *e,
        };
        let value = match require_str(call, "value") {
            Ok(v) => v,
            Err(e) => return *e,
        };
        let category = call
            .args
            .get("category")
            .and_then(|v| v.as_str())
            .unwrap_or("general");

        match self.store.set_knowledge(key, value, category) {
            Ok(()) => ToolOutput::ok(&call.id, format!("remembered '{key}'")),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
