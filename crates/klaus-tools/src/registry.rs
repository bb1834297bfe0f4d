// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};

use klaus_store::{NewToolCall, Store};

use crate::tool::{OutputCategory, ProgressSink, Tool, ToolCall, ToolOutput, ToolProgress};

/// Central catalogue of all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// `None` for unknown tools; unknown is not the same as side-effecting.
    pub fn is_read_only(&self, name: &str) -> Option<bool> {
        self.tools.get(name).map(|t| t.read_only())
    }

    pub fn output_category(&self, name: &str) -> OutputCategory {
        self.tools
            .get(name)
            .map(|t| t.output_category())
            .unwrap_or_default()
    }

    /// Schemas for the model's tool catalogue, sorted by name so the request
    /// body is stable across turns (prompt caching).
    pub fn schemas(&self) -> Vec<(String, String, Value)> {
        let mut schemas: Vec<(String, String, Value)> = self
            .tools
            .values()
            .map(|t| {
                (
                    t.name().to_string(),
                    t.description().to_string(),
                    t.input_schema(),
                )
            })
            .collect();
        schemas.sort_by(|a, b| a.0.cmp(&b.0));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The outcome of one dispatched tool call.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub result: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl DispatchResult {
    fn failed(call: &ToolCall, error: String, duration_ms: u64) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result: error.clone(),
            success: false,
            error: Some(error),
            duration_ms,
        }
    }
}

/// Validates, executes and records tool calls.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    store: Arc<Store>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, store: Arc<Store>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute one call.
    ///
    /// Input validation runs before the handler; a schema failure or an
    /// unknown tool name produces an error result without invoking anything.
    /// Every outcome, including those, is written to the store.  `retries`
    /// re-runs a failing handler; validation failures are never retried
    /// (the input will not get better).
    pub async fn execute(
        &self,
        call: &ToolCall,
        retries: u32,
        on_progress: Option<Arc<dyn Fn(ToolProgress) + Send + Sync>>,
    ) -> DispatchResult {
        let started = Instant::now();

        let Some(tool) = self.registry.get(&call.name) else {
            warn!(tool = %call.name, "unknown tool requested");
            let result =
                DispatchResult::failed(call, format!("Unknown tool: {}", call.name), 0);
            self.record(call, &result);
            return result;
        };

        if let Err(detail) = validate_input(&tool.input_schema(), &call.args) {
            let result =
                DispatchResult::failed(call, format!("Validation failed: {detail}"), 0);
            self.record(call, &result);
            return result;
        }

        let sink = ProgressSink::new(call.id.clone(), call.name.clone(), on_progress);
        let mut output = tool.execute(call, &sink).await;
        let mut attempt = 0;
        while output.is_error && attempt < retries {
            attempt += 1;
            debug!(tool = %call.name, attempt, "retrying failed tool");
            output = tool.execute(call, &sink).await;
        }

        let result = DispatchResult {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result: output.content.clone(),
            success: !output.is_error,
            error: output.is_error.then(|| output.content.clone()),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.record(call, &result);
        result
    }

    fn record(&self, call: &ToolCall, result: &DispatchResult) {
        let record = NewToolCall {
            session_id: call.session_id.clone(),
            tool_name: call.name.clone(),
            input: call.args.clone(),
            output: Some(result.result.clone()),
            success: result.success,
            duration_ms: result.duration_ms,
        };
        if let Err(e) = self.store.record_tool_call(record) {
            // Recording is bookkeeping; a storage hiccup must not turn a
            // successful tool call into a failed one.
            warn!(tool = %call.name, error = %e, "failed to record tool call");
        }
    }
}

/// Check `input` against the subset of JSON Schema our tools declare:
/// a top-level object with typed `properties` and a `required` list.
fn validate_input(schema: &Value, input: &Value) -> Result<(), String> {
    if !input.is_object() {
        return Err("input must be an object".to_string());
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if input.get(field).is_none() {
                return Err(format!("missing required field '{field}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (field, spec) in properties {
            let Some(value) = input.get(field) else { continue };
            let Some(expected) = spec.get("type").and_then(|t| t.as_str()) else { continue };
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(format!("field '{field}' must be of type {expected}"));
            }
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
