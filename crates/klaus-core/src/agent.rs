// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use klaus_config::{Config, INTERNAL_MODEL};
use klaus_model::{
    collect_text, CompletionRequest, ContentBlock, Message, ModelError, ModelProvider,
    ResponseEvent, RetryPolicy, Role, StopReason, ToolSchema, Usage,
};
use klaus_store::{estimate_cost, NewMessage, NewToolCall, Store};
use klaus_tools::{git, secrets, DispatchResult, ToolCall, ToolDispatcher};

use crate::{
    context::ContextBuilder,
    events::{AgentEvent, EventBus, TokenUsageSummary},
    limits::{CancelRegistry, SessionCounter},
    shrink_tool_result, AgentError,
};

const SYSTEM_PROMPT: &str = "\
You are Klaus, an autonomous coding agent operating on a sandboxed \
workspace. You read, write and search files, run allowlisted commands, and \
commit checkpoints with the provided tools. Work incrementally: inspect \
before you edit, verify after you change, and checkpoint coherent units of \
work. When a tool fails, read the error and adapt rather than repeating \
the same call. Keep answers concise; the operator sees your text alongside \
every tool call you make.";

const PROJECT_CONTEXT_FILES: &[&str] = &[".agentcontext", ".agent/context.md"];
const PROJECT_CONTEXT_MAX_CHARS: usize = 10_000;
const SESSION_SUMMARY_MAX_CHARS: usize = 100;
const SUMMARY_CALL_MAX_TOKENS: u32 = 64;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub session_id: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    BudgetExceeded,
    ToolLimitExceeded,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub session_id: String,
    pub status: RunStatus,
    pub summary: String,
    pub tool_calls_count: usize,
    pub duration_ms: u64,
    pub token_usage: TokenUsageSummary,
}

/// Everything one run mutates, on the run's own stack.  Nothing here is
/// shared; the loop threads this struct through its turn boundaries.
struct RunState {
    input_tokens: u64,
    output_tokens: u64,
    budget_warning_fired: bool,
    tool_calls_count: usize,
    tools_used: BTreeSet<String>,
    last_assistant_text: String,
}

impl RunState {
    fn new() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            budget_warning_fired: false,
            tool_calls_count: 0,
            tools_used: BTreeSet::new(),
            last_assistant_text: String::new(),
        }
    }

    fn used(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One fully assembled model turn.
struct TurnOutput {
    text: String,
    tool_uses: Vec<ToolUseRequest>,
    usage: Usage,
    stop_reason: StopReason,
}

struct ToolUseRequest {
    id: String,
    name: String,
    input: serde_json::Value,
}

#[derive(Default)]
struct PendingToolUse {
    id: String,
    name: String,
    json: String,
}

/// Drives the model ↔ tool loop for one session at a time; a process holds
/// exactly one runner shared by every concurrent run.
pub struct AgentRunner {
    config: Arc<Config>,
    store: Arc<Store>,
    provider: Arc<dyn ModelProvider>,
    internal: Arc<dyn ModelProvider>,
    dispatcher: Arc<ToolDispatcher>,
    bus: Arc<EventBus>,
    counter: Arc<SessionCounter>,
    cancels: Arc<CancelRegistry>,
    retry: RetryPolicy,
}

impl AgentRunner {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        provider: Arc<dyn ModelProvider>,
        internal: Arc<dyn ModelProvider>,
        dispatcher: Arc<ToolDispatcher>,
        bus: Arc<EventBus>,
    ) -> Self {
        let retry = RetryPolicy::new(
            config.api_retry_count,
            config.api_retry_delay,
            config.api_retry_max_delay,
        );
        Self {
            config,
            store,
            provider,
            internal,
            dispatcher,
            bus,
            counter: Arc::new(SessionCounter::new()),
            cancels: Arc::new(CancelRegistry::new()),
            retry,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn active_sessions(&self) -> usize {
        self.counter.active()
    }

    /// Best-effort cancellation of an in-flight run.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.cancels.cancel(session_id)
    }

    /// Execute one run: admission, context, the turn loop, terminal summary.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, AgentError> {
        // Admission.  The model check precedes the slot so a rejected model
        // never occupies capacity.
        let model = self
            .config
            .resolve_model(request.model.as_deref())
            .map_err(AgentError::ModelNotAllowed)?;

        let limit = self.config.max_concurrent_sessions;
        let Some(_permit) = SessionCounter::try_acquire(&self.counter, limit) else {
            return Err(AgentError::ConcurrencyExceeded { active: self.counter.active(), limit });
        };

        let chars = request.prompt.chars().count();
        if chars > self.config.max_prompt_chars {
            // The permit guard releases the slot on this return.
            return Err(AgentError::PromptTooLarge {
                chars,
                limit: self.config.max_prompt_chars,
            });
        }

        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let cancel = self.cancels.register(&session_id);

        info!(session = %session_id, model = %model, "run started");
        let result = self.run_inner(&session_id, &model, &request.prompt, &cancel).await;
        self.cancels.remove(&session_id);

        // Upstream failures already emitted their error event on the model
        // path; storage failures surface here so subscribers always see a
        // failure event before the run disappears.
        if let Err(AgentError::Storage(e)) = &result {
            self.bus.publish(
                &session_id,
                AgentEvent::Error { error: e.to_string(), retrying: None, retry_in: None },
            );
        }
        result
    }

    async fn run_inner(
        &self,
        session_id: &str,
        model: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, AgentError> {
        let started = Instant::now();

        // ── Preparing ─────────────────────────────────────────────────────────
        if self.store.get_session(session_id)?.is_none() {
            self.store.create_session(
                session_id,
                &self.config.workspace_dir.to_string_lossy(),
            )?;
        }
        self.store.add_message(NewMessage {
            session_id: session_id.to_string(),
            role: "user".into(),
            content: prompt.to_string(),
            tool_name: None,
            metadata: None,
        })?;

        let context = ContextBuilder::new(
            Arc::clone(&self.store),
            Arc::clone(&self.internal),
            INTERNAL_MODEL,
            self.config.max_context_messages,
        );
        let mut messages = context.build(session_id, prompt).await?;
        let system = self.build_system_prompt().await?;

        if let Err(e) = git::ensure_repo(&self.config.workspace_dir).await {
            // Checkpoints will fail with their own tool errors; the run can
            // still read, edit and search.
            warn!(session = %session_id, error = %e, "workspace git init failed");
        }

        let tools: Vec<ToolSchema> = self
            .dispatcher
            .registry()
            .schemas()
            .into_iter()
            .map(|(name, description, input_schema)| ToolSchema {
                name,
                description,
                input_schema,
            })
            .collect();

        let mut state = RunState::new();

        // ── Turn loop ─────────────────────────────────────────────────────────
        loop {
            if cancel.is_cancelled() {
                return self.finish(session_id, prompt, state, started, RunStatus::Cancelled).await;
            }

            self.bus.publish(session_id, AgentEvent::Thinking {});
            let request = CompletionRequest {
                model: model.to_string(),
                system: system.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                max_tokens: self.config.max_tokens,
            };
            let Some(turn) = self.call_model_with_retry(session_id, request, cancel).await? else {
                return self.finish(session_id, prompt, state, started, RunStatus::Cancelled).await;
            };

            // Token accounting before any control-flow decision: the ledger
            // must see every turn that reached the provider.
            self.store.record_token_usage(
                session_id,
                turn.usage.input_tokens,
                turn.usage.output_tokens,
                model,
            )?;
            state.input_tokens += turn.usage.input_tokens;
            state.output_tokens += turn.usage.output_tokens;

            let budget = self.config.token_budget;
            let used = state.used();
            let cost = estimate_cost(model, turn.usage.input_tokens, turn.usage.output_tokens);
            self.bus.publish(
                session_id,
                AgentEvent::TurnComplete {
                    input_tokens: turn.usage.input_tokens,
                    output_tokens: turn.usage.output_tokens,
                    cost_usd: cost,
                    total_input_tokens: state.input_tokens,
                    total_output_tokens: state.output_tokens,
                    budget_percent: (budget > 0)
                        .then(|| (used as f64 / budget as f64) * 100.0),
                },
            );

            if budget > 0 {
                // The fired flag, not a previous-turn comparison: one large
                // turn can jump from under 80% to past 100% and the warning
                // must still be emitted exactly once.
                if !state.budget_warning_fired && used * 10 >= budget * 8 {
                    state.budget_warning_fired = true;
                    self.bus.publish(
                        session_id,
                        AgentEvent::BudgetWarning {
                            used,
                            budget,
                            percent: (used as f64 / budget as f64) * 100.0,
                        },
                    );
                }
                if used >= budget {
                    self.bus.publish(session_id, AgentEvent::BudgetExceeded { used, budget });
                    return self
                        .finish(session_id, prompt, state, started, RunStatus::BudgetExceeded)
                        .await;
                }
            }

            let tool_limit = self.config.max_tool_calls;
            if tool_limit > 0 && state.tool_calls_count >= tool_limit {
                self.bus.publish(
                    session_id,
                    AgentEvent::ToolLimitExceeded {
                        used: state.tool_calls_count,
                        limit: tool_limit,
                    },
                );
                return self
                    .finish(session_id, prompt, state, started, RunStatus::ToolLimitExceeded)
                    .await;
            }

            if !turn.text.is_empty() {
                self.bus.publish(
                    session_id,
                    AgentEvent::Message { role: "assistant".into(), content: turn.text.clone() },
                );
                self.store.add_message(NewMessage {
                    session_id: session_id.to_string(),
                    role: "assistant".into(),
                    content: turn.text.clone(),
                    tool_name: None,
                    metadata: None,
                })?;
                state.last_assistant_text = turn.text.clone();
            }

            if turn.stop_reason == StopReason::EndTurn || turn.tool_uses.is_empty() {
                return self.finish(session_id, prompt, state, started, RunStatus::Complete).await;
            }

            // ── DispatchingTools ──────────────────────────────────────────────
            let (assistant_msg, results_msg, dispatch_cancelled) =
                self.dispatch_tools(session_id, &turn, &mut state, cancel).await?;
            messages.push(assistant_msg);
            messages.push(results_msg);

            if dispatch_cancelled {
                return self.finish(session_id, prompt, state, started, RunStatus::Cancelled).await;
            }
        }
    }

    /// One model call with the retry policy applied.  `Ok(None)` means the
    /// run was cancelled while streaming or while backing off.
    async fn call_model_with_retry(
        &self,
        session_id: &str,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<TurnOutput>, AgentError> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                result = self.stream_turn(session_id, request.clone()) => result,
            };
            match outcome {
                Ok(turn) => return Ok(Some(turn)),
                Err(e) if e.is_retryable() && attempt < self.config.api_retry_count => {
                    let delay = self.retry.delay(attempt, &e);
                    warn!(
                        session = %session_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient model failure, backing off"
                    );
                    self.bus.publish(
                        session_id,
                        AgentEvent::Error {
                            error: e.to_string(),
                            retrying: Some(true),
                            retry_in: Some(format_delay(delay)),
                        },
                    );
                    attempt += 1;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    self.bus.publish(
                        session_id,
                        AgentEvent::Error { error: e.to_string(), retrying: None, retry_in: None },
                    );
                    return Err(AgentError::Upstream(e));
                }
            }
        }
    }

    /// Consume one streaming model call into a [`TurnOutput`], publishing
    /// text deltas as they arrive.
    async fn stream_turn(
        &self,
        session_id: &str,
        request: CompletionRequest,
    ) -> Result<TurnOutput, ModelError> {
        let mut stream = self.provider.complete(request).await?;

        let mut text = String::new();
        // Keyed by the provider's parallel-tool-use index; fragments for
        // different calls may interleave.
        let mut pending: BTreeMap<u32, PendingToolUse> = BTreeMap::new();
        let mut usage = Usage::default();
        let mut stop_reason = StopReason::Other;

        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextDelta(delta) => {
                    self.bus
                        .publish(session_id, AgentEvent::StreamDelta { text: delta.clone() });
                    text.push_str(&delta);
                }
                ResponseEvent::ToolUseStart { index, id, name } => {
                    let entry = pending.entry(index).or_default();
                    entry.id = id;
                    entry.name = name;
                }
                ResponseEvent::ToolUseDelta { index, partial_json } => {
                    pending.entry(index).or_default().json.push_str(&partial_json);
                }
                ResponseEvent::Usage(u) => {
                    usage.input_tokens += u.input_tokens;
                    usage.output_tokens += u.output_tokens;
                }
                ResponseEvent::Done { stop_reason: reason } => {
                    stop_reason = reason;
                    break;
                }
            }
        }

        // BTreeMap iteration is index order, the order the model requested.
        let mut tool_uses = Vec::with_capacity(pending.len());
        for (_, p) in pending {
            if p.name.is_empty() {
                warn!(tool_use_id = %p.id, "dropping tool use with empty name");
                continue;
            }
            let input = if p.json.trim().is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                serde_json::from_str(&p.json).unwrap_or_else(|e| {
                    warn!(tool = %p.name, error = %e, "invalid tool-use JSON, substituting {{}}");
                    serde_json::Value::Object(Default::default())
                })
            };
            tool_uses.push(ToolUseRequest { id: p.id, name: p.name, input });
        }

        Ok(TurnOutput { text, tool_uses, usage, stop_reason })
    }

    /// Execute one turn's tool uses: read-only calls concurrently,
    /// side-effecting calls sequentially in request order, results re-joined
    /// to request order.  Returns the assistant tool-use message, the user
    /// tool-results message, and whether cancellation was observed.
    async fn dispatch_tools(
        &self,
        session_id: &str,
        turn: &TurnOutput,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<(Message, Message, bool), AgentError> {
        let registry = self.dispatcher.registry();
        let mut results: Vec<Option<DispatchResult>> = Vec::new();
        results.resize_with(turn.tool_uses.len(), || None);

        let mut read_group: Vec<usize> = Vec::new();
        let mut write_group: Vec<usize> = Vec::new();
        for (i, tu) in turn.tool_uses.iter().enumerate() {
            if registry.is_read_only(&tu.name).unwrap_or(false) {
                read_group.push(i);
            } else {
                write_group.push(i);
            }
        }

        let on_progress = {
            let bus = Arc::clone(&self.bus);
            let session = session_id.to_string();
            Arc::new(move |p: klaus_tools::ToolProgress| {
                bus.publish(
                    &session,
                    AgentEvent::ToolProgress {
                        tool_call_id: p.tool_call_id,
                        tool_name: p.tool_name,
                        progress: p.progress,
                        status: p.status,
                        elapsed_ms: p.elapsed_ms,
                    },
                );
            }) as Arc<dyn Fn(klaus_tools::ToolProgress) + Send + Sync>
        };

        // Read-only group: announce in request order, run concurrently,
        // re-join to request order.
        for &i in &read_group {
            self.announce_tool(session_id, state, &turn.tool_uses[i]);
        }
        let parallel = read_group.iter().map(|&i| {
            let tu = &turn.tool_uses[i];
            let call = ToolCall {
                id: tu.id.clone(),
                session_id: session_id.to_string(),
                name: tu.name.clone(),
                args: tu.input.clone(),
            };
            let progress = Arc::clone(&on_progress);
            async move { (i, self.dispatcher.execute(&call, self.config.max_retries, Some(progress)).await) }
        });
        for (i, result) in futures::future::join_all(parallel).await {
            results[i] = Some(result);
        }
        for &i in &read_group {
            if let Some(result) = &results[i] {
                self.publish_tool_result(session_id, result);
                self.persist_tool_message(session_id, result)?;
            }
        }

        // Side-effecting group: strictly sequential, cancellation observed
        // between invocations.  Already-started tools are never interrupted.
        let mut cancelled = false;
        for &i in &write_group {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let tu = &turn.tool_uses[i];
            self.announce_tool(session_id, state, tu);

            let result = if tu.name == "git_checkpoint" {
                match self.checkpoint_secret_gate(session_id, tu).await? {
                    Some(blocked) => blocked,
                    None => {
                        let call = ToolCall {
                            id: tu.id.clone(),
                            session_id: session_id.to_string(),
                            name: tu.name.clone(),
                            args: tu.input.clone(),
                        };
                        self.dispatcher
                            .execute(&call, self.config.max_retries, Some(Arc::clone(&on_progress)))
                            .await
                    }
                }
            } else {
                let call = ToolCall {
                    id: tu.id.clone(),
                    session_id: session_id.to_string(),
                    name: tu.name.clone(),
                    args: tu.input.clone(),
                };
                self.dispatcher
                    .execute(&call, self.config.max_retries, Some(Arc::clone(&on_progress)))
                    .await
            };

            self.publish_tool_result(session_id, &result);
            self.persist_tool_message(session_id, &result)?;
            results[i] = Some(result);
        }

        // Assemble the conversation messages: assistant text + tool uses,
        // then a user turn with the results in the order the model asked.
        let mut assistant_blocks: Vec<ContentBlock> = Vec::new();
        if !turn.text.is_empty() {
            assistant_blocks.push(ContentBlock::Text { text: turn.text.clone() });
        }
        for tu in &turn.tool_uses {
            assistant_blocks.push(ContentBlock::ToolUse {
                id: tu.id.clone(),
                name: tu.name.clone(),
                input: tu.input.clone(),
            });
        }
        let assistant_msg = Message { role: Role::Assistant, content: assistant_blocks };

        let mut result_blocks: Vec<ContentBlock> = Vec::new();
        for (tu, result) in turn.tool_uses.iter().zip(results.iter()) {
            if let Some(result) = result {
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: tu.id.clone(),
                    content: self.shrink(&result.tool_name, &result.result),
                    is_error: !result.success,
                });
            }
        }
        let results_msg = Message::tool_results(result_blocks);

        Ok((assistant_msg, results_msg, cancelled))
    }

    fn announce_tool(&self, session_id: &str, state: &mut RunState, tu: &ToolUseRequest) {
        state.tool_calls_count += 1;
        state.tools_used.insert(tu.name.clone());
        self.bus.publish(
            session_id,
            AgentEvent::ToolCall {
                tool_call_id: tu.id.clone(),
                tool_name: tu.name.clone(),
                input: tu.input.clone(),
            },
        );
    }

    /// Scan the staged diff before a checkpoint.  A hit synthesises the
    /// failed result (recorded like any other call) and the git tool never
    /// runs.
    async fn checkpoint_secret_gate(
        &self,
        session_id: &str,
        tu: &ToolUseRequest,
    ) -> Result<Option<DispatchResult>, AgentError> {
        let diff = match git::staged_diff(&self.config.workspace_dir).await {
            Ok(diff) => diff,
            // No repo or no git: let the tool itself produce the error.
            Err(_) => return Ok(None),
        };
        let hits = secrets::scan(&diff);
        if hits.is_empty() {
            return Ok(None);
        }

        warn!(session = %session_id, patterns = ?hits, "secret scan blocked checkpoint");
        let message = format!("Secret scan blocked checkpoint: {}", hits.join(", "));
        self.store.record_tool_call(NewToolCall {
            session_id: session_id.to_string(),
            tool_name: tu.name.clone(),
            input: tu.input.clone(),
            output: Some(message.clone()),
            success: false,
            duration_ms: 0,
        })?;
        Ok(Some(DispatchResult {
            tool_call_id: tu.id.clone(),
            tool_name: tu.name.clone(),
            result: message.clone(),
            success: false,
            error: Some(message),
            duration_ms: 0,
        }))
    }

    fn publish_tool_result(&self, session_id: &str, result: &DispatchResult) {
        self.bus.publish(
            session_id,
            AgentEvent::ToolResult {
                tool_call_id: result.tool_call_id.clone(),
                tool_name: result.tool_name.clone(),
                result: self.shrink(&result.tool_name, &result.result),
                success: result.success,
                duration_ms: result.duration_ms,
            },
        );
    }

    fn persist_tool_message(
        &self,
        session_id: &str,
        result: &DispatchResult,
    ) -> Result<(), AgentError> {
        self.store.add_message(NewMessage {
            session_id: session_id.to_string(),
            role: "tool".into(),
            content: self.shrink(&result.tool_name, &result.result),
            tool_name: Some(result.tool_name.clone()),
            metadata: Some(serde_json::json!({
                "tool_call_id": result.tool_call_id,
                "success": result.success,
                "duration_ms": result.duration_ms,
            })),
        })?;
        Ok(())
    }

    fn shrink(&self, tool_name: &str, content: &str) -> String {
        shrink_tool_result(
            content,
            self.dispatcher.registry().output_category(tool_name),
            self.config.max_tool_output_context,
        )
    }

    // ── Terminal ──────────────────────────────────────────────────────────────

    async fn finish(
        &self,
        session_id: &str,
        prompt: &str,
        state: RunState,
        started: Instant,
        status: RunStatus,
    ) -> Result<RunOutcome, AgentError> {
        if status == RunStatus::Cancelled {
            self.bus.publish(
                session_id,
                AgentEvent::Error {
                    error: "Cancelled by user".into(),
                    retrying: None,
                    retry_in: None,
                },
            );
        }

        // A cancelled run takes the deterministic fallback: the operator
        // just asked us to stop calling the model.
        let summary = if status == RunStatus::Cancelled {
            fallback_summary(prompt, &state.last_assistant_text)
        } else {
            self.generate_summary(prompt, &state).await
        };
        self.store.update_session_summary(session_id, &summary)?;

        let token_usage = TokenUsageSummary {
            input_tokens: state.input_tokens,
            output_tokens: state.output_tokens,
            total_tokens: state.used(),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        self.bus.publish(
            session_id,
            AgentEvent::Complete {
                session_id: session_id.to_string(),
                tool_calls_count: state.tool_calls_count,
                duration_ms,
                summary: summary.clone(),
                token_usage: token_usage.clone(),
            },
        );
        info!(
            session = %session_id,
            ?status,
            tool_calls = state.tool_calls_count,
            duration_ms,
            "run finished"
        );

        Ok(RunOutcome {
            session_id: session_id.to_string(),
            status,
            summary,
            tool_calls_count: state.tool_calls_count,
            duration_ms,
            token_usage,
        })
    }

    /// One-line session summary on the internal tier, with a deterministic
    /// fallback when the call fails.
    async fn generate_summary(&self, prompt: &str, state: &RunState) -> String {
        let tools = state.tools_used.iter().cloned().collect::<Vec<_>>().join(", ");
        let request = CompletionRequest {
            model: INTERNAL_MODEL.to_string(),
            system: String::new(),
            messages: vec![Message::user(format!(
                "Write a one-line summary of this coding session in under 100 \
                 characters. Plain text, no quotes.\n\nUser request: {prompt}\n\n\
                 Final response: {last}\n\nTools used: {tools}",
                last = state.last_assistant_text,
            ))],
            tools: vec![],
            max_tokens: SUMMARY_CALL_MAX_TOKENS,
        };
        match collect_text(self.internal.as_ref(), request).await {
            Ok((text, _)) if !text.trim().is_empty() => sanitize_summary(&text),
            Ok(_) => fallback_summary(prompt, &state.last_assistant_text),
            Err(e) => {
                debug!(error = %e, "summary generation failed, using fallback");
                fallback_summary(prompt, &state.last_assistant_text)
            }
        }
    }

    async fn build_system_prompt(&self) -> Result<String, AgentError> {
        let mut prompt = SYSTEM_PROMPT.to_string();

        // The "context" category holds rolling context summaries: internal
        // plumbing, not operator knowledge.
        let knowledge = self.store.list_knowledge(None)?;
        let facts: Vec<_> = knowledge.iter().filter(|k| k.category != "context").collect();
        if !facts.is_empty() {
            prompt.push_str("\n\n## Persistent Knowledge\n");
            for fact in facts {
                prompt.push_str(&format!("- {}: {}\n", fact.key, fact.value));
            }
        }

        for name in PROJECT_CONTEXT_FILES {
            let path = self.config.workspace_dir.join(name);
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                prompt.push_str("\n\n## Project Context\n");
                prompt.extend(content.chars().take(PROJECT_CONTEXT_MAX_CHARS));
                break;
            }
        }
        Ok(prompt)
    }
}

/// First line of the assistant's final text (or of the prompt when there
/// was none), capped to the summary length.
fn fallback_summary(prompt: &str, assistant_text: &str) -> String {
    let source = if assistant_text.trim().is_empty() { prompt } else { assistant_text };
    let first_line = source.lines().next().unwrap_or("").trim();
    first_line.chars().take(SESSION_SUMMARY_MAX_CHARS).collect()
}

fn sanitize_summary(text: &str) -> String {
    let line = text.trim().lines().next().unwrap_or("").trim();
    let line = line
        .trim_start_matches(['"', '\''])
        .trim_end_matches(['"', '\''])
        .trim();
    line.chars().take(SESSION_SUMMARY_MAX_CHARS).collect()
}

fn format_delay(delay: Duration) -> String {
    if delay >= Duration::from_secs(1) {
        format!("{:.1}s", delay.as_secs_f64())
    } else {
        format!("{}ms", delay.as_millis())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn fallback_summary_prefers_assistant_text() {
        assert_eq!(fallback_summary("the prompt", "Did the thing.\nDetails."), "Did the thing.");
    }

    #[test]
    fn fallback_summary_uses_prompt_when_no_text() {
        assert_eq!(fallback_summary("fix the build", "  "), "fix the build");
    }

    #[test]
    fn sanitize_summary_strips_quotes_and_caps_length() {
        assert_eq!(sanitize_summary("\"Refactored the parser\"\n"), "Refactored the parser");
        let long = "x".repeat(300);
        assert_eq!(sanitize_summary(&long).chars().count(), SESSION_SUMMARY_MAX_CHARS);
    }

    #[test]
    fn format_delay_picks_sensible_units() {
        assert_eq!(format_delay(Duration::from_millis(250)), "250ms");
        assert_eq!(format_delay(Duration::from_millis(1500)), "1.5s");
    }
}
