// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Runtime configuration, read from the environment at process start.
//!
//! Every tunable has a production-safe default so `Config::from_env()` on a
//! bare environment yields a working (loopback, unauthenticated-model-free)
//! setup.  Malformed numeric values never abort startup: they log a `warn!`
//! and fall back to the default, because a typo'd `KLAUS_MAX_TOOL_CALLS`
//! should not take the service down.
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `KLAUS_API_KEY` | Anthropic API key (falls back to `ANTHROPIC_API_KEY`) | — |
//! | `KLAUS_API_SECRET` | Bearer secret for `/api/*` and WebSocket | — |
//! | `KLAUS_WORKSPACE_DIR` | Workspace the agent operates in | `./workspace` |
//! | `KLAUS_DB_PATH` | SQLite database file | `./klaus.db` |
//! | `KLAUS_MODEL` | Default model id | sonnet (see [`DEFAULT_MODEL`]) |
//! | `KLAUS_MAX_TOKENS` | Max output tokens per model call | `8192` |
//! | `KLAUS_MAX_RETRIES` | Per-tool dispatch retries | `0` |
//! | `KLAUS_MAX_CONTEXT_MESSAGES` | Context window in messages | `20` |
//! | `KLAUS_MAX_CONCURRENT_SESSIONS` | Admission limit | `2` |
//! | `KLAUS_MAX_PROMPT_CHARS` | Prompt size ceiling | `50000` |
//! | `KLAUS_MAX_TOOL_CALLS` | Tool calls per run (0 = unlimited) | `50` |
//! | `KLAUS_MAX_TOOL_OUTPUT_CONTEXT` | Tool result chars fed back to the model | `4000` |
//! | `KLAUS_TOKEN_BUDGET` | Token budget per run (0 = unlimited) | `0` |
//! | `KLAUS_CORS_ORIGIN` | Allowed browser origin (unset = `*`, dev) | — |
//! | `KLAUS_WS_RATE_LIMIT` | Client messages/minute per WebSocket | `30` |
//! | `KLAUS_SHUTDOWN_TIMEOUT` | Drain window in seconds | `30` |
//! | `KLAUS_SESSION_TTL` | Idle session expiry in seconds (0 = never) | `0` |
//! | `KLAUS_SESSION_CLEANUP_INTERVAL` | Expiry sweep period in seconds | `3600` |
//! | `KLAUS_API_RETRY_COUNT` | Model-call retry attempts | `3` |
//! | `KLAUS_API_RETRY_DELAY` | Base backoff in milliseconds | `1000` |
//! | `KLAUS_API_RETRY_MAX_DELAY` | Backoff ceiling in milliseconds | `30000` |
//! | `KLAUS_APPROVAL_TIMEOUT` | Patch-approval timeout in seconds | `120` |
//! | `KLAUS_REQUIRE_PATCH_APPROVAL` | Gate file mutations on operator sign-off | `false` |
//! | `KLAUS_METRICS_ENABLED` | Serve `/metrics` | `true` |
//! | `KLAUS_TRUST_PROXY` | Honour `X-Forwarded-For` for rate limiting | `false` |
//! | `KLAUS_PORT` | HTTP listen port | `3000` |

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Default model when the caller supplies none and `KLAUS_MODEL` is unset.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Cheap model tier used for context summaries and the final one-line
/// session summary.  Never user-overridable per request.
pub const INTERNAL_MODEL: &str = "claude-haiku-4-5";

/// Models a caller may select per request.  Exact match only: substring
/// admission is how you end up serving a model you never priced.
pub const ALLOWED_MODELS: &[&str] = &[
    "claude-haiku-4-5",
    "claude-sonnet-4-5",
    "claude-opus-4-5",
];

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Anthropic API key. `None` means model calls will fail with a clear
    /// error; useful for store/tool-only operation and tests.
    pub api_key: Option<String>,
    /// Shared secret for the HTTP/WebSocket façade. `None` disables the
    /// façade entirely (the server refuses to start without it).
    pub api_secret: Option<String>,
    pub workspace_dir: PathBuf,
    pub db_path: PathBuf,
    pub model: String,
    pub max_tokens: u32,
    pub max_retries: u32,
    pub max_context_messages: usize,
    pub max_concurrent_sessions: usize,
    pub max_prompt_chars: usize,
    pub max_tool_calls: usize,
    pub max_tool_output_context: usize,
    pub token_budget: u64,
    pub cors_origin: Option<String>,
    pub ws_rate_limit: u32,
    pub shutdown_timeout: Duration,
    pub session_ttl: Duration,
    pub session_cleanup_interval: Duration,
    pub api_retry_count: u32,
    pub api_retry_delay: Duration,
    pub api_retry_max_delay: Duration,
    pub approval_timeout: Duration,
    pub require_patch_approval: bool,
    pub metrics_enabled: bool,
    pub trust_proxy: bool,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_secret: None,
            workspace_dir: PathBuf::from("./workspace"),
            db_path: PathBuf::from("./klaus.db"),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 8192,
            max_retries: 0,
            max_context_messages: 20,
            max_concurrent_sessions: 2,
            max_prompt_chars: 50_000,
            max_tool_calls: 50,
            max_tool_output_context: 4000,
            token_budget: 0,
            cors_origin: None,
            ws_rate_limit: 30,
            shutdown_timeout: Duration::from_secs(30),
            session_ttl: Duration::ZERO,
            session_cleanup_interval: Duration::from_secs(3600),
            api_retry_count: 3,
            api_retry_delay: Duration::from_millis(1000),
            api_retry_max_delay: Duration::from_millis(30_000),
            approval_timeout: Duration::from_secs(120),
            require_patch_approval: false,
            metrics_enabled: true,
            trust_proxy: false,
            port: 3000,
        }
    }
}

impl Config {
    /// Read the full configuration from the process environment.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            api_key: env_string("KLAUS_API_KEY")
                .or_else(|| env_string("ANTHROPIC_API_KEY")),
            api_secret: env_string("KLAUS_API_SECRET"),
            workspace_dir: env_string("KLAUS_WORKSPACE_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.workspace_dir),
            db_path: env_string("KLAUS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.db_path),
            model: env_string("KLAUS_MODEL").unwrap_or(d.model),
            max_tokens: env_parse("KLAUS_MAX_TOKENS", d.max_tokens),
            max_retries: env_parse("KLAUS_MAX_RETRIES", d.max_retries),
            max_context_messages: env_parse(
                "KLAUS_MAX_CONTEXT_MESSAGES",
                d.max_context_messages,
            ),
            max_concurrent_sessions: env_parse(
                "KLAUS_MAX_CONCURRENT_SESSIONS",
                d.max_concurrent_sessions,
            ),
            max_prompt_chars: env_parse("KLAUS_MAX_PROMPT_CHARS", d.max_prompt_chars),
            max_tool_calls: env_parse("KLAUS_MAX_TOOL_CALLS", d.max_tool_calls),
            max_tool_output_context: env_parse(
                "KLAUS_MAX_TOOL_OUTPUT_CONTEXT",
                d.max_tool_output_context,
            ),
            token_budget: env_parse("KLAUS_TOKEN_BUDGET", d.token_budget),
            cors_origin: env_string("KLAUS_CORS_ORIGIN"),
            ws_rate_limit: env_parse("KLAUS_WS_RATE_LIMIT", d.ws_rate_limit),
            shutdown_timeout: env_secs("KLAUS_SHUTDOWN_TIMEOUT", d.shutdown_timeout),
            session_ttl: env_secs("KLAUS_SESSION_TTL", d.session_ttl),
            session_cleanup_interval: env_secs(
                "KLAUS_SESSION_CLEANUP_INTERVAL",
                d.session_cleanup_interval,
            ),
            api_retry_count: env_parse("KLAUS_API_RETRY_COUNT", d.api_retry_count),
            api_retry_delay: env_millis("KLAUS_API_RETRY_DELAY", d.api_retry_delay),
            api_retry_max_delay: env_millis(
                "KLAUS_API_RETRY_MAX_DELAY",
                d.api_retry_max_delay,
            ),
            approval_timeout: env_secs("KLAUS_APPROVAL_TIMEOUT", d.approval_timeout),
            require_patch_approval: env_bool(
                "KLAUS_REQUIRE_PATCH_APPROVAL",
                d.require_patch_approval,
            ),
            metrics_enabled: env_bool("KLAUS_METRICS_ENABLED", d.metrics_enabled),
            trust_proxy: env_bool("KLAUS_TRUST_PROXY", d.trust_proxy),
            port: env_parse("KLAUS_PORT", d.port),
        }
    }

    /// Resolve the model for one run: a caller-supplied id must be on the
    /// allow-list (exact match); no caller choice means the configured default.
    pub fn resolve_model(&self, requested: Option<&str>) -> Result<String, String> {
        match requested {
            None => Ok(self.model.clone()),
            Some(m) if ALLOWED_MODELS.contains(&m) => Ok(m.to_string()),
            Some(m) => Err(format!("model not allowed: {m}")),
        }
    }
}

// ── Env helpers ───────────────────────────────────────────────────────────────

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(%key, value = %raw, "unparseable value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!(%key, value = %raw, "unparseable boolean, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default.as_millis() as u64))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
