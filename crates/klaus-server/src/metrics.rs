// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Prometheus text exposition (format v0.0.4), hand-rendered; the metric
//! set is small and the store already aggregates everything worth scraping.

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;

use crate::state::AppState;

pub fn render(state: &AppState) -> impl IntoResponse {
    let mut out = String::with_capacity(1024);

    gauge(
        &mut out,
        "klaus_active_sessions",
        "Runs currently between admission and release.",
        state.runner.active_sessions() as f64,
    );
    gauge(
        &mut out,
        "klaus_max_concurrent_sessions",
        "Configured session admission limit.",
        state.config.max_concurrent_sessions as f64,
    );
    gauge(
        &mut out,
        "klaus_uptime_seconds",
        "Seconds since the façade started.",
        state.started_at.elapsed().as_secs_f64(),
    );
    gauge(
        &mut out,
        "klaus_rate_limited_ips",
        "Client IPs currently tracked by the rate limiter.",
        state.limiter.tracked_ips() as f64,
    );
    gauge(
        &mut out,
        "klaus_ws_owned_sessions",
        "Sessions currently owned by a WebSocket connection.",
        state.owners.len() as f64,
    );

    if let Ok(usage) = state.runner.store().get_total_token_usage() {
        counter(
            &mut out,
            "klaus_tokens_input_total",
            "Input tokens recorded across all sessions.",
            usage.input_tokens as f64,
        );
        counter(
            &mut out,
            "klaus_tokens_output_total",
            "Output tokens recorded across all sessions.",
            usage.output_tokens as f64,
        );
        gauge(
            &mut out,
            "klaus_estimated_cost_usd",
            "Estimated cost of all recorded token usage.",
            usage.estimated_cost_usd,
        );
    }
    if let Ok(stats) = state.runner.store().get_tool_call_stats(None) {
        let calls: u64 = stats.iter().map(|s| s.calls).sum();
        counter(
            &mut out,
            "klaus_tool_calls_total",
            "Tool calls recorded across all sessions.",
            calls as f64,
        );
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        out,
    )
}

fn gauge(out: &mut String, name: &str, help: &str, value: f64) {
    sample(out, name, help, "gauge", value);
}

fn counter(out: &mut String, name: &str, help: &str, value: f64) {
    sample(out, name, help, "counter", value);
}

fn sample(out: &mut String, name: &str, help: &str, kind: &str, value: f64) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"));
}
