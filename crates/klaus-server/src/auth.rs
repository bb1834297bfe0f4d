// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Request correlation, bearer authentication and per-IP rate limiting.
//!
//! # Authentication
//!
//! `/api/*` requires `Authorization: Bearer <secret>`.  Comparison uses
//! [`subtle::ConstantTimeEq`] so response timing never leaks how much of a
//! guessed secret matched.  Failures are audit-logged with the source IP.
//!
//! # Rate limiting
//!
//! A token-bucket per remote IP: 60 requests/minute, refilled continuously.
//! Every response carries `X-RateLimit-Limit`, `X-RateLimit-Remaining` and
//! `X-RateLimit-Reset`; exceeding the bucket yields 429.  The bucket map
//! lives in façade memory and is pruned periodically; these are DoS
//! mitigations, not durable quotas, so losing them on restart is fine.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::state::AppState;

const RATE_LIMIT_PER_MINUTE: u32 = 60;
/// Buckets idle longer than this are pruned.
const BUCKET_IDLE_SECS: u64 = 600;

/// Correlation id attached to every request and echoed in responses.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

// ── Request id ────────────────────────────────────────────────────────────────

/// Attach `X-Request-ID` (generated when absent), echo it on the response,
/// and stamp it into JSON error bodies.
pub async fn request_id_mw(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(id.clone()));

    let resp = next.run(req).await;
    let (mut parts, body) = resp.into_parts();
    if let Ok(value) = HeaderValue::from_str(&id) {
        parts.headers.insert("x-request-id", value);
    }

    // Errors carry the correlation id in the body as well, so a caller can
    // report it without digging through headers.
    if parts.status.is_client_error() || parts.status.is_server_error() {
        if let Ok(bytes) = axum::body::to_bytes(body, 1 << 20).await {
            if let Ok(mut json) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                if let Some(obj) = json.as_object_mut() {
                    obj.insert("requestId".into(), id.into());
                    let body = serde_json::to_vec(&json).unwrap_or_else(|_| bytes.to_vec());
                    return Response::from_parts(parts, Body::from(body));
                }
            }
            return Response::from_parts(parts, Body::from(bytes));
        }
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Response::from_parts(parts, body)
}

// ── Bearer auth ───────────────────────────────────────────────────────────────

pub fn verify_secret(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Middleware guarding `/api/*`.
pub async fn bearer_auth_mw(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api_secret.as_deref() else {
        // serve() refuses to start without a secret; this is a belt.
        return unauthorized();
    };
    match extract_bearer(req.headers()) {
        Some(provided) if verify_secret(provided, expected) => next.run(req).await,
        _ => {
            let ip = client_ip(&state, req.headers(), addr);
            warn!(%ip, path = %req.uri().path(), "authentication failed");
            unauthorized()
        }
    }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, axum::Json(json!({"error": "Unauthorized"}))).into_response()
}

/// The remote address used for rate limiting: the socket peer, or the first
/// `X-Forwarded-For` hop when the operator fronts us with a trusted proxy.
pub fn client_ip(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
    if state.config.trust_proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
        {
            return forwarded;
        }
    }
    addr.ip()
}

// ── Rate limiting ─────────────────────────────────────────────────────────────

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// The verdict for one request, including the header values to attach.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until at least one token is available again.
    pub reset_secs: u64,
}

/// Token-bucket per client IP.
pub struct RateLimiter {
    per_minute: u32,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self { per_minute: per_minute.max(1), buckets: Mutex::new(HashMap::new()) }
    }

    pub fn default_http() -> Self {
        Self::new(RATE_LIMIT_PER_MINUTE)
    }

    pub fn check(&self, ip: IpAddr) -> RateDecision {
        let now = Instant::now();
        let refill_per_sec = self.per_minute as f64 / 60.0;
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(ip).or_insert(Bucket {
            tokens: self.per_minute as f64,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(self.per_minute as f64);
        bucket.last_refill = now;
        bucket.last_seen = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        let reset_secs = if bucket.tokens >= 1.0 {
            0
        } else {
            ((1.0 - bucket.tokens) / refill_per_sec).ceil() as u64
        };
        RateDecision {
            allowed,
            limit: self.per_minute,
            remaining: bucket.tokens.floor().max(0.0) as u32,
            reset_secs,
        }
    }

    /// Drop buckets that have not been touched recently.
    pub fn prune(&self) {
        let now = Instant::now();
        self.buckets
            .lock()
            .unwrap()
            .retain(|_, b| now.duration_since(b.last_seen).as_secs() < BUCKET_IDLE_SECS);
    }

    pub fn tracked_ips(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

/// Middleware applying the limiter and stamping the `X-RateLimit-*` headers
/// on every response.
pub async fn rate_limit_mw(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&state, req.headers(), addr);
    let decision = state.limiter.check(ip);

    let mut resp = if decision.allowed {
        next.run(req).await
    } else {
        warn!(%ip, "rate limit exceeded");
        (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(json!({"error": "Too Many Requests"})),
        )
            .into_response()
    };

    let headers = resp.headers_mut();
    headers.insert("x-ratelimit-limit", decision.limit.into());
    headers.insert("x-ratelimit-remaining", decision.remaining.into());
    headers.insert("x-ratelimit-reset", decision.reset_secs.into());
    resp
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_secret_accepts_exact_match() {
        assert!(verify_secret("hunter2", "hunter2"));
    }

    #[test]
    fn verify_secret_rejects_mismatch_and_prefix() {
        assert!(!verify_secret("hunter", "hunter2"));
        assert!(!verify_secret("hunter22", "hunter2"));
        assert!(!verify_secret("", "hunter2"));
    }

    #[test]
    fn extract_bearer_requires_the_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer tok-123".parse().unwrap(),
        );
        assert_eq!(extract_bearer(&headers), Some("tok-123"));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic dXNlcg==".parse().unwrap(),
        );
        assert_eq!(extract_bearer(&headers), None);
    }

    #[test]
    fn bucket_allows_burst_up_to_limit_then_refuses() {
        let limiter = RateLimiter::new(5);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for i in 0..5 {
            let d = limiter.check(ip);
            assert!(d.allowed, "request {i} should pass");
        }
        let d = limiter.check(ip);
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert!(d.reset_secs >= 1);
    }

    #[test]
    fn buckets_are_per_ip() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("10.0.0.1".parse().unwrap()).allowed);
        assert!(!limiter.check("10.0.0.1".parse().unwrap()).allowed);
        assert!(limiter.check("10.0.0.2".parse().unwrap()).allowed);
    }

    #[test]
    fn remaining_counts_down() {
        let limiter = RateLimiter::new(3);
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        assert_eq!(limiter.check(ip).remaining, 2);
        assert_eq!(limiter.check(ip).remaining, 1);
        assert_eq!(limiter.check(ip).remaining, 0);
    }

    #[test]
    fn prune_keeps_recent_buckets() {
        let limiter = RateLimiter::new(10);
        limiter.check("10.0.0.1".parse().unwrap());
        limiter.prune();
        assert_eq!(limiter.tracked_ips(), 1);
    }
}
