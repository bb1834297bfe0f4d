// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Hardening headers and CORS.
//!
//! | Header | Value |
//! |---|---|
//! | `Content-Security-Policy` | `default-src 'self'; frame-ancestors 'none'` |
//! | `X-Content-Type-Options`  | `nosniff` |
//! | `X-Frame-Options`         | `DENY` |
//! | `Referrer-Policy`         | `strict-origin-when-cross-origin` |
//!
//! CORS allows exactly the configured origin (or `*` in dev when none is
//! configured); an untrusted request origin is never reflected back.

use axum::{
    extract::Request,
    http::{HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use klaus_config::Config;

static CSP: HeaderValue =
    HeaderValue::from_static("default-src 'self'; frame-ancestors 'none'");
static NO_SNIFF: HeaderValue = HeaderValue::from_static("nosniff");
static DENY_FRAME: HeaderValue = HeaderValue::from_static("DENY");
static REFERRER: HeaderValue = HeaderValue::from_static("strict-origin-when-cross-origin");

const CORS_MAX_AGE_SECS: u64 = 86_400;

/// Append the hardening headers to every response.
pub async fn security_headers_mw(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert(axum::http::header::CONTENT_SECURITY_POLICY, CSP.clone());
    headers.insert(axum::http::header::X_CONTENT_TYPE_OPTIONS, NO_SNIFF.clone());
    headers.insert(axum::http::header::X_FRAME_OPTIONS, DENY_FRAME.clone());
    headers.insert(axum::http::header::REFERRER_POLICY, REFERRER.clone());
    resp
}

/// Build the CORS layer from config.  With a configured origin only that
/// exact value is allowed; without one (dev) everything is.
pub fn cors_layer(config: &Config) -> CorsLayer {
    let origin = match &config.cors_origin {
        Some(origin) => match HeaderValue::from_str(origin) {
            Ok(value) => AllowOrigin::exact(value),
            Err(_) => {
                tracing::warn!(origin, "invalid KLAUS_CORS_ORIGIN, denying cross-origin");
                AllowOrigin::list(Vec::new())
            }
        },
        None => AllowOrigin::any(),
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static("x-api-key"),
            axum::http::HeaderName::from_static("x-request-id"),
        ])
        .max_age(std::time::Duration::from_secs(CORS_MAX_AGE_SECS))
}
