// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The HTTP/WebSocket façade.
//!
//! Everything under `/api/*` requires the bearer secret (compared in
//! constant time); `/health` and `/metrics` are open.  Every request gets a
//! correlation id, per-IP token-bucket rate limiting with
//! `X-RateLimit-*` headers, hardening headers, and configured-origin CORS.
//!
//! The WebSocket bridge at `/ws` relays the event bus to operator clients
//! and accepts prompts, cancellations and patch-approval verdicts.

mod auth;
mod export;
mod metrics;
mod routes;
mod security;
mod server;
mod state;
mod workspace_routes;
mod ws;

pub use auth::RateLimiter;
pub use server::{build_router, serve};
pub use state::{AppState, SessionOwners};
