// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Router assembly, background sweepers, and the serve loop with bounded
//! graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use klaus_config::Config;
use klaus_core::AgentRunner;
use klaus_tools::ApprovalBroker;

use crate::{auth, export, routes, security, state::AppState, workspace_routes, ws, RateLimiter, SessionOwners};

impl AppState {
    pub fn new(runner: Arc<AgentRunner>, broker: Arc<ApprovalBroker>, config: Arc<Config>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            runner,
            broker,
            config,
            limiter: Arc::new(RateLimiter::default_http()),
            owners: Arc::new(SessionOwners::new()),
            shutdown,
            started_at: Instant::now(),
        }
    }
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/prompt", post(routes::prompt))
        .route("/sessions", get(routes::list_sessions))
        .route(
            "/sessions/:id",
            get(routes::get_session).delete(routes::delete_session),
        )
        .route("/sessions/:id/cancel", post(routes::cancel_session))
        .route("/sessions/:id/rename", put(routes::rename_session))
        .route("/sessions/:id/pin", post(routes::pin_session))
        .route("/sessions/:id/tags", put(routes::set_tags))
        .route("/sessions/:id/export", get(export::export_session))
        .route("/workspace/tree", get(workspace_routes::tree))
        .route("/workspace/file", get(workspace_routes::file))
        .route("/workspace/rollback", post(workspace_routes::rollback))
        .route("/usage", get(routes::usage))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::bearer_auth_mw,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        .route("/ws", get(ws::ws_handler))
        .nest("/api", api)
        // Layer order (outermost last): CORS handles preflights before
        // anything else; the request-id middleware stamps every response
        // including rate-limit refusals.
        .layer(middleware::from_fn_with_state(state.clone(), auth::rate_limit_mw))
        .layer(middleware::from_fn(security::security_headers_mw))
        .layer(middleware::from_fn(auth::request_id_mw))
        .layer(security::cors_layer(&state.config))
        .with_state(state)
}

/// Serve until SIGINT/SIGTERM, then drain within `shutdown_timeout`.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    anyhow::ensure!(
        state.config.api_secret.is_some(),
        "KLAUS_API_SECRET must be set before the server can start"
    );

    tokio::spawn(run_sweepers(state.clone()));

    let app = build_router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "klaus listening");

    let notify = state.shutdown.clone();
    let graceful = async move {
        shutdown_signal().await;
        info!("shutdown signal received, notifying clients and draining");
        let _ = notify.send(());
    };

    let drain = state.config.shutdown_timeout;
    let mut force = state.shutdown.subscribe();
    let serve_fut = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(graceful);

    tokio::select! {
        result = serve_fut => result?,
        _ = async {
            let _ = force.recv().await;
            tokio::time::sleep(drain).await;
        } => {
            warn!(timeout_secs = drain.as_secs(), "drain window elapsed, forcing close");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Periodic housekeeping: idle-session expiry on its configured cadence;
/// ownership, rate-limit and event-bus pruning every minute.
async fn run_sweepers(state: AppState) {
    let ttl_period = state.config.session_cleanup_interval.max(Duration::from_secs(1));
    let mut ttl_tick = tokio::time::interval(ttl_period);
    let mut minute_tick = tokio::time::interval(Duration::from_secs(60));
    // Skip the immediate first ticks.
    ttl_tick.tick().await;
    minute_tick.tick().await;

    loop {
        tokio::select! {
            _ = ttl_tick.tick() => {
                if !state.config.session_ttl.is_zero() {
                    match state.runner.store().expire_idle_sessions(state.config.session_ttl) {
                        Ok(0) => {}
                        Ok(n) => info!(count = n, "expired idle sessions"),
                        Err(e) => warn!(error = %e, "session expiry sweep failed"),
                    }
                }
            }
            _ = minute_tick.tick() => {
                let orphans = state.owners.sweep();
                if orphans > 0 {
                    info!(count = orphans, "swept orphaned session owners");
                }
                state.limiter.prune();
                state.runner.bus().prune();
            }
        }
    }
}
