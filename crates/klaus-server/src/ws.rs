// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! WebSocket bridge: relays the per-session event bus to operator clients
//! and accepts prompts, cancellations, and patch-approval verdicts.
//!
//! Authentication happens before the upgrade, with the same secret as the
//! HTTP API (supplied as a bearer header, `x-api-key`, or `token` query
//! parameter for browser clients that cannot set headers on a WebSocket
//! handshake).  Client messages are rate-limited per connection.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use governor::{Quota, RateLimiter as Governor};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use klaus_core::{Envelope, RunRequest};

use crate::auth::{extract_bearer, verify_secret};
use crate::routes::{outcome_json, sanitize_error};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsAuthParams {
    token: Option<String>,
}

/// Client → server messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinSession { session_id: String },
    #[serde(rename_all = "camelCase")]
    Prompt {
        message: String,
        session_id: Option<String>,
        model: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Cancel { session_id: String },
    #[serde(rename_all = "camelCase")]
    PatchApprovalResponse { patch_id: String, approved: bool },
}

pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<WsAuthParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(expected) = state.config.api_secret.as_deref() else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| extract_bearer(&headers))
        .or(params.token.as_deref());
    match provided {
        Some(secret) if verify_secret(secret, expected) => {
            ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
        }
        _ => {
            warn!(peer = %addr, "WebSocket authentication failed");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, peer: SocketAddr) {
    info!(%peer, "WebSocket operator connected");
    let socket_id = uuid::Uuid::new_v4().to_string();
    // Liveness token: session ownership holds a weak reference to this, so
    // dropping it (connection close) orphans our sessions for the sweeper.
    let alive = Arc::new(());

    let quota = Quota::per_minute(
        NonZeroU32::new(state.config.ws_rate_limit.max(1)).unwrap_or(NonZeroU32::MIN),
    );
    let limiter = Governor::direct(quota);

    // Out-of-band sender for completions produced by spawned run tasks.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let mut shutdown_rx = state.shutdown.subscribe();
    let mut events: Option<broadcast::Receiver<Envelope>> = None;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                let goodbye = json!({"type": "server_shutdown", "message": "server is shutting down"});
                let _ = socket.send(WsMessage::Text(goodbye.to_string())).await;
                break;
            }
            Some(text) = out_rx.recv() => {
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            event = async { events.as_mut().expect("guarded by is_some").recv().await },
                if events.is_some() =>
            {
                match event {
                    Ok(envelope) => {
                        let frame = json!({"type": "agent_event", "event": envelope});
                        if socket.send(WsMessage::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(%peer, "WebSocket subscriber lagged by {n} events");
                        send_error(&mut socket, &format!("event stream lagged by {n} events"), Some(503)).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events = None;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if limiter.check().is_err() {
                            send_error(&mut socket, "rate limit exceeded", Some(429)).await;
                            continue;
                        }
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => {
                                handle_client_message(
                                    &state, &socket_id, &alive, &mut events,
                                    &out_tx, &mut socket, message,
                                )
                                .await;
                            }
                            Err(e) => {
                                debug!(%peer, "invalid client message: {e}");
                                send_error(&mut socket, &format!("invalid message: {e}"), Some(400)).await;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if socket.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(%peer, "WebSocket recv error: {e}");
                        break;
                    }
                }
            }
        }
    }

    info!(%peer, "WebSocket operator disconnected");
}

async fn handle_client_message(
    state: &AppState,
    socket_id: &str,
    alive: &Arc<()>,
    events: &mut Option<broadcast::Receiver<Envelope>>,
    out_tx: &mpsc::Sender<String>,
    socket: &mut WebSocket,
    message: ClientMessage,
) {
    match message {
        ClientMessage::JoinSession { session_id } => {
            match join(state, socket_id, alive, &session_id) {
                Ok(()) => {
                    *events = Some(state.runner.bus().subscribe(&session_id));
                    let frame = json!({"type": "joined", "sessionId": session_id});
                    let _ = socket.send(WsMessage::Text(frame.to_string())).await;
                }
                Err(reason) => send_error(socket, reason, Some(403)).await,
            }
        }
        ClientMessage::Prompt { message, session_id, model } => {
            let session_id =
                session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            if let Err(reason) = join(state, socket_id, alive, &session_id) {
                send_error(socket, reason, Some(403)).await;
                return;
            }
            // Subscribe before the run starts so no event is missed.
            *events = Some(state.runner.bus().subscribe(&session_id));
            let frame = json!({"type": "joined", "sessionId": session_id});
            let _ = socket.send(WsMessage::Text(frame.to_string())).await;

            let runner = Arc::clone(&state.runner);
            let out = out_tx.clone();
            tokio::spawn(async move {
                let result = runner
                    .run(RunRequest { prompt: message, session_id: Some(session_id), model })
                    .await;
                let frame = match result {
                    Ok(outcome) => {
                        json!({"type": "prompt_complete", "result": outcome_json(&outcome)})
                    }
                    Err(e) => json!({
                        "type": "error_event",
                        "error": sanitize_error(&e.to_string()),
                    }),
                };
                let _ = out.send(frame.to_string()).await;
            });
        }
        ClientMessage::Cancel { session_id } => {
            let cancelled = state.runner.cancel(&session_id);
            let frame = json!({
                "type": "cancel_result",
                "cancelled": cancelled,
                "sessionId": session_id,
            });
            let _ = socket.send(WsMessage::Text(frame.to_string())).await;
        }
        ClientMessage::PatchApprovalResponse { patch_id, approved } => {
            if !state.broker.resolve(&patch_id, approved) {
                send_error(socket, "unknown or expired patch id", Some(404)).await;
            }
        }
    }
}

fn join(
    state: &AppState,
    socket_id: &str,
    alive: &Arc<()>,
    session_id: &str,
) -> Result<(), &'static str> {
    let exists = state
        .runner
        .store()
        .get_session(session_id)
        .map(|s| s.is_some())
        .unwrap_or(false);
    state.owners.try_join(session_id, socket_id, alive, exists)
}

async fn send_error(socket: &mut WebSocket, error: &str, code: Option<u16>) {
    let frame = json!({"type": "error_event", "error": error, "code": code});
    let _ = socket.send(WsMessage::Text(frame.to_string())).await;
}
