// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Integration tests for the HTTP façade using the mock model provider:
/// the full middleware stack and routes, driven through tower without a
/// listening socket.
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use klaus_config::Config;
use klaus_core::{AgentRunner, EventBus};
use klaus_model::{MockProvider, ModelProvider, ScriptedTurn};
use klaus_server::AppState;
use klaus_store::Store;
use klaus_tools::{builtin, ApprovalBroker, ToolDispatcher};

const SECRET: &str = "test-secret";

struct TestApp {
    router: axum::Router,
    main: Arc<MockProvider>,
    store: Arc<Store>,
    _workspace: tempfile::TempDir,
}

fn test_app(tweak: impl FnOnce(&mut Config)) -> TestApp {
    let workspace = tempfile::tempdir().unwrap();
    let mut config = Config {
        api_secret: Some(SECRET.to_string()),
        workspace_dir: workspace.path().to_path_buf(),
        ..Config::default()
    };
    tweak(&mut config);
    let config = Arc::new(config);

    let store = Arc::new(Store::open_in_memory().unwrap());
    let main = Arc::new(MockProvider::new());
    let internal = Arc::new(MockProvider::new());
    let registry = Arc::new(builtin::standard_registry(
        config.workspace_dir.clone(),
        Arc::clone(&store),
        None,
    ));
    let dispatcher = Arc::new(ToolDispatcher::new(registry, Arc::clone(&store)));
    let runner = Arc::new(AgentRunner::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&main) as Arc<dyn ModelProvider>,
        internal as Arc<dyn ModelProvider>,
        dispatcher,
        Arc::new(EventBus::new()),
    ));
    let state = AppState::new(runner, Arc::new(ApprovalBroker::new()), config);

    let router = klaus_server::build_router(state)
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9999))));
    TestApp { router, main, store, _workspace: workspace }
}

fn authed(request: axum::http::request::Builder) -> axum::http::request::Builder {
    request.header(header::AUTHORIZATION, format!("Bearer {SECRET}"))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ── Auth ──────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn api_requires_bearer_secret() {
    let app = test_app(|_| {});

    let response = app
        .router
        .clone()
        .oneshot(Request::get("/api/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/api/sessions")
                .header(header::AUTHORIZATION, "Bearer wrong-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router
        .clone()
        .oneshot(authed(Request::get("/api/sessions")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_is_open_and_reports_checks() {
    let app = test_app(|_| {});
    let response = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    // Status depends on whether docker is reachable in the environment.
    assert!(
        response.status() == StatusCode::OK
            || response.status() == StatusCode::SERVICE_UNAVAILABLE
    );

    let body = body_json(response).await;
    assert_eq!(body["checks"]["database"], true);
    assert_eq!(body["activeSessions"], 0);
    assert!(body.get("maxConcurrentSessions").is_some());
    assert!(body.get("estimatedCostUsd").is_some());
}

#[tokio::test]
async fn responses_carry_rate_limit_and_request_id_headers() {
    let app = test_app(|_| {});
    let response = app
        .router
        .oneshot(
            Request::get("/health")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let headers = response.headers();
    assert_eq!(headers.get("x-request-id").unwrap(), "req-42");
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "60");
    assert!(headers.get("x-ratelimit-remaining").is_some());
    assert!(headers.get("x-ratelimit-reset").is_some());
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert!(headers
        .get(header::CONTENT_SECURITY_POLICY)
        .unwrap()
        .to_str()
        .unwrap()
        .contains("frame-ancestors 'none'"));
}

// ── Prompt flow ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn prompt_runs_the_agent_and_persists_the_session() {
    let app = test_app(|_| {});
    app.main.push_turn(ScriptedTurn::text("All done.").with_usage(120, 30));

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::post("/api/prompt"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"message": "do the thing", "sessionId": "sess-http"})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["sessionId"], "sess-http");
    assert_eq!(body["tokenUsage"]["totalTokens"], 150);

    let response = app
        .router
        .clone()
        .oneshot(authed(Request::get("/api/sessions/sess-http")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    assert_eq!(body["tokenUsage"]["inputTokens"], 120);
}

#[tokio::test]
async fn prompt_without_message_is_bad_request_with_request_id() {
    let app = test_app(|_| {});
    let response = app
        .router
        .oneshot(
            authed(Request::post("/api/prompt"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "message is required");
    assert!(body.get("requestId").is_some(), "error bodies carry the correlation id");
}

#[tokio::test]
async fn oversized_prompt_is_bad_request() {
    let app = test_app(|c| c.max_prompt_chars = 10);
    let response = app
        .router
        .oneshot(
            authed(Request::post("/api/prompt"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"message": "a prompt that is too long"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ── Session management ────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_session_is_404() {
    let app = test_app(|_| {});
    let response = app
        .router
        .oneshot(authed(Request::get("/api/sessions/ghost")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rename_pin_and_tags_round_trip() {
    let app = test_app(|_| {});
    app.store.create_session("s1", "/ws").unwrap();

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::put("/api/sessions/s1/rename"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::json!({"name": "tokenizer work"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .clone()
        .oneshot(authed(Request::post("/api/sessions/s1/pin")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(response).await["pinned"], true);

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::put("/api/sessions/s1/tags"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"tags": ["rust", "rust", "parser"]}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["tags"], serde_json::json!(["rust", "parser"]));

    let session = app.store.get_session("s1").unwrap().unwrap();
    assert_eq!(session.summary.as_deref(), Some("tokenizer work"));
    assert!(session.pinned);
}

#[tokio::test]
async fn rename_without_name_is_bad_request() {
    let app = test_app(|_| {});
    app.store.create_session("s1", "/ws").unwrap();
    let response = app
        .router
        .oneshot(
            authed(Request::put("/api/sessions/s1/rename"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ── Export round-trip ─────────────────────────────────────────────────────────

#[tokio::test]
async fn json_export_round_trips_structurally() {
    let app = test_app(|_| {});
    app.main.push_turn(ScriptedTurn::text("done").with_usage(40, 10));
    app.router
        .clone()
        .oneshot(
            authed(Request::post("/api/prompt"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"message": "export me", "sessionId": "sess-x"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::get("/api/sessions/sess-x/export?format=json"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .contains("attachment"));

    let exported = body_json(response).await;
    assert_eq!(exported["session"]["id"], "sess-x");
    assert_eq!(
        exported["messages"].as_array().unwrap().len(),
        app.store.count_messages("sess-x").unwrap()
    );
    let usage = app.store.get_session_token_usage("sess-x").unwrap();
    assert_eq!(exported["tokenUsage"]["totalTokens"], usage.total_tokens);
}

#[tokio::test]
async fn markdown_export_renders_a_transcript() {
    let app = test_app(|_| {});
    app.store.create_session("sess-md", "/ws").unwrap();
    app.store
        .add_message(klaus_store::NewMessage {
            session_id: "sess-md".into(),
            role: "user".into(),
            content: "hello".into(),
            tool_name: None,
            metadata: None,
        })
        .unwrap();

    let response = app
        .router
        .oneshot(
            authed(Request::get("/api/sessions/sess-md/export?format=markdown"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let markdown = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(markdown.contains("# Session sess-md"));
    assert!(markdown.contains("### User"));
    assert!(markdown.contains("hello"));
}

// ── Workspace ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn workspace_file_enforces_the_jail() {
    let app = test_app(|_| {});
    std::fs::write(app._workspace.path().join("inside.txt"), "visible").unwrap();

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::get("/api/workspace/file?path=inside.txt"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["content"], "visible");

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::get("/api/workspace/file?path=../../etc/passwd"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::get("/api/workspace/file?path=missing.txt"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .router
        .clone()
        .oneshot(authed(Request::get("/api/workspace/file")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn workspace_tree_serves_304_on_matching_etag() {
    let app = test_app(|_| {});
    std::fs::write(app._workspace.path().join("a.rs"), "fn a() {}").unwrap();

    let first = app
        .router
        .clone()
        .oneshot(authed(Request::get("/api/workspace/tree")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(
        first.headers().get(header::CACHE_CONTROL).unwrap(),
        "private, max-age=5"
    );
    let etag = first.headers().get(header::ETAG).unwrap().clone();

    let second = app
        .router
        .clone()
        .oneshot(
            authed(Request::get("/api/workspace/tree"))
                .header(header::IF_NONE_MATCH, etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
}

// ── Metrics ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn metrics_expose_prometheus_text() {
    let app = test_app(|_| {});
    let response = app
        .router
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("# TYPE klaus_active_sessions gauge"));
    assert!(text.contains("klaus_active_sessions 0"));
}

#[tokio::test]
async fn metrics_can_be_disabled() {
    let app = test_app(|c| c.metrics_enabled = false);
    let response = app
        .router
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
