//! End-to-end scenarios: a real gateway router in front of real local
//! upstream listeners.

use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{Method, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::any;
use relay_core::config::AppConfig;
use relay_server::{AppState, build_router};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tower::util::ServiceExt;

/// Bind a throwaway upstream and return its base URL.
async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn gateway(config: Value) -> (AppState, Router) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, serde_json::to_vec(&config).unwrap()).unwrap();
    let config = AppConfig::load(path.to_str().unwrap()).unwrap();
    let state = AppState::build(config, dir.path()).unwrap();
    relay_translator::register_all(&state.registry);
    let router = build_router(state.clone());
    // the tempdir must outlive the state; leak it for the test's duration
    std::mem::forget(dir);
    (state, router)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn send(router: &Router, request: Request) -> axum::response::Response {
    router.clone().oneshot(request).await.unwrap()
}

fn get(path: &str) -> Request {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn route_match_and_path_rewrite() {
    // upstream echoes the path it received
    let upstream = spawn_upstream(Router::new().fallback(any(|req: Request| async move {
        axum::Json(json!({"seen": req.uri().path()}))
    })))
    .await;

    let (_state, router) = gateway(json!({
        "routes": [{
            "path": "/api",
            "pathRewrite": {"^/api/v1": "/v1-internal", "^/api": ""},
            "upstreams": [{"target": upstream}]
        }]
    }));

    let response = send(&router, get("/api/v1/users")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["seen"], "/v1-internal/users");

    let response = send(&router, get("/api/health")).await;
    assert_eq!(body_json(response).await["seen"], "/health");
}

#[tokio::test]
async fn unmatched_route_is_404() {
    let (_state, router) = gateway(json!({
        "routes": [{"path": "/api", "upstreams": [{"target": "http://127.0.0.1:9/"}]}]
    }));
    let response = send(&router, get("/nothing/here")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "Route not found");
}

#[tokio::test]
async fn failover_on_retryable_status() {
    let a_hits = Arc::new(AtomicUsize::new(0));
    let a_counter = Arc::clone(&a_hits);
    let upstream_a = spawn_upstream(Router::new().fallback(any(move || {
        let counter = Arc::clone(&a_counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            (StatusCode::INTERNAL_SERVER_ERROR, "a-broken").into_response()
        }
    })))
    .await;
    let upstream_b = spawn_upstream(
        Router::new().fallback(any(|| async { axum::Json(json!({"from": "b"})) })),
    )
    .await;

    let (state, router) = gateway(json!({
        "routes": [{
            "path": "/api",
            "failover": {
                "retryableStatusCodes": [500],
                "consecutiveFailuresThreshold": 1
            },
            "upstreams": [
                {"target": upstream_a, "priority": 1},
                {"target": upstream_b, "priority": 2}
            ]
        }]
    }));

    let response = send(&router, get("/api/x")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["from"], "b");
    assert_eq!(a_hits.load(Ordering::SeqCst), 1);

    // A tripped its breaker, B stayed healthy
    let stats = body_json(send(&router, get("/api/stats")).await).await;
    let routes = &stats["routes"]["/api"];
    let status_of = |target: &str| -> String {
        routes
            .as_array()
            .unwrap()
            .iter()
            .find(|u| u["target"].as_str().unwrap().starts_with(target))
            .unwrap()["status"]
            .as_str()
            .unwrap()
            .to_string()
    };
    assert_eq!(status_of(&upstream_a), "UNHEALTHY");
    assert_eq!(status_of(&upstream_b), "HEALTHY");

    // two attempt entries: retry then final
    state.writer.flush().await.unwrap();
    let logs = body_json(send(&router, get("/api/logs?limit=10")).await).await;
    let items = logs["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    let mut types: Vec<(u64, String)> = items
        .iter()
        .map(|e| {
            (
                e["failover"]["attemptNumber"].as_u64().unwrap(),
                e["failover"]["requestType"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    types.sort();
    assert_eq!(types, vec![(1, "retry".to_string()), (2, "final".to_string())]);
}

#[tokio::test]
async fn all_upstreams_ineligible_returns_503_with_reason() {
    // a dead upstream: connection refused counts as a failure
    let (state, router) = gateway(json!({
        "routes": [{
            "path": "/api",
            "failover": {
                "consecutiveFailuresThreshold": 1,
                "recoveryIntervalMs": 60000
            },
            "upstreams": [{"target": "http://127.0.0.1:1/"}]
        }]
    }));

    let response = send(&router, get("/api/x")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // now the breaker is open and within its recovery window
    let response = send(&router, get("/api/x")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Service Unavailable");
    assert_eq!(
        body["reason"],
        "All upstreams are unhealthy and within recovery interval"
    );

    // the ineligible request logged zero attempts
    state.writer.flush().await.unwrap();
    let logs = body_json(send(&router, get("/api/logs?limit=10")).await).await;
    assert_eq!(logs["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn auth_strips_authorization_header() {
    let upstream = spawn_upstream(Router::new().fallback(any(|req: Request| async move {
        axum::Json(json!({
            "sawAuthorization": req.headers().contains_key(header::AUTHORIZATION),
        }))
    })))
    .await;

    let (_state, router) = gateway(json!({
        "auth": {"enabled": true, "tokens": ["secret-token"]},
        "routes": [{"path": "/api", "upstreams": [{"target": upstream}]}]
    }));

    // valid token passes the gate but never reaches the upstream
    let request = Request::builder()
        .uri("/api/x")
        .header(header::AUTHORIZATION, "Bearer secret-token")
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["sawAuthorization"], false);

    // missing token is a 401 with the challenge header
    let response = send(&router, get("/api/x")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Bearer"
    );
}

#[tokio::test]
async fn sse_stream_translated_between_vendors() {
    // Anthropic-style upstream: emits the event sequence for "Hello there!"
    const ANTHROPIC_EVENTS: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude\",\"usage\":{\"input_tokens\":2}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\" there!\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":4}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    let upstream = spawn_upstream(Router::new().fallback(any(|req: Request| async move {
        assert_eq!(req.uri().path(), "/v1/messages");
        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            ANTHROPIC_EVENTS,
        )
    })))
    .await;

    let (_state, router) = gateway(json!({
        "routes": [{
            "path": "/v1/chat/completions",
            "plugins": ["openai-to-anthropic"],
            "upstreams": [{"target": upstream}]
        }]
    }));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "model": "claude",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}],
            })
            .to_string(),
        ))
        .unwrap();

    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let raw = String::from_utf8(bytes.to_vec()).unwrap();

    // reassemble the delta text from the OpenAI chunks
    let mut text = String::new();
    let mut finish = None;
    for line in raw.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data == "[DONE]" {
            continue;
        }
        let chunk: Value = serde_json::from_str(data).unwrap();
        assert_eq!(chunk["object"], "chat.completion.chunk");
        if let Some(t) = chunk["choices"][0]["delta"]["content"].as_str() {
            text.push_str(t);
        }
        if let Some(f) = chunk["choices"][0]["finish_reason"].as_str() {
            finish = Some(f.to_string());
        }
    }
    assert_eq!(text, "Hello there!");
    assert_eq!(finish.as_deref(), Some("stop"));
    assert!(raw.contains("data: [DONE]"));
}

#[tokio::test]
async fn payload_too_large_rejected() {
    let (_state, router) = gateway(json!({
        "bodyParserLimit": 1024,
        "routes": [{"path": "/api", "upstreams": [{"target": "http://127.0.0.1:9/"}]}]
    }));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/x")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(vec![b'x'; 2048]))
        .unwrap();
    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
