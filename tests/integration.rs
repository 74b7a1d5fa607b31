// Waystation integration tests — one binary, an in-process gateway per test.
//
// The local model engine is mocked with a small axum server speaking the
// native NDJSON chat API plus an OpenAI-compatible surface for remote-
// provider scenarios. MCP servers are shell-scripted stdio stubs speaking
// line-delimited JSON-RPC.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;
use waystation::engine::breaker::BreakerState;
use waystation::engine::state::GatewayState;
use waystation::{boot, BootOptions};

// ── Mock upstream engine ───────────────────────────────────────────────────

#[derive(Default)]
struct MockEngine {
    chat_calls: AtomicUsize,
    slow_inflight: AtomicUsize,
    slow_max_inflight: AtomicUsize,
}

async fn spawn_mock_engine() -> (SocketAddr, Arc<MockEngine>) {
    let mock = Arc::new(MockEngine::default());
    let app = Router::new()
        .route("/probe", get(|| async { "ok" }))
        .route("/api/tags", get(api_tags))
        .route("/api/chat", post(api_chat))
        .route("/v1/embeddings", post(embeddings))
        .route("/slow/chat/completions", post(slow_chat))
        .route("/hang/chat/completions", post(hang_chat))
        .with_state(Arc::clone(&mock));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, mock)
}

async fn api_tags() -> Json<Value> {
    Json(json!({"models": [{"name": "llama3.2", "size": 1, "modified_at": ""}]}))
}

async fn embeddings() -> Json<Value> {
    Json(json!({"object": "list", "data": [{"embedding": [0.1, 0.2], "index": 0}]}))
}

/// Native engine chat: answers the classifier with a menu decision, asks for
/// the greet tool on the first agent round, and summarizes the tool result
/// on the second.
async fn api_chat(
    State(mock): State<Arc<MockEngine>>,
    Json(body): Json<Value>,
) -> axum::response::Response {
    mock.chat_calls.fetch_add(1, Ordering::SeqCst);
    let empty = vec![];
    let messages = body["messages"].as_array().unwrap_or(&empty);
    let stream = body["stream"].as_bool().unwrap_or(false);

    let is_classifier = messages.iter().any(|m| {
        m["content"]
            .as_str()
            .map(|c| c.contains("tool-menu classifier"))
            .unwrap_or(false)
    });
    if is_classifier {
        let decision = r#"{"target_servers": ["fs"], "advice_topics": [], "system_action": null}"#;
        return Json(json!({
            "model": "llama3.2",
            "message": {"role": "assistant", "content": decision},
            "done": true,
            "prompt_eval_count": 12,
            "eval_count": 6,
        }))
        .into_response();
    }

    let tool_result = messages
        .iter()
        .rev()
        .find(|m| m["role"] == "tool")
        .and_then(|m| m["content"].as_str());

    if !stream {
        return Json(json!({
            "model": "llama3.2",
            "message": {"role": "assistant", "content": "plain reply"},
            "done": true,
            "prompt_eval_count": 5,
            "eval_count": 2,
        }))
        .into_response();
    }

    let ndjson = match tool_result {
        Some(result) => format!(
            "{}\n{}\n",
            json!({"model": "llama3.2", "message": {"role": "assistant", "content": format!("The greet tool says: {result}")}, "done": false}),
            json!({"model": "llama3.2", "message": {"role": "assistant", "content": ""}, "done": true, "prompt_eval_count": 20, "eval_count": 8}),
        ),
        None => format!(
            "{}\n{}\n",
            json!({"model": "llama3.2", "message": {"role": "assistant", "content": "", "tool_calls": [{"function": {"name": "mcp__fs__greet", "arguments": {}}}]}, "done": false}),
            json!({"model": "llama3.2", "message": {"role": "assistant", "content": ""}, "done": true, "prompt_eval_count": 15, "eval_count": 3}),
        ),
    };
    ndjson.into_response()
}

/// OpenAI-compatible upstream taking 300ms per call, tracking concurrency.
async fn slow_chat(State(mock): State<Arc<MockEngine>>) -> Json<Value> {
    let now = mock.slow_inflight.fetch_add(1, Ordering::SeqCst) + 1;
    mock.slow_max_inflight.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    mock.slow_inflight.fetch_sub(1, Ordering::SeqCst);
    Json(json!({
        "model": "m",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "slow done"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5},
    }))
}

/// Upstream that hangs well past the stage timeout.
async fn hang_chat() -> Json<Value> {
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    Json(json!({
        "model": "m",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "finally"}, "finish_reason": "stop"}],
    }))
}

// ── MCP stdio stubs ────────────────────────────────────────────────────────

const ECHO_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"stub"}}}\n' "$id";;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"greet","description":"Say hi","inputSchema":{"type":"object"}}]}}\n' "$id";;
    *'"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"hi"}],"isError":false}}\n' "$id";;
  esac
done
"#;

const FLAKY_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}\n' "$id";;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[]}}\n' "$id";;
    *'"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"boom"}}\n' "$id";;
  esac
done
"#;

fn write_mcp_manifest(config_dir: &Path, name: &str, script: &str) {
    let manifests = config_dir.join("mcp_manifests");
    std::fs::create_dir_all(&manifests).unwrap();
    std::fs::write(
        manifests.join(format!("{name}.json")),
        json!({
            "name": name,
            "transport": "stdio",
            "command": "sh",
            "args": ["-c", script],
        })
        .to_string(),
    )
    .unwrap();
}

// ── Gateway harness ────────────────────────────────────────────────────────

struct Gateway {
    _dir: tempfile::TempDir,
    state: Arc<GatewayState>,
    router: Router,
}

async fn start_gateway(
    engine: SocketAddr,
    pre_warm: bool,
    extra_config: Value,
    mcp_scripts: &[(&str, &str)],
) -> Gateway {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join("config");
    std::fs::create_dir_all(&config_dir).unwrap();

    let mut config = json!({
        "WAYSTATION_OFFLINE_PROBE_URL": format!("http://{engine}/probe"),
        "providers": {
            "local": {"kind": "native_local", "base_url": format!("http://{engine}")}
        },
        "fallback_model": "llama3.2",
    });
    merge(&mut config, extra_config);
    std::fs::write(config_dir.join("gateway.json"), config.to_string()).unwrap();
    for &(name, script) in mcp_scripts {
        write_mcp_manifest(&config_dir, name, script);
    }

    let state = boot(BootOptions {
        config_dir,
        db_path: dir.path().join("gateway.db"),
        pre_warm_mcp: pre_warm,
    })
    .await
    .unwrap();
    let router = waystation::build_router(state.clone());
    Gateway {
        _dir: dir,
        state,
        router,
    }
}

fn merge(base: &mut Value, extra: Value) {
    if let (Some(base_map), Value::Object(extra_map)) = (base.as_object_mut(), extra) {
        for (k, v) in extra_map {
            if v.is_object() {
                if let Some(slot) = base_map.get_mut(&k) {
                    if slot.is_object() {
                        merge(slot, v);
                        continue;
                    }
                }
            }
            base_map.insert(k, v);
        }
    }
}

async fn post_json(router: &Router, path: &str, body: Value, request_id: Option<Uuid>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(id) = request_id {
        builder = builder.header("x-request-id", id.to_string());
    }
    let response = router
        .clone()
        .oneshot(builder.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get_json(router: &Router, path: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn chat_body(model: &str, content: &str) -> Value {
    json!({"model": model, "messages": [{"role": "user", "content": content}]})
}

// ── S1: agent tool call over stdio ─────────────────────────────────────────

#[tokio::test]
async fn s1_agent_tool_call_over_stdio() {
    let (engine, _mock) = spawn_mock_engine().await;
    let gw = start_gateway(engine, true, json!({}), &[("fs", ECHO_SERVER)]).await;

    let request_id = Uuid::new_v4();
    let (status, body) = post_json(
        &gw.router,
        "/v1/chat/completions",
        chat_body("agent:default", "use greet"),
        Some(request_id),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let text = body["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(text.contains("hi"), "unexpected answer: {text}");

    // Tracker: the request ran to COMPLETED
    let record = gw.state.tracker.find_request(request_id).unwrap();
    assert_eq!(record.final_status.as_deref(), Some("completed"));
    assert!(record
        .stages
        .iter()
        .any(|s| s.stage == waystation::engine::observability::RequestStage::Completed));

    // Breaker stays closed, one tools/call metric recorded
    assert_eq!(
        gw.state.breakers.state("mcp:fs"),
        Some(BreakerState::Closed)
    );
    let summaries = gw.state.tracker.operation_summaries();
    let call_metric = summaries
        .iter()
        .find(|s| s.component == "mcp:fs" && s.operation == "tools/call")
        .expect("tools/call metric missing");
    assert_eq!(call_metric.count, 1);
    assert_eq!(call_metric.error_count, 0);

    // One live stdio subprocess; none after shutdown
    assert_eq!(gw.state.mcp.live_subprocess_count().await, 1);
    waystation::shutdown(&gw.state).await;
    assert_eq!(gw.state.mcp.live_subprocess_count().await, 0);
}

// ── S2: breaker opens, fails fast, operator reset recovers ─────────────────

#[tokio::test]
async fn s2_breaker_opens_then_resets() {
    let (engine, _mock) = spawn_mock_engine().await;
    let gw = start_gateway(engine, false, json!({}), &[("flaky", FLAKY_SERVER)]).await;

    for _ in 0..3 {
        let err = gw
            .state
            .mcp
            .call_tool("flaky", "greet", json!({}), None, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "upstream_unavailable");
    }
    assert_eq!(
        gw.state.breakers.state("mcp:flaky"),
        Some(BreakerState::Open)
    );

    // Within cooldown: fail fast as rate_limited without touching the server
    let err = gw
        .state
        .mcp
        .call_tool("flaky", "greet", json!({}), None, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "rate_limited");

    // Operator reset via the admin surface forces closed
    let (status, _) = post_json(
        &gw.router,
        "/admin/breakers/mcp:flaky/reset",
        json!({}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        gw.state.breakers.state("mcp:flaky"),
        Some(BreakerState::Closed)
    );
    waystation::shutdown(&gw.state).await;
}

// ── S3: the concurrency gate bounds provider dispatch ──────────────────────

#[tokio::test]
async fn s3_concurrency_gate_bounds_providers() {
    let (engine, mock) = spawn_mock_engine().await;
    let gw = start_gateway(
        engine,
        false,
        json!({
            "max_concurrency": 2,
            "providers": {"slow": {"base_url": format!("http://{engine}/slow")}},
        }),
        &[],
    )
    .await;

    let started = std::time::Instant::now();
    let mut handles = Vec::new();
    for _ in 0..5 {
        let router = gw.router.clone();
        handles.push(tokio::spawn(async move {
            post_json(&router, "/v1/chat/completions", chat_body("slow:m", "go"), None).await
        }));
    }
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK, "body: {body}");
        assert_eq!(body["choices"][0]["message"]["content"], "slow done");
    }

    // 5 requests through a gate of 2 at 300ms each: ≥3 serialized batches
    assert!(
        started.elapsed() >= std::time::Duration::from_millis(750),
        "finished suspiciously fast: {:?}",
        started.elapsed()
    );
    assert!(
        mock.slow_max_inflight.load(Ordering::SeqCst) <= 2,
        "gate leaked: {} concurrent upstream calls",
        mock.slow_max_inflight.load(Ordering::SeqCst)
    );
    waystation::shutdown(&gw.state).await;
}

// ── S4: offline fallback rewrites remote models ────────────────────────────

#[tokio::test]
async fn s4_offline_fallback() {
    let (engine, _mock) = spawn_mock_engine().await;
    // Unreachable probe target keeps the gateway offline for the whole test
    let gw = start_gateway(
        engine,
        false,
        json!({"WAYSTATION_OFFLINE_PROBE_URL": "http://127.0.0.1:9/probe"}),
        &[],
    )
    .await;
    gw.state
        .flags
        .internet_available
        .store(false, Ordering::Relaxed);

    let request_id = Uuid::new_v4();
    let (status, body) = post_json(
        &gw.router,
        "/v1/chat/completions",
        chat_body("openai:gpt-something", "hi"),
        Some(request_id),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    // Served by the local engine's plain (non-stream) path
    assert_eq!(body["choices"][0]["message"]["content"], "plain reply");

    let record = gw.state.tracker.find_request(request_id).unwrap();
    assert_eq!(record.metadata["offline_rewrite"], json!(true));
    waystation::shutdown(&gw.state).await;
}

// ── S5: stuck-request detection ────────────────────────────────────────────

#[tokio::test]
async fn s5_stuck_request_detection() {
    let (engine, _mock) = spawn_mock_engine().await;
    let gw = start_gateway(
        engine,
        false,
        json!({"providers": {"hang": {"base_url": format!("http://{engine}/hang")}}}),
        &[],
    )
    .await;

    let router = gw.router.clone();
    let hung = tokio::spawn(async move {
        post_json(&router, "/v1/chat/completions", chat_body("hang:m", "…"), None).await
    });
    tokio::time::sleep(std::time::Duration::from_millis(1300)).await;

    let (status, body) = get_json(
        &gw.router,
        "/admin/observability/stuck-requests?timeout_seconds=1&stage_timeout_seconds=1",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let stuck = body["stuck"].as_array().unwrap();
    assert_eq!(stuck.len(), 1, "stuck: {body}");
    assert_eq!(stuck[0]["current_stage"], "UPSTREAM_CALL_START");
    assert!(stuck[0]["age_seconds"].as_f64().unwrap() >= 1.0);

    let (status, _) = hung.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    waystation::shutdown(&gw.state).await;
}

// ── S6: config authority chain on reload ───────────────────────────────────

#[tokio::test]
async fn s6_config_authority() {
    let (engine, _mock) = spawn_mock_engine().await;
    let gw = start_gateway(engine, false, json!({}), &[]).await;

    // Write a key to the disk snapshot after boot, then reload
    let env_path = gw._dir.path().join(".env");
    std::fs::write(&env_path, "AGENT_MODEL=foo\n").unwrap();
    let (status, body) = post_json(&gw.router, "/admin/reload-config", json!({}), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    assert_eq!(gw.state.config.get("AGENT_MODEL").as_deref(), Some("foo"));
    // The database row carries the value with fresh mtime + hash
    let store = gw.state.store.read().as_ref().unwrap().clone();
    let row = store.get_config("AGENT_MODEL").unwrap().unwrap();
    assert_eq!(row.value, "foo");
    assert!(row.mtime_ms > 0);
    assert!(!row.content_hash.is_empty());

    // Reloading an unchanged config is a no-op
    let (_, body) = post_json(&gw.router, "/admin/reload-config", json!({}), None).await;
    assert_eq!(body["noop"], json!(true));
    waystation::shutdown(&gw.state).await;
}

// ── Mode behaviors ─────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_true_forces_synchronous_mode() {
    let (engine, _mock) = spawn_mock_engine().await;
    let gw = start_gateway(engine, false, json!({}), &[]).await;
    gw.state.flags.async_mode.store(true, Ordering::Relaxed);

    let body = json!({
        "model": "local:llama3.2",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": true,
    });
    let response = gw
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // A stream, not an async acceptance body
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert!(content_type.starts_with("text/event-stream"), "{content_type}");
    waystation::shutdown(&gw.state).await;
}

#[tokio::test]
async fn async_mode_accepts_nonstreaming_immediately() {
    let (engine, _mock) = spawn_mock_engine().await;
    let gw = start_gateway(engine, false, json!({}), &[]).await;
    gw.state.flags.async_mode.store(true, Ordering::Relaxed);

    let request_id = Uuid::new_v4();
    let (status, body) = post_json(
        &gw.router,
        "/v1/chat/completions",
        chat_body("local:llama3.2", "hi"),
        Some(request_id),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], "chat.completion.async");
    assert_eq!(body["status"], "accepted");

    // The deferred work lands in the tracker and is pollable
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    let record = gw.state.tracker.find_request(request_id).unwrap();
    assert_eq!(record.final_status.as_deref(), Some("completed"));
    waystation::shutdown(&gw.state).await;
}

#[tokio::test]
async fn unknown_prefix_rejected_before_any_upstream() {
    let (engine, mock) = spawn_mock_engine().await;
    let gw = start_gateway(engine, false, json!({}), &[]).await;
    let calls_before = mock.chat_calls.load(Ordering::SeqCst);

    let (status, body) = post_json(
        &gw.router,
        "/v1/chat/completions",
        chat_body("nope:model", "hi"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
    assert_eq!(mock.chat_calls.load(Ordering::SeqCst), calls_before);
    waystation::shutdown(&gw.state).await;
}

#[tokio::test]
async fn models_endpoint_aggregates_and_caches() {
    let (engine, _mock) = spawn_mock_engine().await;
    let gw = start_gateway(engine, false, json!({}), &[]).await;

    let (status, body) = get_json(&gw.router, "/v1/models").await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert!(ids.contains(&"llama3.2"));
    assert!(ids.contains(&"agent:default"));

    // Second read is served from the cache (identical payload)
    let (_, again) = get_json(&gw.router, "/v1/models").await;
    assert_eq!(body, again);
    waystation::shutdown(&gw.state).await;
}

#[tokio::test]
async fn health_reports_component_status() {
    let (engine, _mock) = spawn_mock_engine().await;
    let gw = start_gateway(engine, false, json!({}), &[]).await;

    let (status, body) = get_json(&gw.router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    // The mock engine is reachable, so the gateway is healthy
    assert_eq!(body["status"], "healthy", "body: {body}");
    assert!(body["components"].as_array().is_some());
    waystation::shutdown(&gw.state).await;
}

#[tokio::test]
async fn embeddings_proxy_passes_through() {
    let (engine, _mock) = spawn_mock_engine().await;
    let gw = start_gateway(engine, false, json!({}), &[]).await;

    let (status, body) = post_json(
        &gw.router,
        "/v1/embeddings",
        json!({"model": "llama3.2", "input": "hello"}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["data"][0]["embedding"][0], json!(0.1));
    waystation::shutdown(&gw.state).await;
}

#[tokio::test]
async fn auth_guards_chat_and_admin() {
    let (engine, _mock) = spawn_mock_engine().await;
    let gw = start_gateway(engine, false, json!({"auth_token": "sekrit"}), &[]).await;

    let (status, body) = post_json(
        &gw.router,
        "/v1/chat/completions",
        chat_body("local:llama3.2", "hi"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "auth");

    let (status, _) = get_json(&gw.router, "/admin/observability/metrics").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // With the bearer token, the same request is admitted
    let response = gw
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .header("authorization", "Bearer sekrit")
                .body(Body::from(chat_body("local:llama3.2", "hi").to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    waystation::shutdown(&gw.state).await;
}
