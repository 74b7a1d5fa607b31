// ── Waystation Server: Chat Dispatch ───────────────────────────────────────
//
// The request pipeline for POST /v1/chat/completions:
//   request id → auth → parse → model prefix route → budget pre-check →
//   global concurrency gate → dispatch (agent | native | rag | provider).
// The gate wraps EVERY dispatch branch, provider proxies included. Streaming
// requests force synchronous mode; non-streaming requests in async mode are
// accepted immediately and tracked for polling.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{
    async_accepted_body, completion_body, stream_chunk_body, ChatRequest, QualityTier,
};
use crate::engine::agent_loop::{run_agent_turn, AgentEvent, AgentRequest};
use crate::engine::http::shared_client;
use crate::engine::observability::RequestStage;
use crate::engine::providers::{assemble_chunks, ProviderParams};
use crate::engine::state::GatewayState;
use crate::server::{check_auth, request_id_from, ApiError};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::{info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

// ── Routing ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Agent(String),
    Rag(String),
    Provider { provider: String, model: String },
}

/// Parse `<prefix>:<rest>` after alias resolution and offline rewriting.
/// Unknown prefixes are a 400 before any upstream is contacted;
/// recognized-but-unconfigured providers are a 404. Returns the route plus
/// whether an offline rewrite happened.
fn parse_route(state: &GatewayState, model_id: &str) -> GatewayResult<(Route, bool)> {
    let resolved = state
        .config
        .get(&format!("alias.{model_id}"))
        .unwrap_or_else(|| model_id.to_string());

    let (prefix, rest) = resolved
        .split_once(':')
        .ok_or_else(|| GatewayError::Validation(format!("model '{resolved}' must be <prefix>:<model>")))?;
    if rest.trim().is_empty() {
        return Err(GatewayError::Validation(format!(
            "model '{resolved}' has an empty model part"
        )));
    }

    // Offline: remote provider prefixes transparently rewrite to the local
    // fallback (the agent plane applies the same rule internally)
    let native = state.providers.native_name();
    let offline = !state
        .flags
        .internet_available
        .load(std::sync::atomic::Ordering::Relaxed);
    let remote_prefix = prefix != native
        && (state.providers.get(prefix).is_some()
            || matches!(prefix, "openai" | "anthropic" | "perplexity"));
    if offline && remote_prefix {
        let fallback = state
            .config
            .get("WAYSTATION_FALLBACK_MODEL")
            .or_else(|| state.config.get("fallback_model"))
            .unwrap_or_else(|| "llama3.2".to_string());
        info!("[server] Offline — rewriting {resolved} to {native}:{fallback}");
        return Ok((
            Route::Provider {
                provider: native,
                model: fallback,
            },
            true,
        ));
    }

    let route = match prefix {
        "agent" => Route::Agent(rest.to_string()),
        "rag" => Route::Rag(rest.to_string()),
        _ if state.providers.get(prefix).is_some() => Route::Provider {
            provider: prefix.to_string(),
            model: rest.to_string(),
        },
        // Recognized provider names that simply aren't configured
        "openai" | "anthropic" | "perplexity" => {
            return Err(GatewayError::NotFound(format!(
                "provider '{prefix}' is not configured"
            )))
        }
        _ => {
            return Err(GatewayError::Validation(format!(
                "unknown model prefix '{prefix}'"
            )))
        }
    };
    Ok((route, false))
}

// ── Handler ────────────────────────────────────────────────────────────────

pub async fn chat_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id_from(&headers);
    state.scheduler.note_user_activity();
    let client_id = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();
    state
        .tracker
        .begin_request(request_id, "POST", "/v1/chat/completions", &client_id);

    // ── Auth ───────────────────────────────────────────────────────────────
    if let Err(e) = check_auth(&state, &headers) {
        state.tracker.fail(request_id, e.kind(), &e.to_string());
        return ApiError::new(e, request_id).into_response();
    }
    state.tracker.advance(request_id, RequestStage::AuthChecked);

    // ── Parse ──────────────────────────────────────────────────────────────
    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            let err = GatewayError::Validation(format!("body: {e}"));
            state.tracker.fail(request_id, err.kind(), &err.to_string());
            return ApiError::new(err, request_id).into_response();
        }
    };
    let model_id = match request.validate() {
        Ok(m) => m.to_string(),
        Err(message) => {
            let err = GatewayError::Validation(message);
            state.tracker.fail(request_id, err.kind(), &err.to_string());
            return ApiError::new(err, request_id).into_response();
        }
    };
    state.tracker.advance(request_id, RequestStage::Parsed);
    let quality = QualityTier::from_header(
        headers.get("x-quality-tier").and_then(|v| v.to_str().ok()),
    );

    // ── Route ──────────────────────────────────────────────────────────────
    let (route, offline_rewrite) = match parse_route(&state, &model_id) {
        Ok(r) => r,
        Err(e) => {
            state.tracker.fail(request_id, e.kind(), &e.to_string());
            return ApiError::new(e, request_id).into_response();
        }
    };
    if offline_rewrite {
        state
            .tracker
            .annotate(request_id, "offline_rewrite", json!(true));
    }
    state.tracker.advance(request_id, RequestStage::RoutingDecided);
    state
        .tracker
        .annotate(request_id, "route", json!(format!("{route:?}")));

    // ── Budget pre-check ───────────────────────────────────────────────────
    if let Err(e) = state.check_budget(&model_id, request.max_tokens) {
        state.tracker.fail(request_id, e.kind(), &e.to_string());
        return ApiError::new(e, request_id).into_response();
    }

    // ── Global concurrency gate — wraps every dispatch branch ──────────────
    let permit = match &state.global_gate {
        Some(gate) => match Arc::clone(gate).acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => {
                let err = GatewayError::Internal("concurrency gate closed".into());
                state.tracker.fail(request_id, err.kind(), &err.to_string());
                return ApiError::new(err, request_id).into_response();
            }
        },
        None => None,
    };

    // ── Async acceptance (stream=true always forces synchronous) ───────────
    let async_mode =
        state.flags.async_mode.load(std::sync::atomic::Ordering::Relaxed) && !request.stream;
    if async_mode {
        info!("[server] Async acceptance for {}", request_id);
        let state_task = Arc::clone(&state);
        let raw = body.clone();
        tokio::spawn(async move {
            let _permit = permit; // the gate covers the deferred work too
            let (_cancel_tx, cancel_rx) = watch::channel(false);
            match dispatch_sync(&state_task, request_id, request, route, quality, raw, cancel_rx)
                .await
            {
                Ok(_) => {}
                Err(e) => state_task.tracker.fail(request_id, e.kind(), &e.to_string()),
            }
        });
        return Json(async_accepted_body(&request_id.to_string())).into_response();
    }

    if request.stream {
        return dispatch_stream(state, request_id, request, route, quality, permit).await;
    }

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let result = dispatch_sync(&state, request_id, request, route, quality, body, cancel_rx).await;
    let _permit = permit; // held until the branch finished
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => {
            state.tracker.fail(request_id, e.kind(), &e.to_string());
            ApiError::new(e, request_id).into_response()
        }
    }
}

// ── Synchronous dispatch ───────────────────────────────────────────────────

async fn dispatch_sync(
    state: &Arc<GatewayState>,
    request_id: Uuid,
    request: ChatRequest,
    route: Route,
    quality: QualityTier,
    raw_body: Bytes,
    cancel: watch::Receiver<bool>,
) -> GatewayResult<Value> {
    let params = params_from(&request);
    state.tracker.advance(request_id, RequestStage::UpstreamCallStart);

    let (model_label, text, usage, degraded) = match route {
        Route::Agent(rest) => {
            let outcome = run_agent_turn(
                &state.agent_deps(),
                AgentRequest {
                    model_rest: rest.clone(),
                    messages: request.messages,
                    quality,
                    params,
                    request_id,
                    internet_available: state
                        .flags
                        .internet_available
                        .load(std::sync::atomic::Ordering::Relaxed),
                },
                None,
                cancel,
            )
            .await?;
            (format!("agent:{rest}"), outcome.text, outcome.usage, outcome.degraded)
        }
        Route::Provider { provider, model } => {
            let outcome = state
                .providers
                .chat(
                    &provider,
                    &model,
                    &request.messages,
                    request.tools.as_deref().unwrap_or(&[]),
                    params,
                    Some(request_id),
                )
                .await?;
            (
                format!("{provider}:{model}"),
                outcome.text,
                outcome.usage,
                None,
            )
        }
        Route::Rag(rest) => {
            let value = forward_to_rag(state, &raw_body).await?;
            state.tracker.advance(request_id, RequestStage::UpstreamCallEnd);
            state.tracker.advance(request_id, RequestStage::ResponseSent);
            state.tracker.advance(request_id, RequestStage::Completed);
            let _ = rest;
            return Ok(value);
        }
    };

    state.tracker.advance(request_id, RequestStage::UpstreamCallEnd);
    state.tracker.advance(request_id, RequestStage::Processing);
    state.record_usage(&model_label, usage.input_tokens, usage.output_tokens);
    if let Some(reason) = &degraded {
        state.tracker.annotate(request_id, "degraded", json!(reason));
    }

    let body = completion_body(&request_id.to_string(), &model_label, &text, usage);
    state.tracker.advance(request_id, RequestStage::ResponseSent);
    state.tracker.advance(request_id, RequestStage::Completed);
    Ok(body)
}

fn params_from(request: &ChatRequest) -> ProviderParams {
    ProviderParams {
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        top_p: request.top_p,
    }
}

/// Transparent forward to the external RAG service.
async fn forward_to_rag(state: &Arc<GatewayState>, raw_body: &Bytes) -> GatewayResult<Value> {
    let base = state
        .config
        .get("rag_base_url")
        .ok_or_else(|| GatewayError::Degraded("RAG service is not configured".into()))?;
    let url = format!("{}/v1/chat/completions", base.trim_end_matches('/'));
    let response = shared_client()
        .post(&url)
        .header("Content-Type", "application/json")
        .body(raw_body.clone())
        .send()
        .await
        .map_err(|e| GatewayError::UpstreamUnavailable {
            provider: "rag".into(),
            message: e.to_string(),
        })?;
    if !response.status().is_success() {
        return Err(GatewayError::UpstreamUnavailable {
            provider: "rag".into(),
            message: format!("status {}", response.status().as_u16()),
        });
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| GatewayError::UpstreamProtocol {
            provider: "rag".into(),
            message: e.to_string(),
        })
}

// ── Streaming dispatch ─────────────────────────────────────────────────────

/// Sends `true` exactly once when dropped — wired into the relay stream so a
/// client disconnect cancels the upstream work promptly.
struct CancelOnDrop(watch::Sender<bool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let _ = self.0.send(true);
    }
}

async fn dispatch_stream(
    state: Arc<GatewayState>,
    request_id: Uuid,
    request: ChatRequest,
    route: Route,
    quality: QualityTier,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
) -> Response {
    let (event_tx, event_rx) = mpsc::channel::<Event>(64);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let guard = CancelOnDrop(cancel_tx);

    let params = params_from(&request);
    let state_task = Arc::clone(&state);
    tokio::spawn(async move {
        let _permit = permit;
        state_task
            .tracker
            .advance(request_id, RequestStage::UpstreamCallStart);
        let result = match route {
            Route::Agent(rest) => {
                relay_agent_stream(&state_task, request_id, rest, request, quality, params, &event_tx, cancel_rx)
                    .await
            }
            Route::Provider { provider, model } => {
                relay_provider_stream(
                    &state_task,
                    request_id,
                    provider,
                    model,
                    request,
                    params,
                    &event_tx,
                    cancel_rx,
                )
                .await
            }
            Route::Rag(_) => Err(GatewayError::Validation(
                "rag models do not support streaming".into(),
            )),
        };
        match result {
            Ok(()) => {
                state_task.tracker.advance(request_id, RequestStage::ResponseSent);
                state_task.tracker.advance(request_id, RequestStage::Completed);
            }
            Err(e) => {
                warn!("[server] Stream dispatch failed: {e}");
                let body = json!({"error": {"kind": e.kind(), "message": e.to_string(), "request_id": request_id}});
                let _ = event_tx.send(Event::default().data(body.to_string())).await;
                state_task.tracker.fail(request_id, e.kind(), &e.to_string());
            }
        }
        let _ = event_tx.send(Event::default().data("[DONE]")).await;
    });

    let stream = ReceiverStream::new(event_rx).map(move |event| {
        let _ = &guard; // dropping the stream fires the cancel signal
        Ok::<Event, std::convert::Infallible>(event)
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[allow(clippy::too_many_arguments)]
async fn relay_agent_stream(
    state: &Arc<GatewayState>,
    request_id: Uuid,
    model_rest: String,
    request: ChatRequest,
    quality: QualityTier,
    params: ProviderParams,
    event_tx: &mpsc::Sender<Event>,
    cancel: watch::Receiver<bool>,
) -> GatewayResult<()> {
    let model_label = format!("agent:{model_rest}");
    let (agent_tx, mut agent_rx) = mpsc::channel::<AgentEvent>(256);

    let deps = state.agent_deps();
    let internet = state
        .flags
        .internet_available
        .load(std::sync::atomic::Ordering::Relaxed);
    let agent = tokio::spawn(async move {
        run_agent_turn(
            &deps,
            AgentRequest {
                model_rest,
                messages: request.messages,
                quality,
                params,
                request_id,
                internet_available: internet,
            },
            Some(agent_tx),
            cancel,
        )
        .await
    });

    let mut streamed_any = false;
    while let Some(event) = agent_rx.recv().await {
        match event {
            AgentEvent::Delta(delta) => {
                streamed_any = true;
                let body = stream_chunk_body(&request_id.to_string(), &model_label, &delta, None);
                if event_tx.send(Event::default().data(body.to_string())).await.is_err() {
                    break;
                }
            }
            // Tool rounds stream as keep-alive comments so the HTTP
            // connection does not idle out
            AgentEvent::Heartbeat => {
                let _ = event_tx.send(Event::default().comment("tool round")).await;
            }
            AgentEvent::ToolStarted { name, .. } => {
                let _ = event_tx
                    .send(Event::default().comment(format!("tool {name} started")))
                    .await;
            }
            AgentEvent::ToolResult { name, success, .. } => {
                let _ = event_tx
                    .send(Event::default().comment(format!("tool {name} done ok={success}")))
                    .await;
            }
        }
    }

    let outcome = agent
        .await
        .map_err(|e| GatewayError::Internal(format!("agent task panicked: {e}")))??;
    state.tracker.advance(request_id, RequestStage::UpstreamCallEnd);
    state.record_usage(&model_label, outcome.usage.input_tokens, outcome.usage.output_tokens);
    if let Some(reason) = &outcome.degraded {
        state.tracker.annotate(request_id, "degraded", json!(reason));
    }

    if !streamed_any && !outcome.text.is_empty() {
        let body = stream_chunk_body(&request_id.to_string(), &model_label, &outcome.text, None);
        let _ = event_tx.send(Event::default().data(body.to_string())).await;
    }
    let finish = stream_chunk_body(&request_id.to_string(), &model_label, "", Some("stop"));
    let _ = event_tx.send(Event::default().data(finish.to_string())).await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn relay_provider_stream(
    state: &Arc<GatewayState>,
    request_id: Uuid,
    provider: String,
    model: String,
    request: ChatRequest,
    params: ProviderParams,
    event_tx: &mpsc::Sender<Event>,
    mut cancel: watch::Receiver<bool>,
) -> GatewayResult<()> {
    let model_label = format!("{provider}:{model}");
    let mut rx = state
        .providers
        .chat_stream(
            &provider,
            &model,
            &request.messages,
            request.tools.as_deref().unwrap_or(&[]),
            params,
            Some(request_id),
        )
        .await?;

    let mut chunks = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.changed() => {
                return Err(GatewayError::Cancelled("client disconnected".into()));
            }
            item = rx.recv() => match item {
                Some(Ok(chunk)) => {
                    if let Some(delta) = &chunk.delta_text {
                        let body = stream_chunk_body(&request_id.to_string(), &model_label, delta, None);
                        if event_tx.send(Event::default().data(body.to_string())).await.is_err() {
                            return Err(GatewayError::Cancelled("client disconnected".into()));
                        }
                    }
                    chunks.push(chunk);
                }
                Some(Err(e)) => return Err(e.into_gateway(&provider)),
                None => break,
            }
        }
    }

    state.tracker.advance(request_id, RequestStage::UpstreamCallEnd);
    let outcome = assemble_chunks(chunks);
    state.record_usage(&model_label, outcome.usage.input_tokens, outcome.usage.output_tokens);
    let finish = stream_chunk_body(&request_id.to_string(), &model_label, "", Some("stop"));
    let _ = event_tx.send(Event::default().data(finish.to_string())).await;
    Ok(())
}

// ── Embeddings proxy ───────────────────────────────────────────────────────

/// Transparent pass-through to the native local engine's embeddings surface.
pub async fn embeddings_proxy(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id_from(&headers);
    state.scheduler.note_user_activity();
    state
        .tracker
        .begin_request(request_id, "POST", "/v1/embeddings", "anonymous");
    if let Err(e) = check_auth(&state, &headers) {
        state.tracker.fail(request_id, e.kind(), &e.to_string());
        return ApiError::new(e, request_id).into_response();
    }
    state.tracker.advance(request_id, RequestStage::AuthChecked);
    state.tracker.advance(request_id, RequestStage::RoutingDecided);

    let Some(native) = state.providers.native() else {
        let err = GatewayError::Degraded("native engine is not configured".into());
        state.tracker.fail(request_id, err.kind(), &err.to_string());
        return ApiError::new(err, request_id).into_response();
    };
    let url = format!("{}/v1/embeddings", native.inner().base_url().trim_end_matches('/'));

    state.tracker.advance(request_id, RequestStage::UpstreamCallStart);
    let result = shared_client()
        .post(&url)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await;
    state.tracker.advance(request_id, RequestStage::UpstreamCallEnd);

    match result {
        Ok(response) if response.status().is_success() => {
            let value: Value = response.json().await.unwrap_or(json!({}));
            state.tracker.advance(request_id, RequestStage::ResponseSent);
            state.tracker.advance(request_id, RequestStage::Completed);
            Json(value).into_response()
        }
        Ok(response) => {
            let err = GatewayError::UpstreamUnavailable {
                provider: state.providers.native_name(),
                message: format!("embeddings status {}", response.status().as_u16()),
            };
            state.tracker.fail(request_id, err.kind(), &err.to_string());
            ApiError::new(err, request_id).into_response()
        }
        Err(e) => {
            let err = GatewayError::UpstreamUnavailable {
                provider: state.providers.native_name(),
                message: e.to_string(),
            };
            state.tracker.fail(request_id, err.kind(), &err.to_string());
            ApiError::new(err, request_id).into_response()
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::boot::{boot, BootOptions};

    async fn state() -> (tempfile::TempDir, Arc<GatewayState>) {
        let dir = tempfile::tempdir().unwrap();
        let options = BootOptions {
            config_dir: dir.path().join("config"),
            db_path: dir.path().join("gateway.db"),
            pre_warm_mcp: false,
        };
        (dir, boot(options).await.unwrap())
    }

    #[tokio::test]
    async fn route_parsing_covers_prefixes() {
        let (_dir, state) = state().await;
        assert_eq!(
            parse_route(&state, "agent:default").unwrap().0,
            Route::Agent("default".into())
        );
        assert_eq!(
            parse_route(&state, "rag:corpus").unwrap().0,
            Route::Rag("corpus".into())
        );
        assert_eq!(
            parse_route(&state, "local:llama3.2").unwrap().0,
            Route::Provider {
                provider: "local".into(),
                model: "llama3.2".into()
            }
        );
    }

    #[tokio::test]
    async fn offline_rewrites_remote_prefixes() {
        let (_dir, state) = state().await;
        state
            .flags
            .internet_available
            .store(false, std::sync::atomic::Ordering::Relaxed);
        state.config.set("fallback_model", "llama3.2").unwrap();
        // Even an unconfigured remote provider rewrites instead of 404ing
        let (route, rewritten) = parse_route(&state, "openai:gpt-something").unwrap();
        assert!(rewritten);
        assert_eq!(
            route,
            Route::Provider {
                provider: "local".into(),
                model: "llama3.2".into()
            }
        );
        // The native provider is never rewritten
        let (_, rewritten) = parse_route(&state, "local:llama3.2").unwrap();
        assert!(!rewritten);
    }

    #[tokio::test]
    async fn unknown_prefix_is_validation_error() {
        let (_dir, state) = state().await;
        let err = parse_route(&state, "nope:model").unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn recognized_unconfigured_provider_is_not_found() {
        let (_dir, state) = state().await;
        let err = parse_route(&state, "openai:gpt-4o").unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn empty_rest_is_rejected() {
        let (_dir, state) = state().await;
        assert!(parse_route(&state, "agent:").is_err());
        assert!(parse_route(&state, "bare-model").is_err());
    }

    #[tokio::test]
    async fn aliases_resolve_before_dispatch() {
        let (_dir, state) = state().await;
        state.config.set("alias.default", "agent:default").unwrap();
        assert_eq!(
            parse_route(&state, "default").unwrap().0,
            Route::Agent("default".into())
        );
    }
}
