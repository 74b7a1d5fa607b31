// ── Waystation Server: Admin Surface ───────────────────────────────────────
// Operator endpoints: config/provider reloads, cache clears, MCP toggles,
// breaker resets, subsystem restarts, and the observability read side. All
// of them sit behind the configured token (when one is set).

use crate::atoms::constants::{STUCK_OVERALL_TIMEOUT_SECS, STUCK_STAGE_TIMEOUT_SECS};
use crate::atoms::error::GatewayError;
use crate::engine::observability::OperationMetric;
use crate::engine::state::GatewayState;
use crate::server::{check_auth, request_id_from, ApiError};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Shorthand: run the auth gate or return the error response.
macro_rules! require_auth {
    ($state:expr, $headers:expr) => {
        if let Err(e) = check_auth(&$state, &$headers) {
            return ApiError::new(e, request_id_from(&$headers)).into_response();
        }
    };
}

// ── Mutating endpoints ─────────────────────────────────────────────────────

pub async fn reload_config(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    require_auth!(state, headers);
    let report = state.config.sync_all();
    state.maitre.reload_triggers();

    // A reload of an unchanged config is observable only as this one event
    state.tracker.record_operation(
        None,
        OperationMetric {
            component: "config".into(),
            operation: "reload_ok".into(),
            duration_ms: 0,
            started_at: Utc::now(),
            ok: report.errors.is_empty(),
            metadata: json!({"parsed": report.files_parsed, "skipped": report.files_skipped}),
        },
    );

    if report.files_parsed > 0 {
        // Changed config fans out: providers and tool discovery refresh
        state.providers.load_from_config(&state.config);
        state.mcp.refresh_all_tools(true).await;
        state.model_cache.clear().await;
    }
    info!(
        "[admin] Config reload: {} parsed, {} unchanged, {} errors",
        report.files_parsed,
        report.files_skipped,
        report.errors.len()
    );
    Json(json!({
        "status": "ok",
        "files_parsed": report.files_parsed,
        "files_skipped": report.files_skipped,
        "errors": report.errors,
        "noop": report.is_noop(),
    }))
    .into_response()
}

pub async fn reload_providers(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    require_auth!(state, headers);
    state.providers.load_from_config(&state.config);
    state.model_cache.clear().await;
    Json(json!({"status": "ok", "providers": state.providers.names()})).into_response()
}

pub async fn clear_caches(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    require_auth!(state, headers);
    state.model_cache.clear().await;
    info!("[admin] Caches cleared");
    Json(json!({"status": "ok"})).into_response()
}

#[derive(Deserialize)]
pub struct ToggleBody {
    pub enabled: bool,
}

pub async fn toggle_mcp(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ToggleBody>,
) -> Response {
    require_auth!(state, headers);
    if state.mcp.set_enabled(&name, body.enabled) {
        Json(json!({"status": "ok", "server": name, "enabled": body.enabled})).into_response()
    } else {
        ApiError::new(
            GatewayError::NotFound(format!("unknown MCP server '{name}'")),
            request_id_from(&headers),
        )
        .into_response()
    }
}

pub async fn get_active_model(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    require_auth!(state, headers);
    let model = state.flags.active_model.lock().clone();
    Json(json!({"model": if model.is_empty() { Value::Null } else { json!(model) }})).into_response()
}

#[derive(Deserialize)]
pub struct ModelBody {
    pub model: String,
}

pub async fn set_active_model(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<ModelBody>,
) -> Response {
    require_auth!(state, headers);
    *state.flags.active_model.lock() = body.model.clone();
    let _ = state.config.set("active_model", &body.model);
    info!("[admin] Active model set to '{}'", body.model);
    Json(json!({"status": "ok", "model": body.model})).into_response()
}

#[derive(Deserialize)]
pub struct ModeBody {
    pub mode: String,
}

pub async fn set_dispatch_mode(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<ModeBody>,
) -> Response {
    require_auth!(state, headers);
    match body.mode.as_str() {
        "async" => {
            state
                .flags
                .async_mode
                .store(true, std::sync::atomic::Ordering::Relaxed);
        }
        "sync" => {
            state
                .flags
                .async_mode
                .store(false, std::sync::atomic::Ordering::Relaxed);
        }
        other => {
            return ApiError::new(
                GatewayError::Validation(format!("unknown dispatch mode '{other}'")),
                request_id_from(&headers),
            )
            .into_response();
        }
    }
    Json(json!({"status": "ok", "mode": body.mode})).into_response()
}

pub async fn restart_subsystem(
    State(state): State<Arc<GatewayState>>,
    Path(subsystem): Path<String>,
    headers: HeaderMap,
) -> Response {
    require_auth!(state, headers);
    match subsystem.as_str() {
        "mcp" => {
            // Transports close now; the next call respawns lazily
            state.mcp.shutdown_all().await;
            Json(json!({"status": "ok", "subsystem": "mcp"})).into_response()
        }
        "providers" => {
            state.providers.load_from_config(&state.config);
            state.model_cache.clear().await;
            Json(json!({"status": "ok", "subsystem": "providers"})).into_response()
        }
        other => ApiError::new(
            GatewayError::Validation(format!("unknown subsystem '{other}'")),
            request_id_from(&headers),
        )
        .into_response(),
    }
}

pub async fn reset_breaker(
    State(state): State<Arc<GatewayState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    require_auth!(state, headers);
    state.breakers.reset(&key);
    Json(json!({"status": "ok", "key": key})).into_response()
}

// ── Observability read side ────────────────────────────────────────────────

pub async fn observability_metrics(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    require_auth!(state, headers);
    let (input_tokens, output_tokens, spend_usd) = state.budget.spend();
    Json(json!({
        "active_requests": state.tracker.active_count(),
        "breakers": state.breakers.snapshot(),
        "mcp_servers": state.mcp.status_list().await,
        "budget": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
            "spend_usd": spend_usd,
        },
        "tempo": state.scheduler.tempo().as_str(),
    }))
    .into_response()
}

pub async fn observability_active(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    require_auth!(state, headers);
    Json(json!({"active": state.tracker.active_snapshot()})).into_response()
}

#[derive(Deserialize)]
pub struct StuckQuery {
    pub timeout_seconds: Option<u64>,
    pub stage_timeout_seconds: Option<u64>,
}

pub async fn observability_stuck(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<StuckQuery>,
    headers: HeaderMap,
) -> Response {
    require_auth!(state, headers);
    let stuck = state.tracker.stuck_requests(
        query.timeout_seconds.unwrap_or(STUCK_OVERALL_TIMEOUT_SECS),
        query
            .stage_timeout_seconds
            .or(query.timeout_seconds)
            .unwrap_or(STUCK_STAGE_TIMEOUT_SECS),
    );
    Json(json!({"stuck": stuck})).into_response()
}

pub async fn observability_performance(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    require_auth!(state, headers);
    Json(json!({"operations": state.tracker.operation_summaries()})).into_response()
}

pub async fn observability_component_health(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    require_auth!(state, headers);
    Json(json!({"components": state.tracker.component_health()})).into_response()
}

pub async fn observability_export(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    require_auth!(state, headers);
    let mut export = state.tracker.export();
    export["breakers"] = json!(state.breakers.snapshot());
    export["degraded_reasons"] = json!(state.degraded_reasons.lock().clone());
    Json(export).into_response()
}

pub async fn observability_request(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    require_auth!(state, headers);
    let Ok(request_id) = Uuid::parse_str(&id) else {
        return ApiError::new(
            GatewayError::Validation(format!("'{id}' is not a request id")),
            request_id_from(&headers),
        )
        .into_response();
    };
    match state.tracker.find_request(request_id) {
        Some(record) => Json(json!({"request": record})).into_response(),
        None => ApiError::new(
            GatewayError::NotFound(format!("no request '{id}'")),
            request_id,
        )
        .into_response(),
    }
}
