// ── Waystation Server: Model Listing ───────────────────────────────────────
// GET /v1/models aggregates every provider's catalogue. The cache is
// double-checked: a cheap read first, then the global gate + a re-check
// before the parallel fan-out recomputes. Per-provider failures are
// swallowed and recorded; the aggregate publishes once.

use crate::atoms::types::ModelInfo;
use crate::engine::state::GatewayState;
use crate::server::{check_auth, request_id_from, ApiError};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::warn;
use serde_json::json;
use std::sync::Arc;

pub async fn list_models(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    let request_id = request_id_from(&headers);
    state.scheduler.note_user_activity();
    if let Err(e) = check_auth(&state, &headers) {
        return ApiError::new(e, request_id).into_response();
    }

    // First check: no gate, no recompute
    if let Some(models) = state.model_cache.get().await {
        return listing_body(models).into_response();
    }

    // Miss: take the global gate, then re-check before recomputing
    let _permit = match &state.global_gate {
        Some(gate) => Arc::clone(gate).acquire_owned().await.ok(),
        None => None,
    };
    if let Some(models) = state.model_cache.get().await {
        return listing_body(models).into_response();
    }

    let models = aggregate_models(&state).await;
    state.model_cache.put(models.clone()).await;
    listing_body(models).into_response()
}

/// Parallel fan-out to every provider; failures degrade to an empty slice.
pub async fn aggregate_models(state: &Arc<GatewayState>) -> Vec<ModelInfo> {
    let names = state.providers.names();
    let futures = names.iter().map(|name| {
        let state = Arc::clone(state);
        let name = name.clone();
        async move {
            match state.providers.list_models(&name).await {
                Ok(models) => models,
                Err(e) => {
                    warn!("[server] list_models for '{}' failed: {}", name, e);
                    state
                        .tracker
                        .record_error(&format!("provider:{name}"), &format!("list_models: {e}"), None);
                    Vec::new()
                }
            }
        }
    });
    let mut models: Vec<ModelInfo> = futures::future::join_all(futures)
        .await
        .into_iter()
        .flatten()
        .collect();

    // The agent plane is itself a model
    models.push(ModelInfo {
        id: "agent:default".into(),
        object: "model".into(),
        created: 0,
        owned_by: "waystation".into(),
    });
    models.sort_by(|a, b| a.id.cmp(&b.id));
    models.dedup_by(|a, b| a.id == b.id);
    models
}

fn listing_body(models: Vec<ModelInfo>) -> Json<serde_json::Value> {
    Json(json!({"object": "list", "data": models}))
}
