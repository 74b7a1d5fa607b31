// ── Waystation Server: Health ──────────────────────────────────────────────
// `healthy` requires a reachable local engine AND a live agent plane;
// missing remote providers never degrade the verdict. Always 200 — the
// status lives in the body so orchestrators can read it without retries.

use crate::engine::breaker::BreakerState;
use crate::engine::observability::HealthStatus;
use crate::engine::state::GatewayState;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn health(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let components = state.tracker.component_health();
    let native_id = format!("provider:{}", state.providers.native_name());

    let native_ok = components
        .iter()
        .find(|c| c.component_id == native_id)
        .map(|c| c.status == HealthStatus::Healthy)
        .unwrap_or(false);
    // The agent plane is reachable unless its driving provider is tripped
    let agent_ok = state
        .breakers
        .state(&native_id)
        .map(|s| s != BreakerState::Open)
        .unwrap_or(true);
    let degraded_reasons = state.degraded_reasons.lock().clone();

    let status = if native_ok && agent_ok && degraded_reasons.is_empty() {
        "healthy"
    } else if native_ok || agent_ok {
        "degraded"
    } else {
        "unhealthy"
    };

    Json(json!({
        "status": status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "degraded_reasons": degraded_reasons,
        "tempo": state.scheduler.tempo().as_str(),
        "internet_available": state
            .flags
            .internet_available
            .load(std::sync::atomic::Ordering::Relaxed),
        "components": components,
    }))
}
