// ── Waystation Server: HTTP Gateway ────────────────────────────────────────
// The axum surface: OpenAI-compatible chat + models + embeddings, health,
// and the admin/observability endpoints. Handlers stay thin — routing,
// stage bookkeeping, and response shaping; the engine does the work.

pub mod admin;
pub mod chat;
pub mod health;
pub mod models;

use crate::atoms::error::GatewayError;
use crate::engine::state::GatewayState;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Build the gateway router. Ingress opens when this is served (boot phase 8).
pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(models::list_models))
        .route("/v1/embeddings", post(chat::embeddings_proxy))
        .route("/health", get(health::health))
        .route("/dashboard", get(dashboard))
        .route("/admin/reload-config", post(admin::reload_config))
        .route("/admin/reload-providers", post(admin::reload_providers))
        .route("/admin/clear-caches", post(admin::clear_caches))
        .route("/admin/mcp/:name/toggle", post(admin::toggle_mcp))
        .route(
            "/admin/active-model",
            get(admin::get_active_model).post(admin::set_active_model),
        )
        .route("/admin/dispatch-mode", post(admin::set_dispatch_mode))
        .route("/admin/restart/:subsystem", post(admin::restart_subsystem))
        .route("/admin/breakers/:key/reset", post(admin::reset_breaker))
        .route("/admin/observability/metrics", get(admin::observability_metrics))
        .route(
            "/admin/observability/active-requests",
            get(admin::observability_active),
        )
        .route(
            "/admin/observability/stuck-requests",
            get(admin::observability_stuck),
        )
        .route(
            "/admin/observability/performance",
            get(admin::observability_performance),
        )
        .route(
            "/admin/observability/component-health",
            get(admin::observability_component_health),
        )
        .route("/admin/observability/export", get(admin::observability_export))
        .route(
            "/admin/observability/request/:id",
            get(admin::observability_request),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Static placeholder — the real dashboard ships separately.
async fn dashboard() -> Html<&'static str> {
    Html("<!doctype html><title>waystation</title><p>Waystation gateway is running. The dashboard UI is served by its own process.</p>")
}

// ── Error envelope ─────────────────────────────────────────────────────────

/// Wire error: `{error: {kind, message, request_id, provider?}}` with the
/// taxonomy's HTTP status.
pub struct ApiError {
    pub error: GatewayError,
    pub request_id: Uuid,
}

impl ApiError {
    pub fn new(error: GatewayError, request_id: Uuid) -> Self {
        ApiError { error, request_id }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "error": {
                "kind": self.error.kind(),
                "message": self.error.to_string(),
                "request_id": self.request_id,
            }
        });
        if let Some(provider) = self.error.provider() {
            body["error"]["provider"] = json!(provider);
        }
        log::warn!(
            "[server] {} {} — {}",
            status.as_u16(),
            self.error.kind(),
            self.error
        );
        (status, Json(body)).into_response()
    }
}

// ── Auth ───────────────────────────────────────────────────────────────────

/// Bearer check: when a token is configured, every guarded route requires
/// it; with no token configured the gateway is open.
pub fn check_auth(state: &GatewayState, headers: &HeaderMap) -> Result<(), GatewayError> {
    let Some(expected) = state.auth_token() else {
        return Ok(());
    };
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(GatewayError::Auth("invalid token".into())),
        None => Err(GatewayError::Auth("missing bearer token".into())),
    }
}

/// Extract the request id from `X-Request-ID` (or mint one).
pub fn request_id_from(headers: &HeaderMap) -> Uuid {
    crate::atoms::ids::request_id_from_header(
        headers.get("x-request-id").and_then(|v| v.to_str().ok()),
    )
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(t) = token {
            headers.insert(
                "authorization",
                HeaderValue::from_str(&format!("Bearer {t}")).unwrap(),
            );
        }
        headers
    }

    async fn state() -> (tempfile::TempDir, Arc<GatewayState>) {
        let dir = tempfile::tempdir().unwrap();
        let options = crate::engine::boot::BootOptions {
            config_dir: dir.path().join("config"),
            db_path: dir.path().join("gateway.db"),
            pre_warm_mcp: false,
        };
        let state = crate::engine::boot::boot(options).await.unwrap();
        (dir, state)
    }

    #[tokio::test]
    async fn auth_open_without_token() {
        let (_dir, state) = state().await;
        assert!(check_auth(&state, &headers_with(None)).is_ok());
    }

    #[tokio::test]
    async fn auth_enforced_with_token() {
        let (_dir, state) = state().await;
        state.config.set("auth_token", "secret").unwrap();
        assert!(check_auth(&state, &headers_with(None)).is_err());
        assert!(check_auth(&state, &headers_with(Some("wrong"))).is_err());
        assert!(check_auth(&state, &headers_with(Some("secret"))).is_ok());
    }

    #[tokio::test]
    async fn api_error_body_shape() {
        let err = ApiError::new(
            GatewayError::Validation("bad model".into()),
            Uuid::nil(),
        );
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["kind"], "validation");
        assert!(body["error"]["message"].as_str().unwrap().contains("bad model"));
    }
}
