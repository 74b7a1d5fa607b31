// ── Waystation Atoms: Error Types ──────────────────────────────────────────
// Single canonical error enum for the gateway, built with `thiserror`.
//
// Design rules:
//   • Variants follow the wire taxonomy: every variant maps to exactly one
//     `kind` string and one HTTP status (see `kind()` / `http_status()`).
//   • The `#[from]` attribute wires std/external error conversions.
//   • No variant carries secret material (API keys, tokens) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Client sent an invalid request.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing or bad auth token.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Unknown model, provider, or tool.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Provider-side rate limit.
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// A circuit breaker is open for this target; upstream was not contacted.
    #[error("Circuit open for '{key}', retry in {retry_in_secs}s")]
    CircuitOpen { key: String, retry_in_secs: u64 },

    /// Upstream unreachable or returned 5xx.
    #[error("Upstream unavailable: {provider}: {message}")]
    UpstreamUnavailable { provider: String, message: String },

    /// Upstream answered with something we could not interpret.
    #[error("Upstream protocol error: {provider}: {message}")]
    UpstreamProtocol { provider: String, message: String },

    /// A deadline expired.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The client went away or cancellation was requested.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Step cap, size cap, or budget cap exceeded.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Operation skipped because of a known subsystem outage.
    #[error("Degraded: {0}")]
    Degraded(String),

    /// Gateway configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tool execution failure.
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// MCP server failure.
    #[error("MCP error: {server}: {message}")]
    Mcp { server: String, message: String },

    /// A bug. Prefer adding a specific variant over using this in new code.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Wire taxonomy mapping ──────────────────────────────────────────────────

impl GatewayError {
    /// Stable `kind` string used in error response bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::Config(_) => "validation",
            Self::Auth(_) => "auth",
            Self::NotFound(_) => "not_found",
            Self::RateLimited { .. } | Self::CircuitOpen { .. } => "rate_limited",
            Self::UpstreamUnavailable { .. } | Self::Network(_) => "upstream_unavailable",
            Self::UpstreamProtocol { .. } => "upstream_protocol",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::Degraded(_) => "degraded",
            Self::Tool { .. } | Self::Mcp { .. } => "upstream_unavailable",
            Self::Io(_) | Self::Serialization(_) | Self::Database(_) | Self::Internal(_) => {
                "internal"
            }
        }
    }

    /// HTTP status the gateway maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Config(_) => 400,
            Self::Auth(_) => 401,
            Self::NotFound(_) => 404,
            Self::Cancelled(_) => 408,
            Self::RateLimited { .. } | Self::CircuitOpen { .. } | Self::ResourceExhausted(_) => 429,
            Self::UpstreamUnavailable { .. }
            | Self::UpstreamProtocol { .. }
            | Self::Network(_)
            | Self::Degraded(_)
            | Self::Tool { .. }
            | Self::Mcp { .. } => 503,
            Self::Timeout(_) => 504,
            Self::Io(_) | Self::Serialization(_) | Self::Database(_) | Self::Internal(_) => 500,
        }
    }

    /// The provider name attached to this error, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::UpstreamUnavailable { provider, .. }
            | Self::UpstreamProtocol { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// True for failures worth retrying inside the same call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::UpstreamUnavailable { .. }
        )
    }

    /// Create a tool error with name and message.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create an MCP error with server name and message.
    pub fn mcp(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Mcp {
            server: server.into(),
            message: message.into(),
        }
    }
}

// ── Migration bridge: String → GatewayError ────────────────────────────────
// Allows `?` on functions still returning `Result<T, String>` (transport
// layer) inside functions that return `GatewayResult<T>`.

impl From<String> for GatewayError {
    fn from(s: String) -> Self {
        GatewayError::Internal(s)
    }
}

impl From<&str> for GatewayError {
    fn from(s: &str) -> Self {
        GatewayError::Internal(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All gateway operations should return this type.
pub type GatewayResult<T> = Result<T, GatewayError>;

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_statuses() {
        let cases: Vec<(GatewayError, &str, u16)> = vec![
            (GatewayError::Validation("x".into()), "validation", 400),
            (GatewayError::Auth("x".into()), "auth", 401),
            (GatewayError::NotFound("x".into()), "not_found", 404),
            (GatewayError::Cancelled("x".into()), "cancelled", 408),
            (
                GatewayError::RateLimited {
                    message: "x".into(),
                    retry_after_secs: None,
                },
                "rate_limited",
                429,
            ),
            (
                GatewayError::CircuitOpen {
                    key: "mcp:fs".into(),
                    retry_in_secs: 10,
                },
                "rate_limited",
                429,
            ),
            (GatewayError::Timeout("x".into()), "timeout", 504),
            (GatewayError::Degraded("x".into()), "degraded", 503),
            (GatewayError::Internal("x".into()), "internal", 500),
        ];
        for (err, kind, status) in cases {
            assert_eq!(err.kind(), kind);
            assert_eq!(err.http_status(), status);
        }
    }

    #[test]
    fn provider_tagging() {
        let err = GatewayError::UpstreamUnavailable {
            provider: "openai".into(),
            message: "502".into(),
        };
        assert_eq!(err.provider(), Some("openai"));
        assert!(err.is_transient());
        assert!(GatewayError::Auth("no".into()).provider().is_none());
    }
}
