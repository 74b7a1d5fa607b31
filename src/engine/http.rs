// ── Waystation Engine: Outbound HTTP Pool & Retry Helpers ──────────────────
//
// One shared `reqwest::Client` for every outbound call the gateway makes —
// providers, HTTP/SSE MCP servers, health probes. Features:
//   • Keep-alive pooling with per-host idle limits and 30s idle expiry
//   • HTTP/2 attempted, graceful fallback to 1.1
//   • Exponential backoff with ±25% jitter (base 250ms, cap 4s)
//   • Retry on 429 (rate limit), 500, 502, 503, 504, 529
//   • Respects `Retry-After` header
//
// The pool itself never retries: retry semantics differ between idempotent
// GETs and tool calls, so callers own their retry loops with these helpers.

use crate::atoms::constants::{
    HTTP_CONNECT_TIMEOUT_SECS, HTTP_IDLE_EXPIRY_SECS, HTTP_MAX_IDLE_PER_HOST, HTTP_TIMEOUT_SECS,
    RETRY_BASE_MS, RETRY_CAP_MS,
};
use rand::Rng;
use reqwest::Client;
use std::sync::LazyLock;
use std::time::Duration;

// ── Shared client ──────────────────────────────────────────────────────────

/// The singleton outbound client. Shared across all components — one
/// connection pool, one TLS config.
static SHARED_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .pool_max_idle_per_host(HTTP_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Duration::from_secs(HTTP_IDLE_EXPIRY_SECS))
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .expect("Failed to build shared reqwest::Client")
});

/// Get the shared outbound HTTP client. Components should call this instead
/// of `Client::builder().build()`. Per-call timeouts override the pool
/// default via `RequestBuilder::timeout`.
pub fn shared_client() -> Client {
    SHARED_CLIENT.clone()
}

// ── Retryable status detection ─────────────────────────────────────────────

/// Check if an HTTP status code represents a transient/retryable error.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

// ── Backoff delay ──────────────────────────────────────────────────────────

/// Sleep with exponential backoff + ±25% jitter.
/// Respects a server-specified Retry-After if one was sent.
/// Returns the actual delay duration for logging. `attempt` is 0-based.
pub async fn retry_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let delay = backoff_delay(attempt, retry_after_secs);
    tokio::time::sleep(delay).await;
    delay
}

/// Compute the backoff delay without sleeping (used by tests and by callers
/// that race the delay against cancellation).
pub fn backoff_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let base_ms = RETRY_BASE_MS.saturating_mul(2u64.saturating_pow(attempt.min(16)));
    let capped_ms = base_ms.min(RETRY_CAP_MS);
    let delay_ms = if let Some(secs) = retry_after_secs {
        // Use the server-specified delay, capped at 60s, floored at our backoff
        (secs.min(60) * 1000).max(capped_ms)
    } else {
        capped_ms
    };
    Duration::from_millis(apply_jitter(delay_ms))
}

/// Apply ±25% jitter to prevent thundering-herd effects.
fn apply_jitter(base_ms: u64) -> u64 {
    let jitter_range = (base_ms / 4) as i64;
    if jitter_range == 0 {
        return base_ms.max(50);
    }
    let offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    (base_ms as i64 + offset).max(50) as u64
}

// ── Retry-After header parsing ─────────────────────────────────────────────

/// Parse a Retry-After header value (integer seconds only).
/// HTTP-date format is not implemented — falls back to computed backoff.
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(502));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(504));
        assert!(is_retryable_status(529));
        assert!(!is_retryable_status(200));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn parse_retry_after_valid() {
        assert_eq!(parse_retry_after("5"), Some(5));
        assert_eq!(parse_retry_after(" 30 "), Some(30));
        assert_eq!(parse_retry_after("not-a-number"), None);
    }

    #[test]
    fn backoff_grows_then_caps() {
        // attempt 0 ≈ 250ms, attempt 4 would be 4000ms capped
        for _ in 0..20 {
            let d0 = backoff_delay(0, None).as_millis() as u64;
            assert!((150..=350).contains(&d0), "attempt 0 delay {d0}");
            let d9 = backoff_delay(9, None).as_millis() as u64;
            assert!(d9 <= 5_000, "capped delay {d9}");
            assert!(d9 >= 3_000, "capped delay too small {d9}");
        }
    }

    #[test]
    fn retry_after_overrides_when_longer() {
        let d = backoff_delay(0, Some(10));
        assert!(d.as_millis() >= 7_500); // 10s ± 25%
    }

    #[test]
    fn shared_client_builds() {
        let _client = shared_client();
    }
}
