// ── Waystation Atoms: Clock & Request IDs ──────────────────────────────────

use uuid::Uuid;

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fresh request ID.
pub fn new_request_id() -> Uuid {
    Uuid::new_v4()
}

/// Use the incoming `X-Request-ID` if it parses as a UUID, else mint one.
pub fn request_id_from_header(header: Option<&str>) -> Uuid {
    header
        .and_then(|h| Uuid::parse_str(h.trim()).ok())
        .unwrap_or_else(new_request_id)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_header_is_kept() {
        let id = new_request_id();
        let parsed = request_id_from_header(Some(&id.to_string()));
        assert_eq!(parsed, id);
    }

    #[test]
    fn invalid_header_is_replaced() {
        let a = request_id_from_header(Some("not-a-uuid"));
        let b = request_id_from_header(None);
        assert_ne!(a, b);
    }

    #[test]
    fn clock_is_sane() {
        let s = epoch_secs();
        let ms = now_ms();
        assert!(ms / 1000 >= s.saturating_sub(1));
    }
}
