// ── Waystation ─────────────────────────────────────────────────────────────
// Offline-first AI orchestration gateway: OpenAI-compatible routing in
// front, an MCP tool-calling agent behind it, circuit breakers around
// everything that can fail.
//
// Layering (imports only point downward):
//   atoms/   pure constants, errors, ids, wire types
//   engine/  the runtime planes: config, store, breakers, tracker, MCP,
//            maître d', agent loop, providers, scheduler, boot
//   server/  the axum gateway surface

pub mod atoms;
pub mod engine;
pub mod server;

pub use atoms::error::{GatewayError, GatewayResult};
pub use engine::boot::{boot, shutdown, BootOptions};
pub use engine::state::GatewayState;
pub use server::build_router;

/// Root of the gateway's on-disk state (`~/.waystation` unless overridden).
pub fn default_state_dir() -> std::path::PathBuf {
    if let Ok(dir) = std::env::var("WAYSTATION_STATE_DIR") {
        return std::path::PathBuf::from(dir);
    }
    dirs::home_dir().unwrap_or_default().join(".waystation")
}
