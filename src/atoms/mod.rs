// ── Waystation Atoms Layer ─────────────────────────────────────────────────
// Pure constants, error types, clock/ID helpers, and wire types — no I/O
// beyond reading the clock. Dependency rule: atoms may only depend on std and
// external pure crates. Nothing here may import from engine/ or server/.

pub mod constants;
pub mod error;
pub mod ids;
pub mod types;
