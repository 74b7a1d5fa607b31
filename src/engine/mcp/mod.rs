// ── Waystation Engine: MCP (Model Context Protocol) ────────────────────────
// Persistent connections to tool servers over five transports, JSON-RPC 2.0
// framing with id correlation, cached tool discovery, and breaker-guarded
// tool calls.

pub mod client;
pub mod registry;
pub mod transport;
pub mod types;

pub use registry::McpManager;
pub use types::{McpServerConfig, McpToolDef, McpTransportKind};
