// ── Waystation Engine: MCP Protocol Types ──────────────────────────────────
//
// Protocol types for the MCP JSON-RPC interface.
// Spec: https://spec.modelcontextprotocol.io/

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// MCP server names must match this shape — enforced at load time.
pub fn valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

// ── Server Configuration (persisted) ───────────────────────────────────────

/// Configured MCP server definition — stored in the database and in
/// `config/mcp_manifests/*.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Unique name, `[A-Za-z0-9_.-]+`.
    pub name: String,
    /// Transport type.
    #[serde(default)]
    pub transport: McpTransportKind,
    /// Command to spawn (stdio transport).
    #[serde(default)]
    pub command: String,
    /// Arguments for the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables passed to the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// URL for http / sse / ws transports.
    #[serde(default)]
    pub url: String,
    /// Extra query parameters merged into http/sse calls.
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    /// Bearer token; `MCP_TOKEN_<UPPERCASE_NAME>` overrides at load.
    #[serde(default)]
    pub token: Option<String>,
    /// Socket path (unix transport).
    #[serde(default)]
    pub uds_path: String,
    /// Request path on the unix socket's HTTP surface.
    #[serde(default = "default_http_path")]
    pub http_path: String,
    /// Per-tool call timeout overrides (seconds).
    #[serde(default)]
    pub tool_timeouts: HashMap<String, u64>,
    /// Per-server concurrency limit; absent = unbounded.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Whether this server is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_http_path() -> String {
    "/rpc".into()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    #[default]
    Stdio,
    Http,
    Sse,
    Ws,
    Unix,
}

// ── JSON-RPC 2.0 Framing ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ── MCP Protocol Messages ──────────────────────────────────────────────────

/// Client capabilities sent during `initialize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: McpClientCapabilities,
    pub client_info: McpClientInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: McpServerCapabilities,
    #[serde(default)]
    pub server_info: Option<McpServerInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerCapabilities {
    #[serde(default)]
    pub tools: Option<serde_json::Value>,
    #[serde(default)]
    pub resources: Option<serde_json::Value>,
    #[serde(default)]
    pub prompts: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

// ── tools/list ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<McpToolDef>,
}

/// A single tool exposed by an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema describing the tool's input.
    #[serde(default = "default_empty_object")]
    pub input_schema: serde_json::Value,
    /// Coarse grouping used by the menu curation layer.
    #[serde(default)]
    pub category: Option<String>,
    /// Tools flagged here are dropped while offline.
    #[serde(default)]
    pub requires_internet: bool,
}

fn default_empty_object() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

// ── tools/call ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub content: Vec<McpContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum McpContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "resource")]
    Resource { resource: serde_json::Value },
}

/// Extract text content from MCP content blocks, concatenated.
pub fn extract_text_content(content: &[McpContent]) -> String {
    content
        .iter()
        .filter_map(|c| match c {
            McpContent::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── External tool addressing ───────────────────────────────────────────────

/// External address of an MCP tool: `mcp__<server>__<tool>`.
pub fn tool_address(server: &str, tool: &str) -> String {
    format!("mcp__{server}__{tool}")
}

/// Parse an external tool address against a set of known server names.
/// Longest server name wins, since names may themselves contain underscores.
pub fn parse_tool_address<'a>(
    address: &'a str,
    mut known_servers: Vec<&'a str>,
) -> Option<(&'a str, &'a str)> {
    let stripped = address.strip_prefix("mcp__")?;
    known_servers.sort_by_key(|s| std::cmp::Reverse(s.len()));
    for server in known_servers {
        if let Some(rest) = stripped.strip_prefix(server) {
            if let Some(tool) = rest.strip_prefix("__") {
                if !tool.is_empty() {
                    return Some((server, tool));
                }
            }
        }
    }
    None
}

// ── Runtime state (not persisted) ──────────────────────────────────────────

/// Runtime status of a configured MCP server.
#[derive(Debug, Clone, Serialize)]
pub struct McpServerStatus {
    pub name: String,
    pub transport: McpTransportKind,
    pub enabled: bool,
    pub initialized: bool,
    pub pid: Option<u32>,
    pub tool_count: usize,
    pub breaker_state: Option<String>,
    pub last_discovery_age_secs: Option<u64>,
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_validation() {
        assert!(valid_server_name("fs"));
        assert!(valid_server_name("web_search-v2.1"));
        assert!(!valid_server_name(""));
        assert!(!valid_server_name("bad name"));
        assert!(!valid_server_name("bad/name"));
    }

    #[test]
    fn test_server_config_defaults() {
        let json = r#"{"name":"fs","command":"mcp-fs"}"#;
        let cfg: McpServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.transport, McpTransportKind::Stdio);
        assert!(cfg.enabled);
        assert!(cfg.args.is_empty());
        assert_eq!(cfg.http_path, "/rpc");
        assert!(cfg.max_concurrency.is_none());
    }

    #[test]
    fn test_transport_serde() {
        let json = serde_json::to_string(&McpTransportKind::Stdio).unwrap();
        assert_eq!(json, "\"stdio\"");
        let t: McpTransportKind = serde_json::from_str("\"unix\"").unwrap();
        assert_eq!(t, McpTransportKind::Unix);
    }

    #[test]
    fn test_jsonrpc_request_serde() {
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"tools/list\""));
        assert!(!json.contains("\"params\"")); // skip_serializing_if None
    }

    #[test]
    fn test_jsonrpc_response_error() {
        let json =
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[test]
    fn test_tool_def_serde() {
        let json = r#"{"name":"read_file","description":"Read a file","inputSchema":{"type":"object","properties":{"path":{"type":"string"}},"required":["path"]}}"#;
        let tool: McpToolDef = serde_json::from_str(json).unwrap();
        assert_eq!(tool.name, "read_file");
        assert!(tool.input_schema["properties"]["path"].is_object());
        assert!(!tool.requires_internet);
    }

    #[test]
    fn test_tool_call_result_text() {
        let json = r#"{"content":[{"type":"text","text":"Hello"}],"isError":false}"#;
        let result: ToolCallResult = serde_json::from_str(json).unwrap();
        assert!(!result.is_error);
        assert_eq!(extract_text_content(&result.content), "Hello");
    }

    #[test]
    fn test_extract_text_skips_non_text() {
        let content = vec![
            McpContent::Text { text: "a".into() },
            McpContent::Image {
                data: "…".into(),
                mime_type: "image/png".into(),
            },
            McpContent::Text { text: "b".into() },
        ];
        assert_eq!(extract_text_content(&content), "a\nb");
    }

    #[test]
    fn test_tool_address_roundtrip() {
        let addr = tool_address("fs", "read_file");
        assert_eq!(addr, "mcp__fs__read_file");
        let (server, tool) = parse_tool_address(&addr, vec!["fs", "web"]).unwrap();
        assert_eq!(server, "fs");
        assert_eq!(tool, "read_file");
    }

    #[test]
    fn test_tool_address_longest_server_wins() {
        // "web" and "web_search" are both known; the longer one must match
        let addr = tool_address("web_search", "query");
        let (server, tool) = parse_tool_address(&addr, vec!["web", "web_search"]).unwrap();
        assert_eq!(server, "web_search");
        assert_eq!(tool, "query");
    }

    #[test]
    fn test_tool_address_rejects_unknown() {
        assert!(parse_tool_address("mcp__nope__x", vec!["fs"]).is_none());
        assert!(parse_tool_address("plain_tool", vec!["fs"]).is_none());
        assert!(parse_tool_address("mcp__fs__", vec!["fs"]).is_none());
    }

    #[test]
    fn test_initialize_params_casing() {
        let params = InitializeParams {
            protocol_version: "2024-11-05".into(),
            capabilities: McpClientCapabilities::default(),
            client_info: McpClientInfo {
                name: "Waystation".into(),
                version: "0.1.0".into(),
            },
        };
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("protocolVersion"));
        assert!(json.contains("clientInfo"));
    }
}
