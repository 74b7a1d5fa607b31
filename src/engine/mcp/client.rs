// ── Waystation Engine: MCP Client ──────────────────────────────────────────
//
// One connected client per MCP server. Handles the initialize handshake,
// tools/list, and tools/call over whichever transport the server config
// names. Failure classification happens here: transport-level failures
// (timeout, connection) are transient and may be retried by the manager;
// RPC error objects and schema mismatches are permanent.

use super::transport::{
    HttpTransport, McpTransportHandle, SseTransport, StdioTransport, UnixTransport, WsTransport,
};
use super::types::*;
use crate::atoms::constants::TRUNCATION_MARKER;
use crate::atoms::types::truncate_utf8;
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};

/// MCP protocol version we advertise.
const PROTOCOL_VERSION: &str = "2024-11-05";
/// Timeout for handshake and discovery RPCs (seconds).
const DEFAULT_TIMEOUT: u64 = 30;

/// A tool-call failure, classified for the retry/breaker policy.
#[derive(Debug, Clone)]
pub struct McpCallError {
    /// Transient failures (timeout, connection) retry before the breaker
    /// hears about them; permanent ones (RPC error object, schema mismatch)
    /// are recorded immediately.
    pub transient: bool,
    pub message: String,
}

impl McpCallError {
    fn transient(message: impl Into<String>) -> Self {
        McpCallError {
            transient: true,
            message: message.into(),
        }
    }

    fn permanent(message: impl Into<String>) -> Self {
        McpCallError {
            transient: false,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for McpCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// A connected MCP client for a single server.
pub struct McpClient {
    /// The server config this client was created from.
    pub config: McpServerConfig,
    transport: McpTransportHandle,
    /// Monotonically increasing request ID.
    next_id: AtomicU64,
    /// Server's declared identity (from the initialize response).
    pub server_info: Option<McpServerInfo>,
    /// Set once the initialize handshake has been acknowledged.
    pub initialized: bool,
}

impl McpClient {
    /// Connect to the MCP server using the appropriate transport and perform
    /// the initialize handshake.
    pub async fn connect(config: McpServerConfig) -> Result<Self, String> {
        info!(
            "[mcp] Connecting to server '{}' via {:?}",
            config.name, config.transport
        );

        let transport = match config.transport {
            McpTransportKind::Stdio => {
                if config.command.is_empty() {
                    return Err("stdio transport requires a command".to_string());
                }
                let stdio =
                    StdioTransport::spawn(&config.command, &config.args, &config.env).await?;
                McpTransportHandle::Stdio(stdio)
            }
            McpTransportKind::Http => {
                if config.url.is_empty() {
                    return Err("http transport requires a url".to_string());
                }
                McpTransportHandle::Http(HttpTransport::new(
                    &config.url,
                    config.token.clone(),
                    config.query_params.clone(),
                ))
            }
            McpTransportKind::Sse => {
                if config.url.is_empty() {
                    return Err("sse transport requires a url".to_string());
                }
                McpTransportHandle::Sse(SseTransport::new(
                    &config.url,
                    config.token.clone(),
                    config.query_params.clone(),
                ))
            }
            McpTransportKind::Ws => {
                if config.url.is_empty() {
                    return Err("ws transport requires a url".to_string());
                }
                McpTransportHandle::Ws(WsTransport::new(&config.url, config.token.clone()))
            }
            McpTransportKind::Unix => {
                if config.uds_path.is_empty() {
                    return Err("unix transport requires a socket path".to_string());
                }
                McpTransportHandle::Unix(UnixTransport::new(&config.uds_path, &config.http_path))
            }
        };

        let mut client = McpClient {
            config,
            transport,
            next_id: AtomicU64::new(1),
            server_info: None,
            initialized: false,
        };
        client.initialize().await?;
        Ok(client)
    }

    /// MCP `initialize` handshake.
    async fn initialize(&mut self) -> Result<(), String> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: McpClientCapabilities::default(),
            client_info: McpClientInfo {
                name: "Waystation".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };

        let req = JsonRpcRequest::new(
            self.next_id(),
            "initialize",
            Some(serde_json::to_value(&params).map_err(|e| e.to_string())?),
        );
        let resp = self.transport.send_request(req, DEFAULT_TIMEOUT).await?;

        if let Some(err) = resp.error {
            return Err(format!(
                "MCP initialize failed: {} (code={})",
                err.message, err.code
            ));
        }
        if let Some(result) = resp.result {
            if let Ok(init) = serde_json::from_value::<InitializeResult>(result) {
                info!(
                    "[mcp] Server '{}' initialized (protocol={})",
                    self.config.name, init.protocol_version
                );
                self.server_info = init.server_info;
            }
        }

        // `initialized` notification (required by spec)
        self.transport
            .send_notification("notifications/initialized", None)
            .await?;
        self.initialized = true;
        Ok(())
    }

    /// Fetch the tool list from the server.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>, String> {
        let req = JsonRpcRequest::new(self.next_id(), "tools/list", None);
        let resp = self.transport.send_request(req, DEFAULT_TIMEOUT).await?;

        if let Some(err) = resp.error {
            // Server may not expose tools at all
            if err.code == -32601 {
                info!("[mcp] Server '{}' does not expose tools", self.config.name);
                return Ok(vec![]);
            }
            return Err(format!(
                "tools/list failed: {} (code={})",
                err.message, err.code
            ));
        }

        match resp.result {
            Some(result) => {
                let list: ToolsListResult = serde_json::from_value(result)
                    .map_err(|e| format!("Parse tools/list: {}", e))?;
                info!(
                    "[mcp] Server '{}' exposes {} tools",
                    self.config.name,
                    list.tools.len()
                );
                Ok(list.tools)
            }
            None => Ok(vec![]),
        }
    }

    /// Call a tool on this MCP server. Output above `size_cap` bytes is
    /// truncated with a marker; output exactly at the cap comes back whole.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout_secs: u64,
        size_cap: usize,
    ) -> Result<String, McpCallError> {
        let params = ToolCallParams {
            name: tool_name.into(),
            arguments,
        };
        let req = JsonRpcRequest::new(
            self.next_id(),
            "tools/call",
            Some(serde_json::to_value(&params).map_err(|e| McpCallError::permanent(e.to_string()))?),
        );

        let resp = self
            .transport
            .send_request(req, timeout_secs)
            .await
            .map_err(McpCallError::transient)?;

        if let Some(err) = resp.error {
            return Err(McpCallError::permanent(format!(
                "tools/call '{}' failed: {} (code={})",
                tool_name, err.message, err.code
            )));
        }

        let result_val = resp.result.ok_or_else(|| {
            McpCallError::permanent(format!("tools/call '{}': empty result", tool_name))
        })?;
        let tool_result: ToolCallResult = serde_json::from_value(result_val)
            .map_err(|e| McpCallError::permanent(format!("Parse tools/call result: {}", e)))?;

        let text = extract_text_content(&tool_result.content);
        if tool_result.is_error {
            return Err(McpCallError::permanent(text));
        }
        Ok(cap_output(text, size_cap))
    }

    /// Check if the underlying transport is still alive.
    pub async fn is_alive(&self) -> bool {
        self.transport.is_alive().await
    }

    /// Subprocess pid, stdio only.
    pub fn pid(&self) -> Option<u32> {
        self.transport.pid()
    }

    /// Gracefully shut down the transport.
    pub async fn shutdown(&self) {
        info!("[mcp] Shutting down server '{}'", self.config.name);
        self.transport.shutdown().await;
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Enforce the output size cap: at the cap the output is whole, one byte
/// over it is truncated and marked.
fn cap_output(text: String, size_cap: usize) -> String {
    if text.len() <= size_cap {
        return text;
    }
    let mut capped = truncate_utf8(&text, size_cap).to_string();
    capped.push_str(TRUNCATION_MARKER);
    capped
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_at_cap_is_whole() {
        let text = "x".repeat(100);
        assert_eq!(cap_output(text.clone(), 100), text);
    }

    #[test]
    fn output_over_cap_is_truncated_with_marker() {
        let text = "x".repeat(101);
        let capped = cap_output(text, 100);
        assert!(capped.starts_with(&"x".repeat(100)));
        assert!(capped.ends_with(TRUNCATION_MARKER));
        assert_eq!(capped.len(), 100 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn call_error_classification() {
        assert!(McpCallError::transient("timeout").transient);
        assert!(!McpCallError::permanent("rpc error").transient);
    }

    #[tokio::test]
    async fn connect_rejects_incomplete_configs() {
        let cfg = McpServerConfig {
            name: "bad".into(),
            transport: McpTransportKind::Stdio,
            command: String::new(),
            args: vec![],
            env: Default::default(),
            url: String::new(),
            query_params: Default::default(),
            token: None,
            uds_path: String::new(),
            http_path: "/rpc".into(),
            tool_timeouts: Default::default(),
            max_concurrency: None,
            enabled: true,
        };
        assert!(McpClient::connect(cfg.clone()).await.is_err());

        let mut http = cfg;
        http.transport = McpTransportKind::Http;
        assert!(McpClient::connect(http).await.is_err());
    }
}
