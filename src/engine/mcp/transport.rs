// ── Waystation Engine: MCP Transports ──────────────────────────────────────
//
// One module per wire: stdio child processes speak line-delimited JSON (one
// object per line), ws speaks one text frame per object, http posts a single
// JSON body, sse posts and reads `data:` events, unix posts a hand-framed
// HTTP/1.1 request over a domain socket. All transports correlate responses
// to requests by JSON-RPC id; responses without a matching id are discarded
// with a warning.

use super::types::{JsonRpcRequest, JsonRpcResponse};
use crate::engine::http::shared_client;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

// ── Stdio ──────────────────────────────────────────────────────────────────

/// A running stdio transport — owns the child process and message routing.
/// Framing is line-delimited JSON: one object per line, both directions.
pub struct StdioTransport {
    /// Sender to write JSON lines to the child's stdin.
    writer_tx: mpsc::Sender<Vec<u8>>,
    /// Pending requests awaiting responses, keyed by JSON-RPC id.
    pending: PendingMap,
    /// Handle to the child process (for cleanup).
    child: Arc<Mutex<Option<Child>>>,
    /// Captured at spawn; survives the child handle for status reporting.
    pid: Option<u32>,
    /// Cleared when stdout reaches EOF or the child exits.
    alive: Arc<AtomicBool>,
    _reader_handle: tokio::task::JoinHandle<()>,
    _writer_handle: tokio::task::JoinHandle<()>,
}

impl StdioTransport {
    /// Spawn a child process and set up bidirectional JSON-RPC transport.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, String> {
        info!("[mcp] Spawning: {} {}", command, args.join(" "));

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        // Merge extra env vars (credentials, etc.)
        for (k, v) in env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("Failed to spawn MCP server `{}`: {}", command, e))?;

        let pid = child.id();
        let stdin = child.stdin.take().ok_or("Failed to open stdin")?;
        let stdout = child.stdout.take().ok_or("Failed to open stdout")?;
        let stderr = child.stderr.take().ok_or("Failed to open stderr")?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        // ── Writer task: newline-terminated JSON to stdin ──────────────────
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(64);
        let _writer_handle = {
            let mut stdin = stdin;
            tokio::spawn(async move {
                while let Some(mut msg) = writer_rx.recv().await {
                    msg.push(b'\n');
                    if let Err(e) = stdin.write_all(&msg).await {
                        error!("[mcp] stdin write error: {}", e);
                        break;
                    }
                    if let Err(e) = stdin.flush().await {
                        error!("[mcp] stdin flush error: {}", e);
                        break;
                    }
                }
                debug!("[mcp] Writer task exiting");
            })
        };

        // ── Reader task: one JSON object per line from stdout ──────────────
        let _reader_handle = {
            let pending = Arc::clone(&pending);
            let alive = Arc::clone(&alive);
            let mut reader = BufReader::new(stdout);
            tokio::spawn(async move {
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => {
                            info!("[mcp] Stdout closed (server exited)");
                            break;
                        }
                        Ok(_) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            dispatch_response(trimmed, &pending).await;
                        }
                        Err(e) => {
                            error!("[mcp] Read error: {}", e);
                            break;
                        }
                    }
                }
                alive.store(false, Ordering::Relaxed);
                // Drop waiters so callers fail promptly instead of timing out
                pending.lock().await.clear();
            })
        };

        // ── Stderr drain (debug log) ───────────────────────────────────────
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            debug!("[mcp:stderr] {}", trimmed);
                        }
                    }
                    Err(e) => {
                        warn!("[mcp] stderr read error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(StdioTransport {
            writer_tx,
            pending,
            child: Arc::new(Mutex::new(Some(child))),
            pid,
            alive,
            _reader_handle,
            _writer_handle,
        })
    }

    pub async fn send_request(
        &self,
        request: JsonRpcRequest,
        timeout_secs: u64,
    ) -> Result<JsonRpcResponse, String> {
        let id = request.id;
        let (tx, rx) = oneshot::channel();
        {
            let mut map = self.pending.lock().await;
            map.insert(id, tx);
        }

        let body = serde_json::to_vec(&request).map_err(|e| format!("Serialize error: {}", e))?;
        if self.writer_tx.send(body).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err("Transport writer closed".to_string());
        }

        let resp = tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), rx)
            .await
            .map_err(|_| {
                // Clean up the orphaned waiter on timeout
                let pending = Arc::clone(&self.pending);
                tokio::spawn(async move {
                    pending.lock().await.remove(&id);
                });
                format!("MCP request timed out after {}s (id={})", timeout_secs, id)
            })?
            .map_err(|_| "Response channel dropped".to_string())?;
        Ok(resp)
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), String> {
        let notif = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or(serde_json::json!({})),
        });
        let body = serde_json::to_vec(&notif).map_err(|e| format!("Serialize error: {}", e))?;
        self.writer_tx
            .send(body)
            .await
            .map_err(|_| "Transport writer closed".to_string())
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Kill the child process and clean up.
    pub async fn shutdown(&self) {
        let mut guard = self.child.lock().await;
        if let Some(ref mut child) = *guard {
            info!("[mcp] Killing child process (pid={:?})", self.pid);
            let _ = child.kill().await;
        }
        *guard = None;
        self.alive.store(false, Ordering::Relaxed);
    }

    /// Check if the child process is still running.
    pub async fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::Relaxed) {
            return false;
        }
        let mut guard = self.child.lock().await;
        if let Some(ref mut child) = *guard {
            match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    info!("[mcp] Child exited with {}", status);
                    self.alive.store(false, Ordering::Relaxed);
                    false
                }
                Err(_) => false,
            }
        } else {
            false
        }
    }
}

/// Parse a line as a JSON-RPC response and hand it to the matching waiter.
async fn dispatch_response(raw: &str, pending: &PendingMap) {
    match serde_json::from_str::<JsonRpcResponse>(raw) {
        Ok(resp) => {
            if let Some(id) = resp.id {
                let mut map = pending.lock().await;
                if let Some(tx) = map.remove(&id) {
                    let _ = tx.send(resp);
                } else {
                    warn!("[mcp] Response for unknown id={}, discarding", id);
                }
            } else {
                // Notification from the server — log and discard
                debug!("[mcp] Server notification: {}", &raw[..raw.len().min(200)]);
            }
        }
        Err(e) => {
            warn!("[mcp] Failed to parse response line: {}", e);
        }
    }
}

// ── WebSocket ──────────────────────────────────────────────────────────────

struct WsConn {
    writer_tx: mpsc::Sender<String>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
}

/// Persistent WebSocket transport: one connection, a send queue, and
/// reconnect-on-next-call when the connection drops.
pub struct WsTransport {
    url: String,
    token: Option<String>,
    conn: Mutex<Option<WsConn>>,
}

impl WsTransport {
    pub fn new(url: &str, token: Option<String>) -> Self {
        WsTransport {
            url: url.to_string(),
            token,
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<WsConn, String> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| format!("Bad ws url: {}", e))?;
        if let Some(token) = &self.token {
            let header = format!("Bearer {token}")
                .parse()
                .map_err(|_| "Invalid token header".to_string())?;
            request.headers_mut().insert("Authorization", header);
        }

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| format!("ws connect failed: {}", e))?;
        info!("[mcp] WebSocket connected: {}", self.url);

        let (mut sink, mut source) = stream.split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            while let Some(text) = writer_rx.recv().await {
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    error!("[mcp] ws send error: {}", e);
                    break;
                }
            }
        });

        {
            let pending = Arc::clone(&pending);
            let alive = Arc::clone(&alive);
            tokio::spawn(async move {
                while let Some(msg) = source.next().await {
                    match msg {
                        Ok(WsMessage::Text(text)) => dispatch_response(&text, &pending).await,
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => {} // ping/pong handled by the library
                        Err(e) => {
                            warn!("[mcp] ws read error: {}", e);
                            break;
                        }
                    }
                }
                alive.store(false, Ordering::Relaxed);
                pending.lock().await.clear();
            });
        }

        Ok(WsConn {
            writer_tx,
            pending,
            alive,
        })
    }

    pub async fn send_request(
        &self,
        request: JsonRpcRequest,
        timeout_secs: u64,
    ) -> Result<JsonRpcResponse, String> {
        let id = request.id;
        let text = serde_json::to_string(&request).map_err(|e| e.to_string())?;

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.conn.lock().await;
            let needs_reconnect = match guard.as_ref() {
                Some(conn) => !conn.alive.load(Ordering::Relaxed),
                None => true,
            };
            if needs_reconnect {
                *guard = Some(self.connect().await?);
            }
            let conn = guard.as_ref().expect("connection just established");
            conn.pending.lock().await.insert(id, tx);
            if conn.writer_tx.send(text).await.is_err() {
                conn.alive.store(false, Ordering::Relaxed);
                return Err("ws writer closed".to_string());
            }
        }

        tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), rx)
            .await
            .map_err(|_| format!("MCP ws request timed out after {}s (id={})", timeout_secs, id))?
            .map_err(|_| "Response channel dropped".to_string())
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), String> {
        let notif = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or(serde_json::json!({})),
        });
        let guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            conn.writer_tx
                .send(notif.to_string())
                .await
                .map_err(|_| "ws writer closed".to_string())
        } else {
            Err("ws not connected".to_string())
        }
    }

    pub async fn is_alive(&self) -> bool {
        self.conn
            .lock()
            .await
            .as_ref()
            .map(|c| c.alive.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub async fn shutdown(&self) {
        *self.conn.lock().await = None;
    }
}

// ── HTTP ───────────────────────────────────────────────────────────────────

/// Stateless HTTP transport: one JSON body per request via the shared pool.
pub struct HttpTransport {
    url: String,
    token: Option<String>,
    query_params: HashMap<String, String>,
}

impl HttpTransport {
    pub fn new(url: &str, token: Option<String>, query_params: HashMap<String, String>) -> Self {
        HttpTransport {
            url: url.to_string(),
            token,
            query_params,
        }
    }

    pub async fn send_request(
        &self,
        request: JsonRpcRequest,
        timeout_secs: u64,
    ) -> Result<JsonRpcResponse, String> {
        let mut req = shared_client()
            .post(&self.url)
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .query(&self.query_params)
            .json(&request);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| format!("http send failed: {}", e))?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(format!("http status {}", status));
        }
        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| format!("http body parse failed: {}", e))
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), String> {
        let notif = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or(serde_json::json!({})),
        });
        let mut req = shared_client().post(&self.url).query(&self.query_params).json(&notif);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        req.send().await.map_err(|e| format!("http send failed: {}", e))?;
        Ok(())
    }
}

// ── SSE ────────────────────────────────────────────────────────────────────

/// SSE transport: tool calls go out as HTTP POSTs; when the server answers
/// with `text/event-stream`, the response is the first `data:` event carrying
/// our request id.
pub struct SseTransport {
    url: String,
    token: Option<String>,
    query_params: HashMap<String, String>,
}

impl SseTransport {
    pub fn new(url: &str, token: Option<String>, query_params: HashMap<String, String>) -> Self {
        SseTransport {
            url: url.to_string(),
            token,
            query_params,
        }
    }

    pub async fn send_request(
        &self,
        request: JsonRpcRequest,
        timeout_secs: u64,
    ) -> Result<JsonRpcResponse, String> {
        let want_id = request.id;
        let mut req = shared_client()
            .post(&self.url)
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .query(&self.query_params)
            .header("Accept", "text/event-stream, application/json")
            .json(&request);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| format!("sse send failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("sse status {}", resp.status().as_u16()));
        }

        let is_event_stream = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/event-stream"))
            .unwrap_or(false);

        if !is_event_stream {
            return resp
                .json::<JsonRpcResponse>()
                .await
                .map_err(|e| format!("sse body parse failed: {}", e));
        }

        // `data: <json>\n\n` events; take the one answering our id
        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| format!("sse read error: {}", e))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buffer.find("\n\n") {
                let event: String = buffer[..pos].to_string();
                buffer = buffer[pos + 2..].to_string();
                for line in event.lines() {
                    if let Some(data) = line.strip_prefix("data:") {
                        if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(data.trim()) {
                            match resp.id {
                                Some(id) if id == want_id => return Ok(resp),
                                Some(id) => {
                                    warn!("[mcp] sse response for unknown id={}, discarding", id)
                                }
                                None => debug!("[mcp] sse notification discarded"),
                            }
                        }
                    }
                }
            }
        }
        Err("sse stream ended without a matching response".to_string())
    }
}

// ── Unix domain socket ─────────────────────────────────────────────────────

/// Unix transport: a minimal HTTP/1.1 POST hand-framed over a domain socket
/// (reqwest has no UDS support). One JSON body per request, connection
/// closed per call.
pub struct UnixTransport {
    uds_path: String,
    http_path: String,
}

impl UnixTransport {
    pub fn new(uds_path: &str, http_path: &str) -> Self {
        UnixTransport {
            uds_path: uds_path.to_string(),
            http_path: http_path.to_string(),
        }
    }

    pub async fn send_request(
        &self,
        request: JsonRpcRequest,
        timeout_secs: u64,
    ) -> Result<JsonRpcResponse, String> {
        let body = serde_json::to_vec(&request).map_err(|e| e.to_string())?;
        let raw = tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            self.roundtrip(&body),
        )
        .await
        .map_err(|_| format!("unix request timed out after {}s", timeout_secs))??;
        serde_json::from_slice::<JsonRpcResponse>(&raw)
            .map_err(|e| format!("unix body parse failed: {}", e))
    }

    async fn roundtrip(&self, body: &[u8]) -> Result<Vec<u8>, String> {
        let mut stream = UnixStream::connect(&self.uds_path)
            .await
            .map_err(|e| format!("unix connect {}: {}", self.uds_path, e))?;

        let head = format!(
            "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.http_path,
            body.len()
        );
        stream
            .write_all(head.as_bytes())
            .await
            .map_err(|e| format!("unix write: {}", e))?;
        stream
            .write_all(body)
            .await
            .map_err(|e| format!("unix write: {}", e))?;
        stream.flush().await.map_err(|e| format!("unix flush: {}", e))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(|e| format!("unix read: {}", e))?;
        parse_http_response(&raw)
    }
}

/// Split a raw HTTP/1.1 response into status + body; supports
/// content-length, close-delimited, and chunked bodies.
fn parse_http_response(raw: &[u8]) -> Result<Vec<u8>, String> {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or("unix response missing header terminator")?;
    let head = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = head.lines();
    let status_line = lines.next().ok_or("unix response missing status line")?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| format!("unix bad status line: {status_line}"))?;
    if !(200..300).contains(&status) {
        return Err(format!("unix http status {status}"));
    }
    let chunked = lines.any(|l| {
        let l = l.to_ascii_lowercase();
        l.starts_with("transfer-encoding:") && l.contains("chunked")
    });
    let body = &raw[header_end + 4..];
    if chunked {
        decode_chunked(body)
    } else {
        Ok(body.to_vec())
    }
}

fn decode_chunked(mut body: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    loop {
        let line_end = body
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or("chunked: missing size line")?;
        let size = usize::from_str_radix(
            String::from_utf8_lossy(&body[..line_end]).trim(),
            16,
        )
        .map_err(|_| "chunked: bad size".to_string())?;
        body = &body[line_end + 2..];
        if size == 0 {
            return Ok(out);
        }
        if body.len() < size + 2 {
            return Err("chunked: truncated chunk".to_string());
        }
        out.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }
}

// ── Handle ─────────────────────────────────────────────────────────────────

/// Type-erased transport handle owned by one `McpClient`.
pub enum McpTransportHandle {
    Stdio(StdioTransport),
    Ws(WsTransport),
    Http(HttpTransport),
    Sse(SseTransport),
    Unix(UnixTransport),
}

impl McpTransportHandle {
    pub async fn send_request(
        &self,
        request: JsonRpcRequest,
        timeout_secs: u64,
    ) -> Result<JsonRpcResponse, String> {
        match self {
            McpTransportHandle::Stdio(t) => t.send_request(request, timeout_secs).await,
            McpTransportHandle::Ws(t) => t.send_request(request, timeout_secs).await,
            McpTransportHandle::Http(t) => t.send_request(request, timeout_secs).await,
            McpTransportHandle::Sse(t) => t.send_request(request, timeout_secs).await,
            McpTransportHandle::Unix(t) => t.send_request(request, timeout_secs).await,
        }
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), String> {
        match self {
            McpTransportHandle::Stdio(t) => t.send_notification(method, params).await,
            McpTransportHandle::Ws(t) => t.send_notification(method, params).await,
            McpTransportHandle::Http(t) => t.send_notification(method, params).await,
            // SSE and unix notifications are fire-and-forget posts we skip:
            // neither surface is used for notifications by the servers we
            // speak to, and the protocol tolerates a lost `initialized`.
            McpTransportHandle::Sse(_) | McpTransportHandle::Unix(_) => Ok(()),
        }
    }

    pub async fn is_alive(&self) -> bool {
        match self {
            McpTransportHandle::Stdio(t) => t.is_alive().await,
            McpTransportHandle::Ws(t) => t.is_alive().await,
            // Stateless transports are "alive" as long as they exist
            McpTransportHandle::Http(_) | McpTransportHandle::Sse(_) | McpTransportHandle::Unix(_) => {
                true
            }
        }
    }

    pub async fn shutdown(&self) {
        match self {
            McpTransportHandle::Stdio(t) => t.shutdown().await,
            McpTransportHandle::Ws(t) => t.shutdown().await,
            _ => {}
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            McpTransportHandle::Stdio(t) => t.pid(),
            _ => None,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stdio_line_framed_roundtrip() {
        // `cat` echoes our request line back; a JSON-RPC request is not a
        // response, but it exercises spawn + write + reader without hanging.
        let transport = StdioTransport::spawn("cat", &[], &HashMap::new())
            .await
            .unwrap();
        assert!(transport.is_alive().await);

        // The echoed request has an id but was registered as pending — the
        // reader parses it as a response-shaped object with result: None,
        // error: None and resolves the waiter.
        let req = JsonRpcRequest::new(7, "tools/list", None);
        let resp = transport.send_request(req, 5).await.unwrap();
        assert_eq!(resp.id, Some(7));
        transport.shutdown().await;
        assert!(!transport.is_alive().await);
    }

    #[tokio::test]
    async fn stdio_detects_process_death() {
        let transport = StdioTransport::spawn("true", &[], &HashMap::new())
            .await
            .unwrap();
        // Give the process a moment to exit
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!transport.is_alive().await);
    }

    #[tokio::test]
    async fn stdio_spawn_failure_is_error() {
        let result =
            StdioTransport::spawn("definitely-not-a-real-binary-x9", &[], &HashMap::new()).await;
        assert!(result.is_err());
    }

    #[test]
    fn parse_http_response_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}";
        assert_eq!(parse_http_response(raw).unwrap(), b"{}");
    }

    #[test]
    fn parse_http_response_rejects_5xx() {
        let raw = b"HTTP/1.1 500 Internal Server Error\r\n\r\noops";
        assert!(parse_http_response(raw).is_err());
    }

    #[test]
    fn parse_http_response_chunked() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\n{}\r\n0\r\n\r\n";
        assert_eq!(parse_http_response(raw).unwrap(), b"{}");
    }

    #[test]
    fn decode_chunked_multi_chunk() {
        let body = b"3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n";
        assert_eq!(decode_chunked(body).unwrap(), b"abcdef");
    }
}
