// ── Waystation Engine: MCP Connection Manager ──────────────────────────────
//
// Owns every configured MCP server: lazy persistent connections, a global
// spawn semaphore for stdio cold-starts, per-server concurrency permits,
// breaker-guarded tool calls with transient retries, TTL-cached tool
// discovery, and the recovery probe that walks tripped breakers back to
// closed. Only this module touches MCP transports; everything else goes
// through its API.

use super::client::McpClient;
use super::types::*;
use crate::atoms::constants::{
    MCP_CALL_RETRIES, MCP_CALL_TIMEOUT_SECS, MCP_OUTPUT_CAP_BYTES, MCP_SPAWN_CONCURRENCY,
    TOOL_DISCOVERY_TTL_SECS,
};
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::ToolDefinition;
use crate::engine::breaker::{BreakerPolicy, BreakerRegistry};
use crate::engine::http::retry_delay;
use crate::engine::observability::{OperationMetric, Tracker};
use chrono::Utc;
use log::{info, warn};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

// ── Server slot ────────────────────────────────────────────────────────────

struct ServerSlot {
    config: RwLock<McpServerConfig>,
    /// Lazy persistent client; respawned on death by the next call.
    client: Mutex<Option<Arc<McpClient>>>,
    /// Cached tool list. Readers see the old or the new complete list,
    /// never a partial mix.
    tools: RwLock<Arc<Vec<McpToolDef>>>,
    last_discovery: parking_lot::Mutex<Option<Instant>>,
    /// Per-server concurrency permits, only present when configured.
    permits: Option<Arc<Semaphore>>,
}

impl ServerSlot {
    fn new(config: McpServerConfig) -> Self {
        let permits = config
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        ServerSlot {
            config: RwLock::new(config),
            client: Mutex::new(None),
            tools: RwLock::new(Arc::new(Vec::new())),
            last_discovery: parking_lot::Mutex::new(None),
            permits,
        }
    }
}

// ── Manager ────────────────────────────────────────────────────────────────

pub struct McpManager {
    slots: RwLock<HashMap<String, Arc<ServerSlot>>>,
    spawn_sem: Arc<Semaphore>,
    breakers: Arc<BreakerRegistry>,
    tracker: Arc<Tracker>,
}

impl McpManager {
    pub fn new(
        breakers: Arc<BreakerRegistry>,
        tracker: Arc<Tracker>,
        spawn_concurrency: Option<usize>,
    ) -> Self {
        McpManager {
            slots: RwLock::new(HashMap::new()),
            spawn_sem: Arc::new(Semaphore::new(
                spawn_concurrency.unwrap_or(MCP_SPAWN_CONCURRENCY).max(1),
            )),
            breakers,
            tracker,
        }
    }

    /// Load (or replace) the server set from config. Servers with invalid
    /// names are rejected; removed servers are shut down. Does NOT spawn
    /// anything — connections stay lazy unless pre-warm asks for them.
    pub async fn load_servers(&self, configs: Vec<McpServerConfig>) -> Vec<String> {
        let mut errors = Vec::new();
        let mut fresh: HashMap<String, Arc<ServerSlot>> = HashMap::new();
        for mut config in configs {
            if !valid_server_name(&config.name) {
                errors.push(format!("invalid MCP server name '{}'", config.name));
                continue;
            }
            // `MCP_TOKEN_<UPPERCASE_NAME>` beats the manifest token
            let env_key = format!("MCP_TOKEN_{}", config.name.to_uppercase().replace(['.', '-'], "_"));
            if let Ok(token) = std::env::var(&env_key) {
                config.token = Some(token);
            }
            fresh.insert(config.name.clone(), Arc::new(ServerSlot::new(config)));
        }

        let old: Vec<Arc<ServerSlot>> = {
            let mut slots = self.slots.write();
            let old = slots.values().cloned().collect();
            *slots = fresh;
            old
        };
        for slot in old {
            let client = slot.client.lock().await.take();
            if let Some(client) = client {
                client.shutdown().await;
            }
        }
        info!(
            "[mcp] {} servers loaded ({} rejected)",
            self.slots.read().len(),
            errors.len()
        );
        errors
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let slots = self.slots.read();
        match slots.get(name) {
            Some(slot) => {
                slot.config.write().enabled = enabled;
                info!("[mcp] Server '{}' {}", name, if enabled { "enabled" } else { "disabled" });
                true
            }
            None => false,
        }
    }

    // ── Tool calls ─────────────────────────────────────────────────────────

    /// Execute `tools/call` against one server with the full per-call
    /// protocol: breaker check, per-server permit, timeout, output cap,
    /// transient retries, breaker + metric recording.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
        request_id: Option<Uuid>,
        probe: bool,
    ) -> GatewayResult<String> {
        let slot = self.slot(server)?;
        if !slot.config.read().enabled {
            return Err(GatewayError::Degraded(format!(
                "MCP server '{server}' is disabled"
            )));
        }

        let key = format!("mcp:{server}");
        let policy = BreakerPolicy::mcp();
        // Recovery probes bypass the check but still record their outcome
        if !probe {
            self.breakers.admit(&key, policy)?;
        }

        let _permit = match &slot.permits {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| GatewayError::Internal("permit semaphore closed".into()))?,
            ),
            None => None,
        };

        let timeout_secs = {
            let config = slot.config.read();
            config
                .tool_timeouts
                .get(tool)
                .copied()
                .unwrap_or(MCP_CALL_TIMEOUT_SECS)
        };

        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            let result = self
                .call_once(&slot, server, tool, arguments.clone(), timeout_secs)
                .await;
            match result {
                Ok(text) => {
                    if probe {
                        self.breakers.record_probe_result(&key, policy, true, "");
                    } else {
                        self.breakers.record_success(&key);
                    }
                    self.record_metric(request_id, server, "tools/call", started, true, tool);
                    return Ok(text);
                }
                Err(e) if e.transient && attempt < MCP_CALL_RETRIES => {
                    attempt += 1;
                    let delay = retry_delay(attempt - 1, None).await;
                    warn!(
                        "[mcp] '{}' tools/call '{}' transient failure, retry {}/{} after {}ms: {}",
                        server,
                        tool,
                        attempt,
                        MCP_CALL_RETRIES,
                        delay.as_millis(),
                        e
                    );
                }
                Err(e) => {
                    if probe {
                        self.breakers
                            .record_probe_result(&key, policy, false, &e.message);
                    } else {
                        self.breakers.record_failure(&key, policy, &e.message);
                    }
                    self.record_metric(request_id, server, "tools/call", started, false, tool);
                    self.tracker.record_error(
                        &format!("mcp:{server}"),
                        &format!("tools/call '{}': {}", tool, e.message),
                        request_id,
                    );
                    return Err(GatewayError::mcp(server, e.message));
                }
            }
        }
    }

    async fn call_once(
        &self,
        slot: &Arc<ServerSlot>,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
        timeout_secs: u64,
    ) -> Result<String, super::client::McpCallError> {
        let client = self
            .ensure_client(slot, server)
            .await
            .map_err(|message| super::client::McpCallError {
                transient: true,
                message,
            })?;
        client
            .call_tool(tool, arguments, timeout_secs, MCP_OUTPUT_CAP_BYTES)
            .await
    }

    /// Get the live client for a slot, respawning a dead transport. The
    /// client mutex is held only for the health check + respawn, not for
    /// the call itself, so RPCs to one server can pipeline.
    async fn ensure_client(&self, slot: &Arc<ServerSlot>, server: &str) -> Result<Arc<McpClient>, String> {
        let mut guard = slot.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if client.is_alive().await {
                return Ok(Arc::clone(client));
            }
            // Process death: emit the event, drop the handle, respawn below
            warn!("[mcp] Server '{}' transport died — respawning", server);
            self.tracker
                .record_error(&format!("mcp:{server}"), "transport died", None);
            client.shutdown().await;
            *guard = None;
        }

        let config = slot.config.read().clone();
        let _spawn_permit = if config.transport == McpTransportKind::Stdio {
            Some(
                self.spawn_sem
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| "spawn semaphore closed".to_string())?,
            )
        } else {
            None
        };
        let client = Arc::new(McpClient::connect(config).await?);
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }

    // ── Discovery ──────────────────────────────────────────────────────────

    /// Discover tools for one server, honoring the cache TTL unless forced.
    /// On failure the previous cache is retained and the error is returned.
    pub async fn discover_tools(&self, server: &str, force: bool) -> GatewayResult<Arc<Vec<McpToolDef>>> {
        let slot = self.slot(server)?;
        if !force {
            let fresh_enough = slot
                .last_discovery
                .lock()
                .map(|at| at.elapsed().as_secs() < TOOL_DISCOVERY_TTL_SECS)
                .unwrap_or(false);
            if fresh_enough {
                return Ok(slot.tools.read().clone());
            }
        }

        let started = Instant::now();
        let client = self
            .ensure_client(&slot, server)
            .await
            .map_err(|e| GatewayError::mcp(server, e))?;
        match client.list_tools().await {
            Ok(tools) => {
                let tools = Arc::new(tools);
                *slot.tools.write() = Arc::clone(&tools);
                *slot.last_discovery.lock() = Some(Instant::now());
                self.record_metric(None, server, "tools/list", started, true, "");
                Ok(tools)
            }
            Err(e) => {
                self.record_metric(None, server, "tools/list", started, false, "");
                warn!(
                    "[mcp] Discovery for '{}' failed, keeping previous cache: {}",
                    server, e
                );
                Err(GatewayError::mcp(server, e))
            }
        }
    }

    /// Refresh discovery for every enabled server (config reload, 12h task).
    pub async fn refresh_all_tools(&self, force: bool) {
        for name in self.server_names() {
            let enabled = self
                .slots
                .read()
                .get(&name)
                .map(|s| s.config.read().enabled)
                .unwrap_or(false);
            if enabled {
                let _ = self.discover_tools(&name, force).await;
            }
        }
    }

    /// Cached tools without touching the wire.
    pub fn cached_tools(&self, server: &str) -> Arc<Vec<McpToolDef>> {
        self.slots
            .read()
            .get(server)
            .map(|slot| slot.tools.read().clone())
            .unwrap_or_else(|| Arc::new(Vec::new()))
    }

    /// All discovered tools across enabled servers as chat tool definitions,
    /// addressed `mcp__<server>__<tool>`.
    pub fn all_tool_definitions(&self) -> Vec<ToolDefinition> {
        let names = self.server_names();
        let mut defs = Vec::new();
        for name in names {
            defs.extend(self.tool_definitions_for_server(&name));
        }
        defs
    }

    /// Tool definitions for a chosen subset of servers.
    pub fn tool_definitions_for(&self, servers: &[String]) -> Vec<ToolDefinition> {
        let mut defs = Vec::new();
        for name in servers {
            defs.extend(self.tool_definitions_for_server(name));
        }
        defs
    }

    fn tool_definitions_for_server(&self, server: &str) -> Vec<ToolDefinition> {
        let slots = self.slots.read();
        let Some(slot) = slots.get(server) else {
            return Vec::new();
        };
        if !slot.config.read().enabled {
            return Vec::new();
        }
        let tools = slot.tools.read().clone();
        tools
            .iter()
            .map(|tool| {
                let description = format!(
                    "{} [MCP: {}]",
                    tool.description.as_deref().unwrap_or("(no description)"),
                    server
                );
                ToolDefinition::function(
                    tool_address(server, &tool.name),
                    description,
                    tool.input_schema.clone(),
                )
            })
            .collect()
    }

    /// Tools flagged `requires_internet`, as external addresses.
    pub fn internet_tool_addresses(&self) -> Vec<String> {
        let slots = self.slots.read();
        let mut out = Vec::new();
        for (name, slot) in slots.iter() {
            for tool in slot.tools.read().iter() {
                if tool.requires_internet {
                    out.push(tool_address(name, &tool.name));
                }
            }
        }
        out
    }

    // ── Recovery ───────────────────────────────────────────────────────────

    /// Walk every tripped `mcp:` breaker and issue a low-cost `tools/list`
    /// probe through the normal call path with the bypass flag. This is the
    /// sole gate that moves open breakers toward closed.
    pub async fn recovery_pass(&self) {
        for key in self.breakers.tripped_keys("mcp:") {
            let server = key.trim_start_matches("mcp:").to_string();
            let Ok(slot) = self.slot(&server) else { continue };
            if !slot.config.read().enabled {
                continue;
            }
            info!("[mcp] Recovery probe for '{}'", server);
            let policy = BreakerPolicy::mcp();
            let started = Instant::now();
            let result = async {
                let client = self.ensure_client(&slot, &server).await?;
                client.list_tools().await
            }
            .await;
            match result {
                Ok(tools) => {
                    *slot.tools.write() = Arc::new(tools);
                    *slot.last_discovery.lock() = Some(Instant::now());
                    self.breakers.record_probe_result(&key, policy, true, "");
                    self.record_metric(None, &server, "recovery_probe", started, true, "");
                }
                Err(e) => {
                    self.breakers.record_probe_result(&key, policy, false, &e);
                    self.record_metric(None, &server, "recovery_probe", started, false, "");
                }
            }
        }
    }

    // ── Status & shutdown ──────────────────────────────────────────────────

    pub async fn status_list(&self) -> Vec<McpServerStatus> {
        let slots: Vec<(String, Arc<ServerSlot>)> = {
            let map = self.slots.read();
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut list = Vec::with_capacity(slots.len());
        for (name, slot) in slots {
            let config = slot.config.read().clone();
            let (initialized, pid) = {
                let guard = slot.client.lock().await;
                match guard.as_ref() {
                    Some(client) => (client.initialized && client.is_alive().await, client.pid()),
                    None => (false, None),
                }
            };
            list.push(McpServerStatus {
                name: name.clone(),
                transport: config.transport,
                enabled: config.enabled,
                initialized,
                pid,
                tool_count: slot.tools.read().len(),
                breaker_state: self
                    .breakers
                    .state(&format!("mcp:{name}"))
                    .map(|s| s.as_str().to_string()),
                last_discovery_age_secs: slot.last_discovery.lock().map(|at| at.elapsed().as_secs()),
            });
        }
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Count of live stdio subprocesses (test/observability surface).
    pub async fn live_subprocess_count(&self) -> usize {
        let slots: Vec<Arc<ServerSlot>> = self.slots.read().values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            let guard = slot.client.lock().await;
            if let Some(client) = guard.as_ref() {
                if client.pid().is_some() && client.is_alive().await {
                    count += 1;
                }
            }
        }
        count
    }

    /// Close every transport; called during shutdown (reverse boot order).
    pub async fn shutdown_all(&self) {
        let slots: Vec<Arc<ServerSlot>> = self.slots.read().values().cloned().collect();
        for slot in slots {
            let client = slot.client.lock().await.take();
            if let Some(client) = client {
                client.shutdown().await;
            }
        }
        info!("[mcp] All transports closed");
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn slot(&self, server: &str) -> GatewayResult<Arc<ServerSlot>> {
        self.slots
            .read()
            .get(server)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("unknown MCP server '{server}'")))
    }

    fn record_metric(
        &self,
        request_id: Option<Uuid>,
        server: &str,
        operation: &str,
        started: Instant,
        ok: bool,
        tool: &str,
    ) {
        self.tracker.record_operation(
            request_id,
            OperationMetric {
                component: format!("mcp:{server}"),
                operation: operation.to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
                started_at: Utc::now(),
                ok,
                metadata: if tool.is_empty() {
                    serde_json::Value::Null
                } else {
                    json!({"tool": tool})
                },
            },
        );
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
