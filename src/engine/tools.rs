// ── Waystation Engine: Tool Registry & Dispatcher ──────────────────────────
//
// Aggregates the fixed core tools (filesystem reads, memory query, time)
// with everything discovered over MCP. Core tools are always available:
// they skip circuit breakers and the maître d's skip list, and they work
// offline. MCP tools are addressed `mcp__<server>__<tool>` and routed
// through the connection manager.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::ToolDefinition;
use crate::engine::mcp::types::parse_tool_address;
use crate::engine::mcp::McpManager;
use crate::engine::store::DurableStore;
use log::{info, warn};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Names of the always-available core tools.
pub const CORE_TOOL_NAMES: &[&str] = &["read_file", "list_directory", "memory_query", "current_time"];

/// Sensitive paths the filesystem tools must never touch.
const SENSITIVE_PATHS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".aws/credentials",
    ".kube/config",
    ".npmrc",
    ".pypirc",
    "/etc/shadow",
    "/etc/sudoers",
    ".waystation/gateway.db",
    ".env",
];

/// Result of one tool execution, success or not — the agent loop feeds both
/// back to the model.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub output: String,
    pub success: bool,
}

impl ToolOutcome {
    fn ok(output: impl Into<String>) -> Self {
        ToolOutcome {
            output: output.into(),
            success: true,
        }
    }

    fn err(output: impl Into<String>) -> Self {
        ToolOutcome {
            output: output.into(),
            success: false,
        }
    }
}

// ── Core tool definitions ──────────────────────────────────────────────────

pub fn core_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::function(
            "read_file",
            "Read a UTF-8 text file from disk.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Absolute path to the file"}
                },
                "required": ["path"]
            }),
        ),
        ToolDefinition::function(
            "list_directory",
            "List the entries of a directory.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Absolute path to the directory"}
                },
                "required": ["path"]
            }),
        ),
        ToolDefinition::function(
            "memory_query",
            "Search long-term memory (facts and episodes) for a phrase.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Phrase to search for"},
                    "limit": {"type": "integer", "description": "Max results (default 10)"}
                },
                "required": ["query"]
            }),
        ),
        ToolDefinition::function(
            "current_time",
            "Get the current date and time (UTC and local).",
            json!({"type": "object", "properties": {}}),
        ),
    ]
}

pub fn is_core_tool(name: &str) -> bool {
    CORE_TOOL_NAMES.contains(&name)
}

// ── Registry ───────────────────────────────────────────────────────────────

pub struct ToolRegistry {
    mcp: Arc<McpManager>,
    /// Absent while the durable store is down; memory_query degrades.
    store: RwLock<Option<Arc<DurableStore>>>,
}

impl ToolRegistry {
    pub fn new(mcp: Arc<McpManager>) -> Self {
        ToolRegistry {
            mcp,
            store: RwLock::new(None),
        }
    }

    pub fn attach_store(&self, store: Arc<DurableStore>) {
        *self.store.write() = Some(store);
    }

    pub fn has_store(&self) -> bool {
        self.store.read().is_some()
    }

    /// Core tools plus the MCP tools of the chosen servers. With the store
    /// down, memory_query is silently removed (degraded mode).
    pub fn definitions_for(&self, target_servers: &[String]) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = core_definitions()
            .into_iter()
            .filter(|d| d.function.name != "memory_query" || self.has_store())
            .collect();
        defs.extend(self.mcp.tool_definitions_for(target_servers));
        defs
    }

    /// Everything: core plus all discovered MCP tools.
    pub fn all_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = core_definitions()
            .into_iter()
            .filter(|d| d.function.name != "memory_query" || self.has_store())
            .collect();
        defs.extend(self.mcp.all_tool_definitions());
        defs
    }

    /// Execute one tool call by name. Core tools run in-process without
    /// breaker involvement; `mcp__` addresses route through the manager.
    pub async fn execute(&self, name: &str, arguments: &str, request_id: Option<Uuid>) -> ToolOutcome {
        let args: Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(_) if arguments.trim().is_empty() => json!({}),
            Err(e) => return ToolOutcome::err(format!("Invalid tool arguments: {e}")),
        };

        if is_core_tool(name) {
            return self.execute_core(name, &args).await;
        }

        let servers = self.mcp.server_names();
        let known: Vec<&str> = servers.iter().map(|s| s.as_str()).collect();
        match parse_tool_address(name, known) {
            Some((server, tool)) => {
                match self
                    .mcp
                    .call_tool(server, tool, args, request_id, false)
                    .await
                {
                    Ok(output) => ToolOutcome::ok(output),
                    Err(e) => ToolOutcome::err(format!("Error: {e}")),
                }
            }
            None => ToolOutcome::err(format!("Unknown tool '{name}'")),
        }
    }

    // ── Core tool execution ────────────────────────────────────────────────

    async fn execute_core(&self, name: &str, args: &Value) -> ToolOutcome {
        info!("[tools] Core tool: {}", name);
        match name {
            "read_file" => read_file(args["path"].as_str().unwrap_or_default()).await,
            "list_directory" => list_directory(args["path"].as_str().unwrap_or_default()).await,
            "current_time" => {
                let utc = chrono::Utc::now();
                let local = chrono::Local::now();
                ToolOutcome::ok(format!(
                    "UTC: {}\nLocal: {}",
                    utc.to_rfc3339(),
                    local.to_rfc3339()
                ))
            }
            "memory_query" => {
                let query = args["query"].as_str().unwrap_or_default();
                let limit = args["limit"].as_u64().unwrap_or(10) as usize;
                match self.memory_query(query, limit) {
                    Ok(output) => ToolOutcome::ok(output),
                    Err(e) => ToolOutcome::err(format!("Error: {e}")),
                }
            }
            _ => ToolOutcome::err(format!("Unknown core tool '{name}'")),
        }
    }

    fn memory_query(&self, query: &str, limit: usize) -> GatewayResult<String> {
        let guard = self.store.read();
        let store = guard
            .as_ref()
            .ok_or_else(|| GatewayError::Degraded("memory store is offline".into()))?;
        let facts = store.query_facts(&format!("%{query}%"), limit)?;
        if facts.is_empty() {
            return Ok(format!("No stored memories match \"{query}\"."));
        }
        let lines: Vec<String> = facts
            .iter()
            .map(|f| format!("- [{}] {} (confidence {:.2})", f.subject, f.content, f.confidence))
            .collect();
        Ok(lines.join("\n"))
    }
}

// ── Filesystem core tools ──────────────────────────────────────────────────

fn path_is_sensitive(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    SENSITIVE_PATHS.iter().any(|s| lowered.contains(s))
}

async fn read_file(path: &str) -> ToolOutcome {
    if path.is_empty() {
        return ToolOutcome::err("read_file: missing 'path'");
    }
    if path_is_sensitive(path) {
        warn!("[tools] read_file blocked sensitive path: {}", path);
        return ToolOutcome::err(format!("read_file: access to '{path}' is not allowed"));
    }
    match tokio::fs::read_to_string(path).await {
        Ok(content) => ToolOutcome::ok(content),
        Err(e) => ToolOutcome::err(format!("read_file: {path}: {e}")),
    }
}

async fn list_directory(path: &str) -> ToolOutcome {
    if path.is_empty() {
        return ToolOutcome::err("list_directory: missing 'path'");
    }
    if path_is_sensitive(path) {
        warn!("[tools] list_directory blocked sensitive path: {}", path);
        return ToolOutcome::err(format!("list_directory: access to '{path}' is not allowed"));
    }
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(rd) => rd,
        Err(e) => return ToolOutcome::err(format!("list_directory: {path}: {e}")),
    };
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let kind = match entry.file_type().await {
            Ok(t) if t.is_dir() => "dir",
            Ok(_) => "file",
            Err(_) => "?",
        };
        names.push(format!("{} ({kind})", entry.file_name().to_string_lossy()));
    }
    names.sort();
    ToolOutcome::ok(names.join("\n"))
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::breaker::BreakerRegistry;
    use crate::engine::observability::Tracker;

    fn registry() -> ToolRegistry {
        let tracker = Arc::new(Tracker::new());
        let breakers = Arc::new(BreakerRegistry::new(Some(tracker.clone())));
        ToolRegistry::new(Arc::new(McpManager::new(breakers, tracker, None)))
    }

    #[test]
    fn core_names_match_definitions() {
        let defs = core_definitions();
        assert_eq!(defs.len(), CORE_TOOL_NAMES.len());
        for def in &defs {
            assert!(is_core_tool(&def.function.name));
        }
        assert!(!is_core_tool("mcp__fs__read_file"));
    }

    #[test]
    fn memory_query_hidden_without_store() {
        let reg = registry();
        let defs = reg.all_definitions();
        assert!(defs.iter().all(|d| d.function.name != "memory_query"));
        assert_eq!(defs.len(), CORE_TOOL_NAMES.len() - 1);
    }

    #[test]
    fn memory_query_visible_with_store() {
        let reg = registry();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::open(&dir.path().join("db")).unwrap());
        reg.attach_store(store);
        assert!(reg
            .all_definitions()
            .iter()
            .any(|d| d.function.name == "memory_query"));
    }

    #[tokio::test]
    async fn read_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        tokio::fs::write(&path, "hello").await.unwrap();
        let reg = registry();
        let outcome = reg
            .execute(
                "read_file",
                &json!({"path": path.to_str().unwrap()}).to_string(),
                None,
            )
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.output, "hello");
    }

    #[tokio::test]
    async fn sensitive_paths_are_blocked() {
        let reg = registry();
        let outcome = reg
            .execute("read_file", r#"{"path": "/home/user/.ssh/id_rsa"}"#, None)
            .await;
        assert!(!outcome.success);
        assert!(outcome.output.contains("not allowed"));
    }

    #[tokio::test]
    async fn list_directory_lists() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "x").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        let reg = registry();
        let outcome = reg
            .execute(
                "list_directory",
                &json!({"path": dir.path().to_str().unwrap()}).to_string(),
                None,
            )
            .await;
        assert!(outcome.success);
        assert!(outcome.output.contains("a.txt (file)"));
        assert!(outcome.output.contains("sub (dir)"));
    }

    #[tokio::test]
    async fn memory_query_searches_facts() {
        let reg = registry();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::open(&dir.path().join("db")).unwrap());
        store.put_fact("1", "deploy", "deploys happen on fridays", 0.8).unwrap();
        reg.attach_store(store);
        let outcome = reg
            .execute("memory_query", r#"{"query": "deploy"}"#, None)
            .await;
        assert!(outcome.success);
        assert!(outcome.output.contains("fridays"));
    }

    #[tokio::test]
    async fn unknown_tool_fails_cleanly() {
        let reg = registry();
        let outcome = reg.execute("definitely_not_real", "{}", None).await;
        assert!(!outcome.success);
        assert!(outcome.output.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn current_time_works() {
        let reg = registry();
        let outcome = reg.execute("current_time", "{}", None).await;
        assert!(outcome.success);
        assert!(outcome.output.contains("UTC:"));
    }
}
