// ── Waystation Engine: Lifecycle / Boot ────────────────────────────────────
//
// Ordered 8-phase boot. A phase failure past the store connect records a
// reason into `degraded_reasons` and proceeds — the gateway comes up unless
// phase 0/1 cannot even build in-memory structures. Shutdown walks the
// reverse order: drain ingress, cancel in-flight work, close transports,
// flush buffers.

use crate::atoms::constants::{
    OFFLINE_PROBE_TIMEOUT_SECS, OFFLINE_PROBE_URL, RECOVERY_PROBE_INTERVAL_SECS,
    STORE_CONNECT_ATTEMPTS,
};
use crate::atoms::error::GatewayResult;
use crate::engine::breaker::BreakerRegistry;
use crate::engine::config::ConfigStore;
use crate::engine::http::{backoff_delay, shared_client};
use crate::engine::maitre::learning::FeedbackJournal;
use crate::engine::maitre::Maitre;
use crate::engine::mcp::types::McpServerConfig;
use crate::engine::mcp::McpManager;
use crate::engine::observability::{HealthStatus, Tracker};
use crate::engine::providers::ProviderRegistry;
use crate::engine::scheduler::{Scheduler, TaskDef};
use crate::engine::state::{
    build_global_gate, model_cache_ttl, DailyTokenTracker, GatewayState, ModelCache, RuntimeFlags,
};
use crate::engine::store::DurableStore;
use crate::engine::tools::ToolRegistry;
use log::{info, warn};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

pub struct BootOptions {
    /// Directory holding `config/` (json files, mcp_manifests) — `.env`
    /// lives in its parent.
    pub config_dir: PathBuf,
    pub db_path: PathBuf,
    /// Spawn stdio MCP servers eagerly instead of on first use.
    pub pre_warm_mcp: bool,
}

impl BootOptions {
    pub fn from_state_dir(state_dir: &std::path::Path) -> Self {
        BootOptions {
            config_dir: state_dir.join("config"),
            db_path: state_dir.join("gateway.db"),
            pre_warm_mcp: false,
        }
    }
}

/// Run boot phases 0..7 and return the wired state. Phase 8 (open ingress)
/// belongs to the caller.
pub async fn boot(options: BootOptions) -> GatewayResult<Arc<GatewayState>> {
    let mut degraded: Vec<String> = Vec::new();

    // ── Phase 0: runtime validation ────────────────────────────────────────
    info!(
        "[boot] phase 0 — waystation {} starting",
        env!("CARGO_PKG_VERSION")
    );
    std::fs::create_dir_all(&options.config_dir)?;

    // ── Phase 1: in-memory state ───────────────────────────────────────────
    info!("[boot] phase 1 — state init");
    let tracker = Arc::new(Tracker::new());
    let breakers = Arc::new(BreakerRegistry::new(Some(Arc::clone(&tracker))));
    let config = Arc::new(ConfigStore::new(options.config_dir.clone()));
    config.load_env_overrides();

    // ── Phase 2: persistent store connect ──────────────────────────────────
    info!("[boot] phase 2 — durable store connect");
    let store = connect_store(&options.db_path).await;
    match &store {
        Some(store) => config.attach_store(Arc::clone(store)),
        None => {
            degraded.push("memory: durable store unreachable, config reads fall back to disk snapshot".into());
        }
    }

    // ── Phase 3: config reconciliation ─────────────────────────────────────
    info!("[boot] phase 3 — config sync");
    let report = config.sync_all();
    for error in &report.errors {
        degraded.push(format!("config: {error}"));
    }

    // ── Phase 4: provider registry ─────────────────────────────────────────
    info!("[boot] phase 4 — provider registry");
    let providers = Arc::new(ProviderRegistry::new(
        Arc::clone(&breakers),
        Arc::clone(&tracker),
    ));
    providers.load_from_config(&config);

    // ── Phase 5: MCP discovery (no eager stdio spawn unless pre-warm) ──────
    info!("[boot] phase 5 — MCP discovery");
    let spawn_concurrency = config
        .get("WAYSTATION_MCP_SPAWN_CONCURRENCY")
        .and_then(|v| v.parse().ok());
    let mcp = Arc::new(McpManager::new(
        Arc::clone(&breakers),
        Arc::clone(&tracker),
        spawn_concurrency,
    ));
    let server_configs = mcp_server_configs(&config, store.as_ref());
    for error in mcp.load_servers(server_configs).await {
        degraded.push(format!("mcp: {error}"));
    }
    for name in mcp.server_names() {
        tracker.set_component_health("mcp", &format!("mcp:{name}"), HealthStatus::Unknown, None, json!({}));
    }
    if options.pre_warm_mcp {
        mcp.refresh_all_tools(true).await;
    }

    let tools = Arc::new(ToolRegistry::new(Arc::clone(&mcp)));
    if let Some(store) = &store {
        tools.attach_store(Arc::clone(store));
    }
    let journal_path = options
        .config_dir
        .parent()
        .unwrap_or(&options.config_dir)
        .join("feedback.json");
    let maitre = Arc::new(Maitre::new(
        Arc::clone(&providers),
        Arc::clone(&config),
        FeedbackJournal::new(journal_path),
    ));

    // ── Phase 6: scheduler ─────────────────────────────────────────────────
    info!("[boot] phase 6 — scheduler");
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&breakers),
        Arc::clone(&tracker),
    ));

    let (shutdown_tx, _) = watch::channel(false);
    let state = Arc::new(GatewayState {
        global_gate: build_global_gate(&config),
        model_cache: ModelCache::new(model_cache_ttl(&config)),
        config: Arc::clone(&config),
        store: parking_lot::RwLock::new(store),
        tracker: Arc::clone(&tracker),
        breakers: Arc::clone(&breakers),
        mcp: Arc::clone(&mcp),
        providers: Arc::clone(&providers),
        maitre,
        tools,
        scheduler: Arc::clone(&scheduler),
        flags: RuntimeFlags::default(),
        budget: DailyTokenTracker::new(),
        degraded_reasons: parking_lot::Mutex::new(degraded),
        shutdown_tx,
        started_at: Instant::now(),
    });

    register_builtin_tasks(&state);
    tokio::spawn(Arc::clone(&scheduler).run(state.shutdown_signal()));

    // ── Phase 7: external health probes ────────────────────────────────────
    info!("[boot] phase 7 — external probes");
    probe_internet(&state).await;
    probe_native_engine(&state).await;

    let reasons = state.degraded_reasons.lock().clone();
    if reasons.is_empty() {
        info!("[boot] Boot complete — healthy");
    } else {
        warn!("[boot] Boot complete — degraded: {}", reasons.join("; "));
    }
    Ok(state)
}

/// Reverse-order shutdown with a bounded grace period for in-flight work.
pub async fn shutdown(state: &Arc<GatewayState>) {
    info!("[boot] Shutdown: draining ingress");
    let _ = state.shutdown_tx.send(true);
    // Grace for in-flight requests to observe the cancel signal
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    state.mcp.shutdown_all().await;
    state.tracker.take_system_snapshot();
    info!("[boot] Shutdown complete");
}

// ── Phase helpers ──────────────────────────────────────────────────────────

async fn connect_store(path: &std::path::Path) -> Option<Arc<DurableStore>> {
    for attempt in 0..STORE_CONNECT_ATTEMPTS {
        match DurableStore::open(path) {
            Ok(store) => return Some(Arc::new(store)),
            Err(e) => {
                warn!(
                    "[boot] Store connect attempt {}/{} failed: {}",
                    attempt + 1,
                    STORE_CONNECT_ATTEMPTS,
                    e
                );
                tokio::time::sleep(backoff_delay(attempt, None)).await;
            }
        }
    }
    None
}

/// Server configs come from `config/mcp_manifests/*.json` (tracked as
/// `mcp_manifest.<stem>` keys) with the database table as a fallback layer.
fn mcp_server_configs(config: &ConfigStore, store: Option<&Arc<DurableStore>>) -> Vec<McpServerConfig> {
    let mut configs: Vec<McpServerConfig> = Vec::new();
    let snapshot = config.snapshot();
    for (key, raw) in snapshot.iter() {
        if !key.starts_with("mcp_manifest.") {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Array(list)) => {
                for item in list {
                    if let Ok(parsed) = serde_json::from_value(item) {
                        configs.push(parsed);
                    }
                }
            }
            Ok(value) => {
                if let Some(servers) = value.get("servers").and_then(|s| s.as_array()) {
                    for item in servers {
                        if let Ok(parsed) = serde_json::from_value(item.clone()) {
                            configs.push(parsed);
                        }
                    }
                } else if let Ok(parsed) = serde_json::from_value(value) {
                    configs.push(parsed);
                }
            }
            Err(e) => warn!("[boot] Bad MCP manifest '{}': {}", key, e),
        }
    }

    // Database rows fill in servers the manifests don't name
    if let Some(store) = store {
        if let Ok(rows) = store.list_mcp_servers() {
            for (name, raw, enabled) in rows {
                if configs.iter().any(|c| c.name == name) {
                    continue;
                }
                if let Ok(mut parsed) = serde_json::from_str::<McpServerConfig>(&raw) {
                    parsed.enabled = enabled;
                    configs.push(parsed);
                }
            }
        }
    }
    configs
}

fn register_builtin_tasks(state: &Arc<GatewayState>) {
    // Health probe: refresh component-health entries
    {
        let state = Arc::clone(state);
        state.clone().scheduler.register(
            TaskDef {
                name: "health_probe".into(),
                interval_secs: 60,
                idle_only: false,
                priority: 0,
                expected_duration_secs: 5,
            },
            Arc::new(move || {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    probe_native_engine(&state).await;
                    state.tracker.take_system_snapshot();
                    Ok(())
                })
            }),
        );
    }

    // Internet probe: 5 min, 2s timeout against a fast external endpoint
    {
        let state = Arc::clone(state);
        state.clone().scheduler.register(
            TaskDef {
                name: "internet_probe".into(),
                interval_secs: 300,
                idle_only: false,
                priority: 0,
                expected_duration_secs: 3,
            },
            Arc::new(move || {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    probe_internet(&state).await;
                    Ok(())
                })
            }),
        );
    }

    // MCP breaker recovery probe
    {
        let state = Arc::clone(state);
        state.clone().scheduler.register(
            TaskDef {
                name: "mcp_recovery".into(),
                interval_secs: RECOVERY_PROBE_INTERVAL_SECS,
                idle_only: false,
                priority: 0,
                expected_duration_secs: 30,
            },
            Arc::new(move || {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    state.mcp.recovery_pass().await;
                    Ok(())
                })
            }),
        );
    }

    // Tool-discovery refresh: 12h, research tier
    {
        let state = Arc::clone(state);
        state.clone().scheduler.register(
            TaskDef {
                name: "tool_discovery_refresh".into(),
                interval_secs: 12 * 3600,
                idle_only: true,
                priority: 2,
                expected_duration_secs: 60,
            },
            Arc::new(move || {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    state.mcp.refresh_all_tools(true).await;
                    Ok(())
                })
            }),
        );
    }
}

/// 2-second probe against a fast external endpoint; flips
/// `internet_available`.
async fn probe_internet(state: &Arc<GatewayState>) {
    let url = state
        .config
        .get("WAYSTATION_OFFLINE_PROBE_URL")
        .unwrap_or_else(|| OFFLINE_PROBE_URL.to_string());
    let reachable = shared_client()
        .get(&url)
        .timeout(std::time::Duration::from_secs(OFFLINE_PROBE_TIMEOUT_SECS))
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false);
    let was = state.flags.internet_available.swap(reachable, Ordering::Relaxed);
    if was != reachable {
        warn!(
            "[boot] Internet availability changed: {} → {}",
            was, reachable
        );
    }
    state.tracker.set_component_health(
        "network",
        "internet",
        if reachable {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        },
        None,
        json!({"probe_url": url}),
    );
}

/// Reachability probe for the native local engine.
async fn probe_native_engine(state: &Arc<GatewayState>) {
    let started = Instant::now();
    let result = state.providers.list_models(&state.providers.native_name()).await;
    let elapsed = started.elapsed().as_millis() as u64;
    state.tracker.set_component_health(
        "provider",
        &format!("provider:{}", state.providers.native_name()),
        if result.is_ok() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        },
        Some(elapsed),
        json!({}),
    );
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn boot_is_degraded_not_dead_without_backends() {
        let dir = tempfile::tempdir().unwrap();
        let options = BootOptions {
            config_dir: dir.path().join("config"),
            db_path: dir.path().join("gateway.db"),
            pre_warm_mcp: false,
        };
        let state = boot(options).await.unwrap();
        // SQLite in a temp dir connects fine; no MCP servers, no providers
        // beyond the native default — still boots.
        assert!(state.providers.native().is_some());
        assert!(state.mcp.server_names().is_empty());
        shutdown(&state).await;
    }

    #[tokio::test]
    async fn manifest_parsing_accepts_three_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let manifests = dir.path().join("config/mcp_manifests");
        std::fs::create_dir_all(&manifests).unwrap();
        std::fs::write(
            manifests.join("single.json"),
            r#"{"name": "one", "transport": "http", "url": "http://localhost:9901/rpc"}"#,
        )
        .unwrap();
        std::fs::write(
            manifests.join("list.json"),
            r#"[{"name": "two", "command": "mcp-two"}]"#,
        )
        .unwrap();
        std::fs::write(
            manifests.join("wrapped.json"),
            r#"{"servers": [{"name": "three", "command": "mcp-three"}]}"#,
        )
        .unwrap();

        let config = ConfigStore::new(dir.path().join("config"));
        config.sync_all();
        let mut names: Vec<String> = mcp_server_configs(&config, None)
            .into_iter()
            .map(|c| c.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["one", "three", "two"]);
    }
}
