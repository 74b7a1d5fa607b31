// ── Waystation Engine: Gateway State ───────────────────────────────────────
// Canonical home for the component wiring, the runtime flags, the daily
// token budget tracker, and the model-listing cache. Every mutable global of
// the system lives in exactly one component hanging off this struct.

use crate::atoms::constants::{DEFAULT_MAX_CONCURRENCY, MODEL_CACHE_TTL_SECS};
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::ModelInfo;
use crate::engine::agent_loop::AgentDeps;
use crate::engine::breaker::BreakerRegistry;
use crate::engine::config::ConfigStore;
use crate::engine::maitre::Maitre;
use crate::engine::mcp::McpManager;
use crate::engine::observability::Tracker;
use crate::engine::providers::ProviderRegistry;
use crate::engine::scheduler::Scheduler;
use crate::engine::store::DurableStore;
use crate::engine::tools::ToolRegistry;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};

// ── Runtime flags ──────────────────────────────────────────────────────────

pub struct RuntimeFlags {
    /// Cleared by the internet probe when the outside world is unreachable.
    pub internet_available: AtomicBool,
    /// "async" acceptance mode for non-streaming requests.
    pub async_mode: AtomicBool,
    /// Operator-selected default model (admin get/set).
    pub active_model: Mutex<String>,
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        RuntimeFlags {
            internet_available: AtomicBool::new(true),
            async_mode: AtomicBool::new(false),
            active_model: Mutex::new(String::new()),
        }
    }
}

// ── Daily token budget ─────────────────────────────────────────────────────

/// Cumulative per-UTC-day token and cost tracking. All counters are atomic
/// so the tracker is shared across tasks cheaply; the day rolls over lazily.
pub struct DailyTokenTracker {
    date: Mutex<String>,
    pub input_tokens: AtomicU64,
    pub output_tokens: AtomicU64,
    /// Accumulated USD cost, stored as micro-dollars for atomic ops.
    cost_microdollars: AtomicU64,
}

impl Default for DailyTokenTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DailyTokenTracker {
    pub fn new() -> Self {
        DailyTokenTracker {
            date: Mutex::new(today()),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            cost_microdollars: AtomicU64::new(0),
        }
    }

    fn maybe_reset(&self) {
        let today = today();
        let mut date = self.date.lock();
        if *date != today {
            *date = today;
            self.input_tokens.store(0, Ordering::Relaxed);
            self.output_tokens.store(0, Ordering::Relaxed);
            self.cost_microdollars.store(0, Ordering::Relaxed);
        }
    }

    /// Record a completed round with its computed cost.
    pub fn record(&self, input: u64, output: u64, cost_usd: f64) {
        self.maybe_reset();
        self.input_tokens.fetch_add(input, Ordering::Relaxed);
        self.output_tokens.fetch_add(output, Ordering::Relaxed);
        self.cost_microdollars
            .fetch_add((cost_usd * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    /// (input_tokens, output_tokens, estimated_usd) for today.
    pub fn spend(&self) -> (u64, u64, f64) {
        self.maybe_reset();
        (
            self.input_tokens.load(Ordering::Relaxed),
            self.output_tokens.load(Ordering::Relaxed),
            self.cost_microdollars.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        )
    }
}

fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

/// Per-model pricing from config: `pricing.<model>.input_per_mtok` and
/// `.output_per_mtok` (USD per million tokens). Unknown models cost zero,
/// which keeps the budget gate inert until a pricing table is configured.
pub fn estimate_cost_usd(config: &ConfigStore, model: &str, input: u64, output: u64) -> f64 {
    let price = |field: &str| -> f64 {
        config
            .get(&format!("pricing.{model}.{field}"))
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0)
    };
    (input as f64 / 1e6) * price("input_per_mtok") + (output as f64 / 1e6) * price("output_per_mtok")
}

// ── Model-listing cache ────────────────────────────────────────────────────

pub struct ModelCache {
    entry: tokio::sync::Mutex<Option<(Instant, Vec<ModelInfo>)>>,
    ttl_secs: u64,
}

impl ModelCache {
    pub fn new(ttl_secs: u64) -> Self {
        ModelCache {
            entry: tokio::sync::Mutex::new(None),
            ttl_secs,
        }
    }

    /// Lock-free-ish read: cheap check without recomputing.
    pub async fn get(&self) -> Option<Vec<ModelInfo>> {
        let guard = self.entry.lock().await;
        guard.as_ref().and_then(|(at, models)| {
            (at.elapsed().as_secs() < self.ttl_secs).then(|| models.clone())
        })
    }

    pub async fn put(&self, models: Vec<ModelInfo>) {
        *self.entry.lock().await = Some((Instant::now(), models));
    }

    pub async fn clear(&self) {
        *self.entry.lock().await = None;
    }
}

// ── Gateway state ──────────────────────────────────────────────────────────

pub struct GatewayState {
    pub config: Arc<ConfigStore>,
    pub store: RwLock<Option<Arc<DurableStore>>>,
    pub tracker: Arc<Tracker>,
    pub breakers: Arc<BreakerRegistry>,
    pub mcp: Arc<McpManager>,
    pub providers: Arc<ProviderRegistry>,
    pub maitre: Arc<Maitre>,
    pub tools: Arc<ToolRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub flags: RuntimeFlags,
    pub budget: DailyTokenTracker,
    pub model_cache: ModelCache,
    /// Global concurrency gate wrapping every dispatch branch; None when the
    /// configured bound is 0 (unlimited).
    pub global_gate: Option<Arc<Semaphore>>,
    pub degraded_reasons: Mutex<Vec<String>>,
    pub shutdown_tx: watch::Sender<bool>,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn agent_deps(&self) -> AgentDeps {
        AgentDeps {
            providers: Arc::clone(&self.providers),
            maitre: Arc::clone(&self.maitre),
            tools: Arc::clone(&self.tools),
            mcp: Arc::clone(&self.mcp),
            tracker: Arc::clone(&self.tracker),
            config: Arc::clone(&self.config),
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn degrade(&self, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("[state] Degraded: {}", reason);
        self.degraded_reasons.lock().push(reason);
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded_reasons.lock().is_empty()
    }

    /// Gateway auth token, when one is configured.
    pub fn auth_token(&self) -> Option<String> {
        self.config
            .get("WAYSTATION_AUTH_TOKEN")
            .or_else(|| self.config.get("auth_token"))
            .filter(|t| !t.is_empty())
    }

    /// Optional budget pre-check at the dispatch gate. With no pricing table
    /// configured the projected cost is zero and the check never trips.
    pub fn check_budget(&self, model: &str, max_tokens: Option<u64>) -> GatewayResult<()> {
        let daily_cap: f64 = self
            .config
            .get("daily_budget_usd")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        if daily_cap <= 0.0 {
            return Ok(());
        }
        // Conservative projection: a typical prompt plus the full completion
        let projected = estimate_cost_usd(&self.config, model, 2_000, max_tokens.unwrap_or(1_000));
        let (_, _, spent) = self.budget.spend();
        if projected + spent > daily_cap {
            return Err(GatewayError::ResourceExhausted(format!(
                "daily budget exceeded (${spent:.2} spent of ${daily_cap:.2})"
            )));
        }
        Ok(())
    }

    /// Record a round's usage against the budget.
    pub fn record_usage(&self, model: &str, input: u64, output: u64) {
        let cost = estimate_cost_usd(&self.config, model, input, output);
        self.budget.record(input, output, cost);
    }
}

/// Build the global gate from config; 0 means unlimited.
pub fn build_global_gate(config: &ConfigStore) -> Option<Arc<Semaphore>> {
    let bound = config
        .get("WAYSTATION_MAX_CONCURRENCY")
        .or_else(|| config.get("max_concurrency"))
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_CONCURRENCY);
    (bound > 0).then(|| Arc::new(Semaphore::new(bound)))
}

/// Model-cache TTL from config with the documented default.
pub fn model_cache_ttl(config: &ConfigStore) -> u64 {
    config
        .get("WAYSTATION_MODEL_CACHE_TTL_SECS")
        .or_else(|| config.get("model_cache_ttl_secs"))
        .and_then(|v| v.parse().ok())
        .unwrap_or(MODEL_CACHE_TTL_SECS)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_accumulates_and_reports() {
        let tracker = DailyTokenTracker::new();
        tracker.record(100, 50, 0.25);
        tracker.record(10, 5, 0.05);
        let (input, output, usd) = tracker.spend();
        assert_eq!(input, 110);
        assert_eq!(output, 55);
        assert!((usd - 0.30).abs() < 1e-6);
    }

    #[test]
    fn pricing_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigStore::new(dir.path().join("config"));
        assert_eq!(estimate_cost_usd(&config, "mystery", 1_000_000, 1_000_000), 0.0);

        config.set("pricing.gpt-x.input_per_mtok", "2.5").unwrap();
        config.set("pricing.gpt-x.output_per_mtok", "10").unwrap();
        let cost = estimate_cost_usd(&config, "gpt-x", 1_000_000, 500_000);
        assert!((cost - 7.5).abs() < 1e-9);
    }

    #[test]
    fn global_gate_zero_is_unlimited() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigStore::new(dir.path().join("config"));
        assert!(build_global_gate(&config).is_none());
        config.set("max_concurrency", "2").unwrap();
        let gate = build_global_gate(&config).unwrap();
        assert_eq!(gate.available_permits(), 2);
    }

    #[tokio::test]
    async fn model_cache_expires() {
        let cache = ModelCache::new(0); // everything is instantly stale
        cache
            .put(vec![ModelInfo {
                id: "m".into(),
                object: "model".into(),
                created: 0,
                owned_by: "t".into(),
            }])
            .await;
        assert!(cache.get().await.is_none());

        let cache = ModelCache::new(600);
        cache.put(vec![]).await;
        assert!(cache.get().await.is_some());
        cache.clear().await;
        assert!(cache.get().await.is_none());
    }
}
