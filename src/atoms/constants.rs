// ── Waystation Atoms: Defaults ─────────────────────────────────────────────
// Every tunable has a documented default here; the config store and
// environment variables override them at boot.

/// Default gateway bind host.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default gateway bind port.
pub const DEFAULT_PORT: u16 = 8700;

/// Default total timeout for outbound HTTP calls (seconds).
pub const HTTP_TIMEOUT_SECS: u64 = 120;
/// Connect timeout for outbound HTTP calls (seconds).
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Maximum idle keep-alive connections per host in the shared pool.
pub const HTTP_MAX_IDLE_PER_HOST: usize = 20;
/// Idle keep-alive connection expiry (seconds).
pub const HTTP_IDLE_EXPIRY_SECS: u64 = 30;

/// Global request concurrency gate. 0 = unlimited.
pub const DEFAULT_MAX_CONCURRENCY: usize = 0;
/// Model-listing cache TTL (seconds).
pub const MODEL_CACHE_TTL_SECS: u64 = 600;

/// Breaker: consecutive failures before an MCP server trips open.
pub const MCP_BREAKER_THRESHOLD: u32 = 3;
/// Breaker: MCP cooldown after tripping (seconds).
pub const MCP_BREAKER_COOLDOWN_SECS: u64 = 300;
/// Breaker: consecutive failures before a provider trips open.
pub const PROVIDER_BREAKER_THRESHOLD: u32 = 5;
/// Breaker: provider cooldown after tripping (seconds).
pub const PROVIDER_BREAKER_COOLDOWN_SECS: u64 = 60;
/// Breaker: upper bound on the doubled cooldown (30 minutes).
pub const BREAKER_COOLDOWN_CAP_SECS: u64 = 1800;

/// Concurrent stdio MCP subprocess spawns admitted at once.
pub const MCP_SPAWN_CONCURRENCY: usize = 5;
/// Per-call MCP timeout (seconds), overridable per tool.
pub const MCP_CALL_TIMEOUT_SECS: u64 = 30;
/// Cap on a single tool call's output (bytes).
pub const MCP_OUTPUT_CAP_BYTES: usize = 50 * 1024 * 1024;
/// Transient-failure retries per MCP call before the breaker hears about it.
pub const MCP_CALL_RETRIES: u32 = 2;
/// Tool-discovery cache TTL (seconds).
pub const TOOL_DISCOVERY_TTL_SECS: u64 = 300;
/// Interval between breaker recovery probes (seconds).
pub const RECOVERY_PROBE_INTERVAL_SECS: u64 = 60;

/// Retry backoff base delay (milliseconds).
pub const RETRY_BASE_MS: u64 = 250;
/// Retry backoff cap (milliseconds).
pub const RETRY_CAP_MS: u64 = 4_000;

/// Agent loop: maximum tool-calling rounds.
pub const AGENT_MAX_STEPS: u32 = 20;
/// Agent loop: maximum wall time (seconds).
pub const AGENT_MAX_WALL_SECS: u64 = 120;
/// Agent loop: cumulative tool output budget (bytes).
pub const AGENT_MAX_TOOL_OUTPUT_BYTES: usize = 50 * 1024 * 1024;
/// Agent loop: tool calls executed in parallel per round.
pub const AGENT_PARALLEL_TOOL_CALLS: usize = 4;

/// Marker appended to tool output truncated at the size cap.
pub const TRUNCATION_MARKER: &str = "\n…[output truncated at size cap]";

/// Observability: bound on concurrently tracked active requests.
pub const MAX_ACTIVE_REQUESTS: usize = 1_000;
/// Observability: bound on retained completed requests.
pub const MAX_COMPLETED_REQUESTS: usize = 10_000;
/// Observability: bound on the operation-metrics ring.
pub const MAX_OPERATION_METRICS: usize = 50_000;
/// Observability: bound on the error-event ring.
pub const MAX_ERROR_EVENTS: usize = 1_000;
/// Observability: bound on the system-snapshot ring.
pub const MAX_SYSTEM_SNAPSHOTS: usize = 1_000;

/// Feedback journal: maximum retained entries.
pub const JOURNAL_MAX_ENTRIES: usize = 10_000;
/// Feedback journal: fraction of newest entries kept on overflow trim.
pub const JOURNAL_TRIM_KEEP_RATIO: f64 = 0.2;
/// Menu recall: minimum score for a past win to become a hint.
pub const RECALL_SCORE_THRESHOLD: f64 = 0.6;
/// Menu recall: age decay constant (days).
pub const RECALL_AGE_DECAY_DAYS: f64 = 3.0;
/// Classifier context: trailing messages shown to the maître d'.
pub const MAITRE_CONTEXT_MESSAGES: usize = 3;

/// Fast external endpoint for the internet probe.
pub const OFFLINE_PROBE_URL: &str = "https://one.one.one.one/cdn-cgi/trace";
/// Internet probe timeout (seconds).
pub const OFFLINE_PROBE_TIMEOUT_SECS: u64 = 2;

/// Durable store connect attempts at boot.
pub const STORE_CONNECT_ATTEMPTS: u32 = 5;

/// Stuck-request defaults (seconds).
pub const STUCK_OVERALL_TIMEOUT_SECS: u64 = 300;
pub const STUCK_STAGE_TIMEOUT_SECS: u64 = 60;
