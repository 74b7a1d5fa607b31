// ── Waystation Engine: Request Lifecycle Tracker ───────────────────────────
//
// Per-request stage state machine plus bounded metric rings. Every plane
// writes stage transitions here; nothing here may block or fail the request
// path — tracker I/O errors are swallowed and counted.
//
// Bounds:
//   • active requests ≤ 1,000 (oldest-by-start evicted with a warning)
//   • completed FIFO ≤ 10,000
//   • operation metrics ring ≤ 50,000
//   • error ring ≤ 1,000
//   • system snapshot ring ≤ 1,000

use crate::atoms::constants::{
    MAX_ACTIVE_REQUESTS, MAX_COMPLETED_REQUESTS, MAX_ERROR_EVENTS, MAX_OPERATION_METRICS,
    MAX_SYSTEM_SNAPSHOTS,
};
use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

// ── Stage state machine ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStage {
    Received,
    AuthChecked,
    Parsed,
    RoutingDecided,
    UpstreamCallStart,
    UpstreamCallEnd,
    Processing,
    ResponseSent,
    Completed,
    Error,
    Timeout,
}

impl RequestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStage::Received => "RECEIVED",
            RequestStage::AuthChecked => "AUTH_CHECKED",
            RequestStage::Parsed => "PARSED",
            RequestStage::RoutingDecided => "ROUTING_DECIDED",
            RequestStage::UpstreamCallStart => "UPSTREAM_CALL_START",
            RequestStage::UpstreamCallEnd => "UPSTREAM_CALL_END",
            RequestStage::Processing => "PROCESSING",
            RequestStage::ResponseSent => "RESPONSE_SENT",
            RequestStage::Completed => "COMPLETED",
            RequestStage::Error => "ERROR",
            RequestStage::Timeout => "TIMEOUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStage::Completed | RequestStage::Error | RequestStage::Timeout
        )
    }

    /// Position in the forward chain; terminal stages have none.
    fn order(&self) -> Option<u8> {
        match self {
            RequestStage::Received => Some(0),
            RequestStage::AuthChecked => Some(1),
            RequestStage::Parsed => Some(2),
            RequestStage::RoutingDecided => Some(3),
            RequestStage::UpstreamCallStart => Some(4),
            RequestStage::UpstreamCallEnd => Some(5),
            RequestStage::Processing => Some(6),
            RequestStage::ResponseSent => Some(7),
            RequestStage::Completed => Some(8),
            RequestStage::Error | RequestStage::Timeout => None,
        }
    }
}

// ── Records ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStamp {
    pub stage: RequestStage,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationMetric {
    pub component: String,
    pub operation: String,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ok: bool,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: Uuid,
    pub method: String,
    pub path: String,
    pub client_id: String,
    pub started_at: DateTime<Utc>,
    pub current_stage: RequestStage,
    pub stages: Vec<StageStamp>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub operations: Vec<OperationMetric>,
    pub final_status: Option<String>,
    pub final_error: Option<String>,
}

impl RequestRecord {
    fn new(request_id: Uuid, method: &str, path: &str, client_id: &str) -> Self {
        let now = Utc::now();
        RequestRecord {
            request_id,
            method: method.to_string(),
            path: path.to_string(),
            client_id: client_id.to_string(),
            started_at: now,
            current_stage: RequestStage::Received,
            stages: vec![StageStamp {
                stage: RequestStage::Received,
                at: now,
            }],
            metadata: Map::new(),
            operations: Vec::new(),
            final_status: None,
            final_error: None,
        }
    }

    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.stages.last().map(|s| s.at).unwrap_or(self.started_at)
    }

    pub fn age_seconds(&self) -> f64 {
        (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub at: DateTime<Utc>,
    pub component: String,
    pub message: String,
    pub request_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component_type: String,
    pub component_id: String,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    pub response_time_ms: Option<u64>,
    pub success_count: u64,
    pub error_count: u64,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub at: DateTime<Utc>,
    pub active_requests: usize,
    pub completed_requests: usize,
    pub error_events: usize,
    pub evicted_requests: u64,
}

/// A request flagged by the stuck scan.
#[derive(Debug, Clone, Serialize)]
pub struct StuckRequest {
    pub request_id: Uuid,
    pub path: String,
    pub current_stage: RequestStage,
    pub age_seconds: f64,
    pub seconds_since_last_transition: f64,
}

/// Aggregated latency summary for one (component, operation) pair.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSummary {
    pub component: String,
    pub operation: String,
    pub count: usize,
    pub error_count: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

// ── Tracker ────────────────────────────────────────────────────────────────

pub struct Tracker {
    active: Mutex<HashMap<Uuid, RequestRecord>>,
    completed: Mutex<VecDeque<RequestRecord>>,
    operations: Mutex<VecDeque<OperationMetric>>,
    errors: Mutex<VecDeque<ErrorEvent>>,
    snapshots: Mutex<VecDeque<SystemSnapshot>>,
    health: Mutex<HashMap<String, ComponentHealth>>,
    evicted: AtomicU64,
    rejected_transitions: AtomicU64,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    pub fn new() -> Self {
        Tracker {
            active: Mutex::new(HashMap::new()),
            completed: Mutex::new(VecDeque::new()),
            operations: Mutex::new(VecDeque::new()),
            errors: Mutex::new(VecDeque::new()),
            snapshots: Mutex::new(VecDeque::new()),
            health: Mutex::new(HashMap::new()),
            evicted: AtomicU64::new(0),
            rejected_transitions: AtomicU64::new(0),
        }
    }

    // ── Request lifecycle ──────────────────────────────────────────────────

    /// Register an accepted request at stage RECEIVED. Evicts the
    /// oldest-by-start active record when the bound is hit.
    pub fn begin_request(&self, request_id: Uuid, method: &str, path: &str, client_id: &str) {
        let record = RequestRecord::new(request_id, method, path, client_id);
        let evicted = {
            let mut active = self.active.lock();
            let evicted = if active.len() >= MAX_ACTIVE_REQUESTS {
                active
                    .values()
                    .min_by_key(|r| r.started_at)
                    .map(|r| r.request_id)
                    .and_then(|id| active.remove(&id))
            } else {
                None
            };
            active.insert(request_id, record);
            evicted
        };
        if let Some(mut old) = evicted {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            warn!(
                "[tracker] Active-request bound hit — evicting oldest request {} ({})",
                old.request_id, old.path
            );
            old.final_status = Some("evicted".into());
            self.record_error("tracker", "active request evicted at capacity", Some(old.request_id));
            self.push_completed(old);
        }
    }

    /// Apply a stage transition. Idempotent on the same stage; backward
    /// transitions are rejected; terminal stages move the record to the
    /// completed FIFO. Returns whether the transition was applied.
    pub fn advance(&self, request_id: Uuid, stage: RequestStage) -> bool {
        let finished = {
            let mut active = self.active.lock();
            let Some(record) = active.get_mut(&request_id) else {
                return false;
            };
            if record.current_stage == stage {
                return true; // idempotent
            }
            let allowed = match (record.current_stage.order(), stage.order()) {
                // Forward-only within the chain
                (Some(from), Some(to)) => to > from,
                // Terminal reachable from any non-terminal stage
                (Some(_), None) => true,
                // Nothing leaves a terminal stage
                (None, _) => false,
            };
            if !allowed {
                self.rejected_transitions.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "[tracker] Rejected transition {} → {} for {}",
                    record.current_stage.as_str(),
                    stage.as_str(),
                    request_id
                );
                return false;
            }
            record.current_stage = stage;
            record.stages.push(StageStamp {
                stage,
                at: Utc::now(),
            });
            if stage.is_terminal() {
                if record.final_status.is_none() {
                    record.final_status = Some(stage.as_str().to_lowercase());
                }
                active.remove(&request_id)
            } else {
                None
            }
        };
        if let Some(record) = finished {
            self.push_completed(record);
        }
        true
    }

    /// Terminal ERROR with an error message attached.
    pub fn fail(&self, request_id: Uuid, kind: &str, message: &str) {
        {
            let mut active = self.active.lock();
            if let Some(record) = active.get_mut(&request_id) {
                record.final_status = Some(kind.to_string());
                record.final_error = Some(message.to_string());
            }
        }
        self.advance(request_id, RequestStage::Error);
    }

    /// Attach metadata to a live request (no-op after completion).
    pub fn annotate(&self, request_id: Uuid, key: &str, value: Value) {
        let mut active = self.active.lock();
        if let Some(record) = active.get_mut(&request_id) {
            record.metadata.insert(key.to_string(), value);
        }
    }

    /// Append an operation metric to both the live request and the global ring.
    pub fn record_operation(&self, request_id: Option<Uuid>, metric: OperationMetric) {
        if let Some(id) = request_id {
            let mut active = self.active.lock();
            if let Some(record) = active.get_mut(&id) {
                record.operations.push(metric.clone());
            }
        }
        self.bump_health(&metric);
        let mut ops = self.operations.lock();
        if ops.len() >= MAX_OPERATION_METRICS {
            ops.pop_front();
        }
        ops.push_back(metric);
    }

    pub fn record_error(&self, component: &str, message: &str, request_id: Option<Uuid>) {
        let mut errors = self.errors.lock();
        if errors.len() >= MAX_ERROR_EVENTS {
            errors.pop_front();
        }
        errors.push_back(ErrorEvent {
            at: Utc::now(),
            component: component.to_string(),
            message: message.to_string(),
            request_id,
        });
    }

    /// Breaker lifecycle event (called by the breaker registry on every
    /// transition).
    pub fn breaker_transition(&self, key: &str, from: &str, to: &str, reason: Option<&str>) {
        self.record_operation(
            None,
            OperationMetric {
                component: "breaker".into(),
                operation: "transition".into(),
                duration_ms: 0,
                started_at: Utc::now(),
                ok: to == "closed",
                metadata: json!({"key": key, "from": from, "to": to, "reason": reason}),
            },
        );
        if to == "open" {
            self.record_error(
                "breaker",
                &format!("'{key}' opened ({})", reason.unwrap_or("unknown")),
                None,
            );
        }
    }

    // ── Component health ───────────────────────────────────────────────────

    pub fn set_component_health(
        &self,
        component_type: &str,
        component_id: &str,
        status: HealthStatus,
        response_time_ms: Option<u64>,
        metadata: Value,
    ) {
        let mut health = self.health.lock();
        let entry = health
            .entry(component_id.to_string())
            .or_insert_with(|| ComponentHealth {
                component_type: component_type.to_string(),
                component_id: component_id.to_string(),
                status,
                last_check: Utc::now(),
                response_time_ms,
                success_count: 0,
                error_count: 0,
                metadata: Value::Null,
            });
        entry.status = status;
        entry.last_check = Utc::now();
        entry.response_time_ms = response_time_ms;
        entry.metadata = metadata;
    }

    /// Inline operation outcomes also feed health counters.
    fn bump_health(&self, metric: &OperationMetric) {
        let mut health = self.health.lock();
        if let Some(entry) = health.get_mut(&metric.component) {
            if metric.ok {
                entry.success_count += 1;
            } else {
                entry.error_count += 1;
            }
        }
    }

    pub fn component_health(&self) -> Vec<ComponentHealth> {
        let mut list: Vec<ComponentHealth> = self.health.lock().values().cloned().collect();
        list.sort_by(|a, b| a.component_id.cmp(&b.component_id));
        list
    }

    // ── Queries ────────────────────────────────────────────────────────────

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn active_snapshot(&self) -> Vec<RequestRecord> {
        let mut list: Vec<RequestRecord> = self.active.lock().values().cloned().collect();
        list.sort_by_key(|r| r.started_at);
        list
    }

    pub fn completed_snapshot(&self, limit: usize) -> Vec<RequestRecord> {
        let completed = self.completed.lock();
        completed.iter().rev().take(limit).cloned().collect()
    }

    pub fn find_request(&self, request_id: Uuid) -> Option<RequestRecord> {
        if let Some(r) = self.active.lock().get(&request_id) {
            return Some(r.clone());
        }
        self.completed
            .lock()
            .iter()
            .rev()
            .find(|r| r.request_id == request_id)
            .cloned()
    }

    /// On-demand stuck scan over active requests only — sub-linear in the
    /// completed count by construction.
    pub fn stuck_requests(&self, overall_timeout_secs: u64, stage_timeout_secs: u64) -> Vec<StuckRequest> {
        let now = Utc::now();
        self.active
            .lock()
            .values()
            .filter_map(|record| {
                let age = (now - record.started_at).num_milliseconds() as f64 / 1000.0;
                let since_last =
                    (now - record.last_transition_at()).num_milliseconds() as f64 / 1000.0;
                if age > overall_timeout_secs as f64 || since_last > stage_timeout_secs as f64 {
                    Some(StuckRequest {
                        request_id: record.request_id,
                        path: record.path.clone(),
                        current_stage: record.current_stage,
                        age_seconds: age,
                        seconds_since_last_transition: since_last,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Aggregate the operation ring into per-(component, operation) summaries.
    pub fn operation_summaries(&self) -> Vec<OperationSummary> {
        let ops = self.operations.lock();
        let mut grouped: HashMap<(String, String), Vec<&OperationMetric>> = HashMap::new();
        for op in ops.iter() {
            grouped
                .entry((op.component.clone(), op.operation.clone()))
                .or_default()
                .push(op);
        }
        let mut summaries: Vec<OperationSummary> = grouped
            .into_iter()
            .map(|((component, operation), metrics)| {
                let mut durations: Vec<u64> = metrics.iter().map(|m| m.duration_ms).collect();
                durations.sort_unstable();
                let count = durations.len();
                let sum: u64 = durations.iter().sum();
                OperationSummary {
                    component,
                    operation,
                    count,
                    error_count: metrics.iter().filter(|m| !m.ok).count(),
                    min_ms: *durations.first().unwrap_or(&0),
                    max_ms: *durations.last().unwrap_or(&0),
                    avg_ms: if count > 0 { sum as f64 / count as f64 } else { 0.0 },
                    p50_ms: percentile(&durations, 0.50),
                    p95_ms: percentile(&durations, 0.95),
                    p99_ms: percentile(&durations, 0.99),
                }
            })
            .collect();
        summaries.sort_by(|a, b| (&a.component, &a.operation).cmp(&(&b.component, &b.operation)));
        summaries
    }

    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorEvent> {
        self.errors.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Capture a system snapshot into the bounded ring.
    pub fn take_system_snapshot(&self) {
        let snapshot = SystemSnapshot {
            at: Utc::now(),
            active_requests: self.active.lock().len(),
            completed_requests: self.completed.lock().len(),
            error_events: self.errors.lock().len(),
            evicted_requests: self.evicted.load(Ordering::Relaxed),
        };
        let mut snapshots = self.snapshots.lock();
        if snapshots.len() >= MAX_SYSTEM_SNAPSHOTS {
            snapshots.pop_front();
        }
        snapshots.push_back(snapshot);
    }

    /// Single JSON document with everything the observability surface knows.
    pub fn export(&self) -> Value {
        json!({
            "active": self.active_snapshot(),
            "completed": self.completed_snapshot(MAX_COMPLETED_REQUESTS),
            "operations": self.operation_summaries(),
            "errors": self.recent_errors(MAX_ERROR_EVENTS),
            "snapshots": self.snapshots.lock().clone(),
            "component_health": self.component_health(),
            "evicted_requests": self.evicted.load(Ordering::Relaxed),
            "rejected_transitions": self.rejected_transitions.load(Ordering::Relaxed),
        })
    }

    fn push_completed(&self, record: RequestRecord) {
        let mut completed = self.completed.lock();
        if completed.len() >= MAX_COMPLETED_REQUESTS {
            completed.pop_front();
        }
        completed.push_back(record);
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::ids::new_request_id;

    fn begin(tracker: &Tracker) -> Uuid {
        let id = new_request_id();
        tracker.begin_request(id, "POST", "/v1/chat/completions", "test");
        id
    }

    #[test]
    fn forward_transitions_are_ordered() {
        let tracker = Tracker::new();
        let id = begin(&tracker);
        assert!(tracker.advance(id, RequestStage::AuthChecked));
        assert!(tracker.advance(id, RequestStage::Parsed));
        // Idempotent on the same stage
        assert!(tracker.advance(id, RequestStage::Parsed));
        // Backward rejected
        assert!(!tracker.advance(id, RequestStage::AuthChecked));
        assert!(tracker.advance(id, RequestStage::RoutingDecided));
    }

    #[test]
    fn terminal_from_any_stage_and_only_once() {
        let tracker = Tracker::new();
        let id = begin(&tracker);
        assert!(tracker.advance(id, RequestStage::Error));
        // Record moved to completed — nothing leaves a terminal state
        assert!(!tracker.advance(id, RequestStage::Completed));
        let completed = tracker.completed_snapshot(10);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].current_stage, RequestStage::Error);
    }

    #[test]
    fn timestamps_monotone_along_chain() {
        let tracker = Tracker::new();
        let id = begin(&tracker);
        for stage in [
            RequestStage::AuthChecked,
            RequestStage::Parsed,
            RequestStage::RoutingDecided,
            RequestStage::UpstreamCallStart,
            RequestStage::UpstreamCallEnd,
            RequestStage::Processing,
            RequestStage::ResponseSent,
            RequestStage::Completed,
        ] {
            assert!(tracker.advance(id, stage));
        }
        let record = &tracker.completed_snapshot(1)[0];
        assert_eq!(record.stages.len(), 9);
        for pair in record.stages.windows(2) {
            assert!(pair[1].at >= pair[0].at);
        }
    }

    #[test]
    fn cancelled_right_after_received_still_terminates() {
        let tracker = Tracker::new();
        let id = begin(&tracker);
        tracker.fail(id, "cancelled", "client went away");
        let record = &tracker.completed_snapshot(1)[0];
        assert_eq!(record.final_status.as_deref(), Some("cancelled"));
        assert!(record.age_seconds() >= 0.0);
    }

    #[test]
    fn export_roundtrips_completed_record() {
        let tracker = Tracker::new();
        let id = begin(&tracker);
        tracker.annotate(id, "offline_rewrite", json!(true));
        tracker.record_operation(
            Some(id),
            OperationMetric {
                component: "mcp:fs".into(),
                operation: "tools/call".into(),
                duration_ms: 12,
                started_at: Utc::now(),
                ok: true,
                metadata: Value::Null,
            },
        );
        tracker.advance(id, RequestStage::Completed);

        let exported = tracker.export();
        let parsed: Vec<RequestRecord> =
            serde_json::from_value(exported["completed"].clone()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].request_id, id);
        assert_eq!(parsed[0].operations.len(), 1);
        assert_eq!(parsed[0].metadata["offline_rewrite"], json!(true));
        assert_eq!(parsed[0].stages.len(), 2);
    }

    #[test]
    fn active_bound_evicts_oldest() {
        let tracker = Tracker::new();
        let first = begin(&tracker);
        for _ in 0..MAX_ACTIVE_REQUESTS {
            begin(&tracker);
        }
        assert_eq!(tracker.active_count(), MAX_ACTIVE_REQUESTS);
        // The very first request (oldest) was evicted into completed
        let completed = tracker.completed_snapshot(10);
        assert!(completed.iter().any(|r| r.request_id == first));
        assert_eq!(completed[0].final_status.as_deref(), Some("evicted"));
        assert!(!tracker.recent_errors(10).is_empty());
    }

    #[test]
    fn stuck_scan_flags_stalled_stage() {
        let tracker = Tracker::new();
        let id = begin(&tracker);
        tracker.advance(id, RequestStage::UpstreamCallStart);
        // 0-second thresholds flag everything active
        let stuck = tracker.stuck_requests(0, 0);
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].current_stage, RequestStage::UpstreamCallStart);

        // Completed requests never show up
        tracker.advance(id, RequestStage::Completed);
        assert!(tracker.stuck_requests(0, 0).is_empty());
    }

    #[test]
    fn percentiles_nearest_rank() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 0.50), 50);
        assert_eq!(percentile(&sorted, 0.95), 95);
        assert_eq!(percentile(&sorted, 0.99), 99);
        assert_eq!(percentile(&[], 0.5), 0);
        assert_eq!(percentile(&[7], 0.99), 7);
    }

    #[test]
    fn operation_summaries_aggregate() {
        let tracker = Tracker::new();
        for (ms, ok) in [(10, true), (20, true), (30, false)] {
            tracker.record_operation(
                None,
                OperationMetric {
                    component: "provider:openai".into(),
                    operation: "chat".into(),
                    duration_ms: ms,
                    started_at: Utc::now(),
                    ok,
                    metadata: Value::Null,
                },
            );
        }
        let summaries = tracker.operation_summaries();
        assert_eq!(summaries.len(), 1);
        let s = &summaries[0];
        assert_eq!(s.count, 3);
        assert_eq!(s.error_count, 1);
        assert_eq!(s.min_ms, 10);
        assert_eq!(s.max_ms, 30);
        assert!((s.avg_ms - 20.0).abs() < f64::EPSILON);
    }
}
