// ── Waystation Engine: Background Scheduler ────────────────────────────────
//
// Periodic tasks gated by Tempo — how long the operator has been idle:
//   FOCUSED    (<60s)   only essential tasks
//   ALERT      (<5min)  everything but heavy tiers
//   REFLECTIVE (<30min) research-weight tasks permitted
//   DEEP       (≥30min) consolidation / reindex tiers permitted
//
// The scheduler ticks at 1s. Every execution runs behind a `task:<name>`
// breaker so a repeatedly failing task stops running itself.

use crate::atoms::error::GatewayResult;
use crate::atoms::ids::epoch_secs;
use crate::engine::breaker::{BreakerPolicy, BreakerRegistry};
use crate::engine::observability::{OperationMetric, Tracker};
use chrono::Utc;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

// ── Tempo ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tempo {
    Focused,
    Alert,
    Reflective,
    Deep,
}

impl Tempo {
    pub fn from_idle_secs(idle_secs: u64) -> Self {
        match idle_secs {
            0..=59 => Tempo::Focused,
            60..=299 => Tempo::Alert,
            300..=1799 => Tempo::Reflective,
            _ => Tempo::Deep,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tempo::Focused => "FOCUSED",
            Tempo::Alert => "ALERT",
            Tempo::Reflective => "REFLECTIVE",
            Tempo::Deep => "DEEP",
        }
    }

    /// Highest task priority tier this tempo admits.
    fn max_priority(&self) -> u8 {
        match self {
            Tempo::Focused => 0,
            Tempo::Alert => 1,
            Tempo::Reflective => 2,
            Tempo::Deep => u8::MAX,
        }
    }
}

// ── Task registration ──────────────────────────────────────────────────────

/// Priority tiers: 0 essential, 1 normal, 2 research-weight, 3 heavy.
#[derive(Debug, Clone)]
pub struct TaskDef {
    pub name: String,
    pub interval_secs: u64,
    pub idle_only: bool,
    pub priority: u8,
    pub expected_duration_secs: u64,
}

pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, GatewayResult<()>> + Send + Sync>;

struct ScheduledTask {
    def: TaskDef,
    func: TaskFn,
    last_run: Option<Instant>,
    running: Arc<AtomicBool>,
}

// ── Scheduler ──────────────────────────────────────────────────────────────

pub struct Scheduler {
    tasks: Mutex<Vec<ScheduledTask>>,
    /// Epoch seconds of the last user request.
    last_user_input: AtomicU64,
    breakers: Arc<BreakerRegistry>,
    tracker: Arc<Tracker>,
}

impl Scheduler {
    pub fn new(breakers: Arc<BreakerRegistry>, tracker: Arc<Tracker>) -> Self {
        Scheduler {
            tasks: Mutex::new(Vec::new()),
            last_user_input: AtomicU64::new(epoch_secs()),
            breakers,
            tracker,
        }
    }

    pub fn register(&self, def: TaskDef, func: TaskFn) {
        info!(
            "[scheduler] Registered task '{}' every {}s (priority {}, idle_only={})",
            def.name, def.interval_secs, def.priority, def.idle_only
        );
        self.tasks.lock().push(ScheduledTask {
            def,
            func,
            last_run: None,
            running: Arc::new(AtomicBool::new(false)),
        });
    }

    /// Called by the gateway on every user request.
    pub fn note_user_activity(&self) {
        self.last_user_input.store(epoch_secs(), Ordering::Relaxed);
    }

    pub fn tempo(&self) -> Tempo {
        let last = self.last_user_input.load(Ordering::Relaxed);
        Tempo::from_idle_secs(epoch_secs().saturating_sub(last))
    }

    /// Tick loop; exits when the shutdown signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("[scheduler] Started");
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("[scheduler] Stopping");
                        return;
                    }
                }
                _ = tick.tick() => self.tick_once(),
            }
        }
    }

    fn tick_once(self: &Arc<Self>) {
        let tempo = self.tempo();
        let mut tasks = self.tasks.lock();
        for task in tasks.iter_mut() {
            let due = task
                .last_run
                .map(|at| at.elapsed().as_secs() >= task.def.interval_secs)
                .unwrap_or(true);
            if !due || task.running.load(Ordering::Relaxed) {
                continue;
            }
            if task.def.priority > tempo.max_priority() {
                continue;
            }
            if task.def.idle_only && tempo == Tempo::Focused {
                debug!(
                    "[scheduler] '{}' blocked by tempo {}",
                    task.def.name,
                    tempo.as_str()
                );
                continue;
            }

            let key = format!("task:{}", task.def.name);
            if self.breakers.admit(&key, BreakerPolicy::task()).is_err() {
                debug!("[scheduler] '{}' skipped — breaker open", task.def.name);
                task.last_run = Some(Instant::now());
                continue;
            }

            task.last_run = Some(Instant::now());
            task.running.store(true, Ordering::Relaxed);
            let name = task.def.name.clone();
            let func = Arc::clone(&task.func);
            let running = Arc::clone(&task.running);
            let breakers = Arc::clone(&self.breakers);
            let tracker = Arc::clone(&self.tracker);
            let timeout = std::time::Duration::from_secs(task.def.expected_duration_secs.max(1) * 10);

            tokio::spawn(async move {
                let started = Instant::now();
                let result = tokio::time::timeout(timeout, (func)()).await;
                let (ok, message) = match result {
                    Ok(Ok(())) => (true, String::new()),
                    Ok(Err(e)) => (false, e.to_string()),
                    Err(_) => (false, format!("task timed out after {:?}", timeout)),
                };
                if ok {
                    breakers.record_success(&format!("task:{name}"));
                } else {
                    warn!("[scheduler] Task '{}' failed: {}", name, message);
                    breakers.record_failure(&format!("task:{name}"), BreakerPolicy::task(), &message);
                    tracker.record_error("scheduler", &format!("task '{name}': {message}"), None);
                }
                tracker.record_operation(
                    None,
                    OperationMetric {
                        component: "scheduler".into(),
                        operation: name,
                        duration_ms: started.elapsed().as_millis() as u64,
                        started_at: Utc::now(),
                        ok,
                        metadata: serde_json::Value::Null,
                    },
                );
                running.store(false, Ordering::Relaxed);
            });
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tempo_thresholds() {
        assert_eq!(Tempo::from_idle_secs(0), Tempo::Focused);
        assert_eq!(Tempo::from_idle_secs(59), Tempo::Focused);
        assert_eq!(Tempo::from_idle_secs(60), Tempo::Alert);
        assert_eq!(Tempo::from_idle_secs(299), Tempo::Alert);
        assert_eq!(Tempo::from_idle_secs(300), Tempo::Reflective);
        assert_eq!(Tempo::from_idle_secs(1799), Tempo::Reflective);
        assert_eq!(Tempo::from_idle_secs(1800), Tempo::Deep);
    }

    #[test]
    fn tempo_priority_admission() {
        assert_eq!(Tempo::Focused.max_priority(), 0);
        assert_eq!(Tempo::Alert.max_priority(), 1);
        assert_eq!(Tempo::Reflective.max_priority(), 2);
        assert!(Tempo::Deep.max_priority() > 2);
    }

    fn scheduler() -> Arc<Scheduler> {
        let tracker = Arc::new(Tracker::new());
        let breakers = Arc::new(BreakerRegistry::new(Some(tracker.clone())));
        Arc::new(Scheduler::new(breakers, tracker))
    }

    #[tokio::test]
    async fn due_essential_task_runs() {
        let sched = scheduler();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        sched.register(
            TaskDef {
                name: "probe".into(),
                interval_secs: 60,
                idle_only: false,
                priority: 0,
                expected_duration_secs: 1,
            },
            Arc::new(move || {
                let flag = Arc::clone(&flag);
                Box::pin(async move {
                    flag.store(true, Ordering::Relaxed);
                    Ok(())
                })
            }),
        );
        sched.note_user_activity(); // tempo = FOCUSED, priority 0 still runs
        sched.tick_once();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(ran.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn focused_tempo_blocks_idle_only_tasks() {
        let sched = scheduler();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        sched.register(
            TaskDef {
                name: "reindex".into(),
                interval_secs: 1,
                idle_only: true,
                priority: 0,
                expected_duration_secs: 1,
            },
            Arc::new(move || {
                let flag = Arc::clone(&flag);
                Box::pin(async move {
                    flag.store(true, Ordering::Relaxed);
                    Ok(())
                })
            }),
        );
        sched.note_user_activity();
        sched.tick_once();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!ran.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn failing_task_trips_its_breaker() {
        let sched = scheduler();
        sched.register(
            TaskDef {
                name: "doomed".into(),
                interval_secs: 0,
                idle_only: false,
                priority: 0,
                expected_duration_secs: 1,
            },
            Arc::new(|| {
                Box::pin(async { Err(crate::atoms::error::GatewayError::Internal("nope".into())) })
            }),
        );
        for _ in 0..3 {
            sched.tick_once();
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        }
        assert_eq!(
            sched.breakers.state("task:doomed"),
            Some(crate::engine::breaker::BreakerState::Open)
        );
        // Next tick skips the task without running it
        sched.tick_once();
    }
}
