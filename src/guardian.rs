use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::registry::Registry;
use crate::store::TaskStore;
use crate::supervisor::{StartRequest, StartSource, Supervisor};
use crate::task::{now_rfc3339, Task};

/// Per-task earliest wall-clock time for the next restart attempt. Shared
/// between the guardian loop (defers) and the supervisor (user actions
/// clear).
#[derive(Default)]
pub struct GuardianState {
    next_attempt: Mutex<HashMap<String, Instant>>,
}

impl GuardianState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self, id: &str) {
        if let Ok(mut map) = self.next_attempt.lock() {
            map.remove(id);
        }
    }

    fn ready(&self, id: &str) -> bool {
        match self.next_attempt.lock() {
            Ok(map) => map
                .get(id)
                .map(|at| Instant::now() >= *at)
                .unwrap_or(true),
            Err(_) => false,
        }
    }

    fn defer(&self, id: &str, delay: Duration) {
        if let Ok(mut map) = self.next_attempt.lock() {
            map.insert(id.to_string(), Instant::now() + delay);
        }
    }
}

/// Periodic restart loop. Failures never surface to HTTP clients; they are
/// accounted through `restart_count` and the server log.
pub async fn run(
    supervisor: Arc<Supervisor>,
    store: Arc<TaskStore>,
    registry: Arc<Registry>,
    state: Arc<GuardianState>,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; skip it so the
    // loop settles into the configured cadence.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        tick_once(&supervisor, &store, &registry, &state).await;
    }
}

pub async fn tick_once(
    supervisor: &Supervisor,
    store: &TaskStore,
    registry: &Registry,
    state: &GuardianState,
) {
    for task in store.list() {
        if !eligible(&task, registry, state).await {
            continue;
        }
        attempt(supervisor, store, state, &task).await;
    }
}

async fn eligible(task: &Task, registry: &Registry, state: &GuardianState) -> bool {
    if !task.auto_restart || task.manual_stopped || !task.was_running_before_shutdown {
        return false;
    }
    if task.start_command.trim().is_empty() {
        return false;
    }
    if registry.is_running(&task.id).await {
        return false;
    }
    if task.max_restarts > 0 && task.restart_count >= task.max_restarts {
        return false;
    }
    state.ready(&task.id)
}

async fn attempt(
    supervisor: &Supervisor,
    store: &TaskStore,
    state: &GuardianState,
    task: &Task,
) {
    let req = StartRequest {
        id: task.id.clone(),
        start_command: task.start_command.clone(),
        working_directory: task.working_directory.clone(),
        environment_variables: task.environment_variables.clone(),
        startup_timeout_ms: None,
    };
    match supervisor.start(req, StartSource::Guardian).await {
        Ok(pid) => {
            info!(id = %task.id, pid, "guardian restarted task");
            let booked = store.update_counters(&task.id, |t| {
                t.restart_count = 0;
                t.manual_stopped = false;
                t.was_running_before_shutdown = true;
                t.last_started = Some(now_rfc3339());
            });
            if let Err(e) = booked {
                warn!(id = %task.id, "guardian bookkeeping failed: {e}");
            }
            state.clear(&task.id);
        }
        Err(failure) => {
            let attempts = task.restart_count.saturating_add(1);
            let booked = store.update_counters(&task.id, |t| {
                t.restart_count = attempts;
            });
            if let Err(e) = booked {
                warn!(id = %task.id, "guardian bookkeeping failed: {e}");
            }
            state.defer(
                &task.id,
                Duration::from_secs(task.restart_interval.max(1)),
            );
            if task.max_restarts > 0 && attempts >= task.max_restarts {
                warn!(
                    id = %task.id,
                    attempts,
                    "guardian giving up, restart cap reached: {}",
                    failure.error
                );
            } else {
                warn!(id = %task.id, attempts, "guardian restart failed: {}", failure.error);
            }
        }
    }
}
