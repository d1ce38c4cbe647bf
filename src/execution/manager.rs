use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::execution::record::{Execution, ExecutionStatus};
use crate::execution::repository::ExecutionRepository;

#[derive(Debug)]
struct ActiveExecution {
    execution: Execution,
    cancel: CancellationToken,
    cancel_requested: bool,
}

#[derive(Debug, Default)]
struct ManagerState {
    active: HashMap<Uuid, ActiveExecution>,
    /// execution id -> sandbox id; every key is also in `active`
    sandboxes: HashMap<Uuid, String>,
    terminated: u64,
    unhealthy: u64,
    completed_runs: u64,
    total_execution_ms: u64,
}

/// Outcome of flagging an active execution for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    /// Whether a sandbox was already bound, i.e. the code may be running
    pub dispatched: bool,
}

/// Sandbox counters for pool metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SandboxSnapshot {
    pub busy: usize,
    pub initializing: usize,
    pub terminated: u64,
    pub unhealthy: u64,
    pub average_execution_time_ms: f64,
    pub uptime_seconds: u64,
}

/// In-memory index of the executions this process is currently handling
/// and the sandboxes they are bound to.
///
/// This is a cache over the repository, not a source of truth: it is
/// rebuilt with [`ExecutionManager::rebuild`] on startup.
#[derive(Debug)]
pub struct ExecutionManager {
    state: RwLock<ManagerState>,
    started: Instant,
}

impl Default for ExecutionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionManager {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ManagerState::default()),
            started: Instant::now(),
        }
    }

    /// Track an execution. Re-adding a tracked id replaces its entry and
    /// drops any stale sandbox binding.
    pub async fn add(&self, execution: Execution) {
        let mut state = self.state.write().await;
        let id = execution.id;
        if state.sandboxes.remove(&id).is_some() {
            state.terminated += 1;
        }
        state.active.insert(
            id,
            ActiveExecution {
                execution,
                cancel: CancellationToken::new(),
                cancel_requested: false,
            },
        );
    }

    pub async fn get(&self, id: Uuid) -> Option<Execution> {
        let state = self.state.read().await;
        state.active.get(&id).map(|a| a.execution.clone())
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.state.read().await.active.contains_key(&id)
    }

    /// Bind `sandbox_id` and move the tracked copy to PROCESSING.
    ///
    /// Returns `false` if the id is untracked, already bound, cancelled, or
    /// not in a state that may start.
    pub async fn assign_sandbox(&self, id: Uuid, sandbox_id: &str) -> bool {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if state.sandboxes.contains_key(&id) {
            return false;
        }
        let Some(active) = state.active.get_mut(&id) else {
            return false;
        };
        if active.cancel_requested {
            return false;
        }
        if active.execution.start(sandbox_id, Utc::now()).is_err() {
            return false;
        }
        state.sandboxes.insert(id, sandbox_id.to_string());
        true
    }

    /// Stop tracking `id`, returning the sandbox it was bound to so the
    /// caller can release it. Only the first call for an id returns the
    /// sandbox.
    pub async fn complete(&self, id: Uuid) -> Option<String> {
        let mut state = self.state.write().await;
        state.active.remove(&id)?;
        let sandbox = state.sandboxes.remove(&id);
        if sandbox.is_some() {
            state.terminated += 1;
        }
        sandbox
    }

    pub async fn assigned_sandbox(&self, id: Uuid) -> Option<String> {
        self.state.read().await.sandboxes.get(&id).cloned()
    }

    /// Token that fires when the execution should be aborted.
    pub async fn cancel_token(&self, id: Uuid) -> Option<CancellationToken> {
        let state = self.state.read().await;
        state.active.get(&id).map(|a| a.cancel.clone())
    }

    /// Flag `id` for cancellation. Flagging happens under the same lock as
    /// [`assign_sandbox`](Self::assign_sandbox), so an undispatched
    /// execution can never be bound afterwards.
    pub async fn request_cancel(&self, id: Uuid) -> Option<CancelRequest> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let dispatched = state.sandboxes.contains_key(&id);
        let active = state.active.get_mut(&id)?;
        active.cancel_requested = true;
        if !dispatched {
            active.cancel.cancel();
        }
        Some(CancelRequest { dispatched })
    }

    /// Fire the abort token of a flagged execution.
    pub async fn abort(&self, id: Uuid) -> bool {
        let state = self.state.read().await;
        match state.active.get(&id) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_cancel_requested(&self, id: Uuid) -> bool {
        let state = self.state.read().await;
        state
            .active
            .get(&id)
            .map(|a| a.cancel_requested)
            .unwrap_or(false)
    }

    /// Count a backend invocation that failed at the platform level.
    pub async fn record_unhealthy(&self) {
        self.state.write().await.unhealthy += 1;
    }

    /// Fold a finished run into the average execution time.
    pub async fn record_run(&self, execution_time_ms: u64) {
        let mut state = self.state.write().await;
        state.completed_runs += 1;
        state.total_execution_ms += execution_time_ms;
    }

    pub async fn active_count(&self) -> usize {
        self.state.read().await.active.len()
    }

    pub async fn active_ids(&self) -> Vec<Uuid> {
        self.state.read().await.active.keys().copied().collect()
    }

    pub async fn snapshot(&self) -> SandboxSnapshot {
        let state = self.state.read().await;
        let busy = state.sandboxes.len();
        let average = if state.completed_runs == 0 {
            0.0
        } else {
            state.total_execution_ms as f64 / state.completed_runs as f64
        };
        SandboxSnapshot {
            busy,
            initializing: state.active.len() - busy,
            terminated: state.terminated,
            unhealthy: state.unhealthy,
            average_execution_time_ms: average,
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    /// Re-populate from the repository's QUEUED and PROCESSING records.
    /// Sandbox bindings are not restored: the sandboxes died with the
    /// previous process. Returns the number of executions tracked.
    pub async fn rebuild(&self, repository: &dyn ExecutionRepository, limit: usize) -> Result<usize> {
        let mut count = 0;
        for status in [ExecutionStatus::Queued, ExecutionStatus::Processing] {
            for execution in repository.list_by_status(status, limit).await? {
                self.add(execution).await;
                count += 1;
            }
        }
        tracing::info!(count, "Execution manager rebuilt from repository");
        Ok(count)
    }
}
