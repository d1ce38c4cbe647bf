//! The execution orchestrator.
//!
//! # Paths
//!
//! - **Asynchronous**: [`ExecutionService::submit`] stores a QUEUED record
//!   and enqueues its id; worker loops call
//!   [`ExecutionService::process_next`] to run it.
//! - **Synchronous**: [`ExecutionService::execute_sync`] and
//!   [`ExecutionService::execute_local`] bypass the queue and block until
//!   the backend returns or the timeout lapses.
//!
//! # Outcome mapping
//!
//! Checked top to bottom; the first matching row wins.
//!
//! | Backend outcome                      | Status      |
//! |--------------------------------------|-------------|
//! | aborted through cancellation         | `FAILED`    |
//! | killed at the timeout (exit 124)     | `TIMEOUT`   |
//! | cancel requested while in flight     | `FAILED`    |
//! | backend failure                      | `FAILED`    |
//! | exit code 0 (stderr ignored)         | `COMPLETED` |
//! | any other exit code                  | `FAILED`    |
//!
//! The orchestrator waits the execution timeout plus the larger of its own
//! grace and the backend's [`SandboxBackend::max_overhead`] before it
//! records a timeout on the backend's behalf.
//!
//! Repository errors are never swallowed. On the queue path a failed
//! terminal write leaves the id unacknowledged, so the visibility timeout
//! hands it out again instead of losing it. Synchronous records are never
//! redelivered: one left PROCESSING by a crash or a failed write is failed
//! by recovery or reconciliation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ResourceLimits, ServiceConfig};
use crate::error::{Result, RunboxError};
use crate::execution::{
    Execution, ExecutionManager, ExecutionOrigin, ExecutionRepository, ExecutionResult,
    ExecutionStatus,
};
use crate::queue::{PoolMetrics, QueueService, QueueStats};
use crate::sandbox::{BackendOutcome, SandboxBackend, SandboxMetrics, SandboxRequest};

/// What a caller sees of an execution's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResultView {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u64,
    pub memory_usage_kb: u64,
    pub output_files: BTreeMap<String, String>,
    pub error: Option<String>,
    pub cold_start: bool,
}

impl ExecutionResultView {
    fn new(execution: &Execution, result: &ExecutionResult, cold_start: bool) -> Self {
        Self {
            execution_id: execution.id,
            status: execution.status,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            exit_code: result.exit_code,
            execution_time_ms: execution
                .execution_time_ms
                .unwrap_or(result.execution_time_ms),
            memory_usage_kb: execution.memory_usage_kb.unwrap_or(result.memory_usage_kb),
            output_files: result.output_files.clone(),
            error: execution.error_message.clone(),
            cold_start,
        }
    }
}

/// Polling view of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
}

impl From<&Execution> for StatusView {
    fn from(execution: &Execution) -> Self {
        Self {
            execution_id: execution.id,
            status: execution.status,
            created_at: execution.created_at,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            result: execution.result.clone(),
            error: execution.error_message.clone(),
        }
    }
}

/// Outcome of a synchronous execution.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub execution: Execution,
    pub success: bool,
    pub error: Option<String>,
    /// Raw backend result, also for executions that did not complete
    pub result: ExecutionResult,
    pub metrics: SandboxMetrics,
}

impl SyncOutcome {
    pub fn view(&self) -> ExecutionResultView {
        ExecutionResultView::new(&self.execution, &self.result, self.metrics.cold_start)
    }
}

/// Error recorded on a synchronous execution whose outcome was lost.
pub const INTERRUPTED_SYNC_MESSAGE: &str =
    "synchronous execution interrupted before its outcome was stored";

/// What startup recovery found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub enqueued: usize,
    /// Synchronous executions failed instead of re-run
    pub abandoned: usize,
}

pub struct ExecutionService {
    repository: Arc<dyn ExecutionRepository>,
    queue: Arc<QueueService>,
    manager: Arc<ExecutionManager>,
    /// Used by the queue path and `execute_sync`
    backend: Arc<dyn SandboxBackend>,
    /// Used by `execute_local`
    local_backend: Arc<dyn SandboxBackend>,
    config: ServiceConfig,
}

impl ExecutionService {
    pub fn new(
        repository: Arc<dyn ExecutionRepository>,
        queue: Arc<QueueService>,
        manager: Arc<ExecutionManager>,
        backend: Arc<dyn SandboxBackend>,
        local_backend: Arc<dyn SandboxBackend>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            repository,
            queue,
            manager,
            backend,
            local_backend,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<QueueService> {
        &self.queue
    }

    pub fn manager(&self) -> &Arc<ExecutionManager> {
        &self.manager
    }

    pub fn repository(&self) -> &Arc<dyn ExecutionRepository> {
        &self.repository
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Validate a request and derive its limits. Nothing is stored or run
    /// when this fails.
    fn validate(
        &self,
        code: &str,
        input_data: Option<&Value>,
        timeout_seconds: Option<i64>,
    ) -> Result<ResourceLimits> {
        if code.trim().is_empty() {
            return Err(RunboxError::EmptyCode);
        }
        if let Some(input) = input_data {
            if !(input.is_object() || input.is_null()) {
                return Err(RunboxError::InvalidInput(
                    "input_data must be a JSON object".into(),
                ));
            }
        }
        let mut limits = self.config.default_limits.clone();
        if let Some(timeout) = timeout_seconds {
            if timeout <= 0 {
                return Err(RunboxError::InvalidTimeout(timeout));
            }
            limits.timeout_seconds = timeout as u64;
        }
        limits.validate()?;
        Ok(limits)
    }

    /// Store a QUEUED execution and enqueue it. Never waits for execution.
    pub async fn submit(&self, code: String, input_data: Option<Value>) -> Result<Execution> {
        let limits = self.validate(&code, input_data.as_ref(), None)?;
        self.backend.check_limits(&limits)?;

        let execution = self.repository.create(code, input_data).await?;
        let id = execution.id;
        self.manager.add(execution.clone()).await;
        if let Err(e) = self.queue.enqueue(id).await {
            self.manager.complete(id).await;
            self.repository
                .fail(id, &format!("rejected by queue: {}", e))
                .await?;
            return Err(e);
        }
        tracing::info!(execution_id = %id, "Execution submitted");
        Ok(execution)
    }

    /// Run on the primary backend and wait for the outcome.
    pub async fn execute_sync(
        &self,
        code: String,
        input_data: Option<Value>,
        timeout_seconds: Option<i64>,
    ) -> Result<SyncOutcome> {
        let backend = self.backend.clone();
        self.run_sync(backend, code, input_data, timeout_seconds)
            .await
    }

    /// Run on the local backend and wait for the outcome.
    pub async fn execute_local(
        &self,
        code: String,
        input_data: Option<Value>,
        timeout_seconds: Option<i64>,
    ) -> Result<SyncOutcome> {
        let backend = self.local_backend.clone();
        self.run_sync(backend, code, input_data, timeout_seconds)
            .await
    }

    async fn run_sync(
        &self,
        backend: Arc<dyn SandboxBackend>,
        code: String,
        input_data: Option<Value>,
        timeout_seconds: Option<i64>,
    ) -> Result<SyncOutcome> {
        let limits = self.validate(&code, input_data.as_ref(), timeout_seconds)?;
        backend.check_limits(&limits)?;

        let execution = self
            .repository
            .create_with_status(code, input_data, ExecutionStatus::Processing)
            .await?;
        let id = execution.id;
        let sandbox_id = sandbox_id_for(backend.as_ref());
        self.manager.add(execution.clone()).await;
        self.manager.assign_sandbox(id, &sandbox_id).await;

        let outcome = self
            .run_on_sandbox(backend.as_ref(), execution, &sandbox_id, limits)
            .await;
        self.manager.complete(id).await;
        let (execution, outcome) = outcome?;

        Ok(SyncOutcome {
            success: execution.status == ExecutionStatus::Completed,
            error: execution.error_message.clone(),
            execution,
            result: outcome.result,
            metrics: outcome.metrics,
        })
    }

    /// Persist the sandbox binding, dispatch, and record the terminal state.
    async fn run_on_sandbox(
        &self,
        backend: &dyn SandboxBackend,
        execution: Execution,
        sandbox_id: &str,
        limits: ResourceLimits,
    ) -> Result<(Execution, BackendOutcome)> {
        let id = execution.id;
        self.repository.mark_processing(id, sandbox_id).await?;
        tracing::info!(execution_id = %id, sandbox_id, backend = %backend.kind(), "Execution dispatched");

        let cancel = self
            .manager
            .cancel_token(id)
            .await
            .unwrap_or_else(CancellationToken::new);
        let request = SandboxRequest::new(execution.code, execution.input_data, limits)
            .with_cancel(cancel);
        let outcome = self.dispatch(backend, request).await;
        let cancel_requested = self.manager.is_cancel_requested(id).await;
        let execution = self.finalize(id, &outcome, cancel_requested).await?;
        Ok((execution, outcome))
    }

    /// Invoke the backend, waiting at least as long as its own timeout.
    async fn dispatch(&self, backend: &dyn SandboxBackend, request: SandboxRequest) -> BackendOutcome {
        let timeout_seconds = request.limits.timeout_seconds;
        let deadline = self
            .config
            .dispatch_window(request.limits.timeout(), backend.max_overhead());
        match tokio::time::timeout(deadline, backend.execute(request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(timeout_seconds, "Backend overran its timeout, abandoning call");
                let elapsed_ms = deadline.as_millis() as u64;
                BackendOutcome {
                    result: ExecutionResult::timed_out(timeout_seconds, elapsed_ms, String::new()),
                    metrics: SandboxMetrics {
                        execution_time_ms: elapsed_ms,
                        timed_out: true,
                        ..Default::default()
                    },
                }
            }
        }
    }

    /// Record the terminal state for a finished dispatch.
    async fn finalize(
        &self,
        id: Uuid,
        outcome: &BackendOutcome,
        cancel_requested: bool,
    ) -> Result<Execution> {
        let result = &outcome.result;
        let metrics = &outcome.metrics;

        if metrics.backend_failure {
            self.manager.record_unhealthy().await;
        } else {
            self.manager.record_run(metrics.execution_time_ms).await;
        }

        let write = if metrics.cancelled {
            self.repository.fail(id, "cancelled during execution").await
        } else if metrics.timed_out {
            let message = if result.stderr.is_empty() {
                "execution timed out".to_string()
            } else {
                result.stderr.clone()
            };
            self.repository.mark_timeout(id, &message).await
        } else if cancel_requested {
            let note = format!(
                "cancellation requested but in-flight; backend finished with exit code {}",
                result.exit_code
            );
            self.repository.fail(id, &note).await
        } else if metrics.backend_failure {
            let message = format!("sandbox backend failure: {}", result.stderr.trim());
            self.repository.fail(id, &message).await
        } else if result.is_success() {
            self.repository
                .complete(id, result.clone(), Some(metrics.execution()))
                .await
        } else {
            let message = match result.stderr_summary() {
                Some(summary) => format!("exited with code {}: {}", result.exit_code, summary),
                None => format!("exited with code {}", result.exit_code),
            };
            self.repository.fail(id, &message).await
        };

        match write {
            Ok(execution) => {
                tracing::info!(
                    execution_id = %id,
                    status = %execution.status,
                    exit_code = result.exit_code,
                    execution_time_ms = metrics.execution_time_ms,
                    "Execution finished"
                );
                Ok(execution)
            }
            // Another writer already reached a terminal state; first write wins.
            Err(RunboxError::InvalidTransition { from, to, .. }) => {
                tracing::warn!(execution_id = %id, %from, %to, "Terminal write rejected, keeping existing state");
                self.repository
                    .get(id)
                    .await?
                    .ok_or(RunboxError::ExecutionNotFound(id))
            }
            Err(e) => {
                tracing::error!(execution_id = %id, error = %e, "Failed to persist execution outcome");
                Err(e)
            }
        }
    }

    /// One worker step: dequeue an id and run it to a terminal state.
    ///
    /// Returns `Ok(None)` when the queue is empty. The id is acknowledged
    /// on the queue only after its terminal state has been stored.
    pub async fn process_next(&self) -> Result<Option<Execution>> {
        let Some(id) = self.queue.dequeue().await else {
            return Ok(None);
        };
        tracing::debug!(execution_id = %id, "Dequeued execution");

        let outcome = self.process_claimed(id).await;
        if let Some(sandbox_id) = self.manager.complete(id).await {
            tracing::debug!(execution_id = %id, sandbox_id, "Sandbox released");
        }
        match outcome {
            Ok(execution) => {
                self.queue.complete_processing(id).await;
                Ok(Some(execution))
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(execution_id = %id, "Dequeued id has no execution record, dropping");
                self.queue.complete_processing(id).await;
                Err(e)
            }
            // Left unacknowledged; the visibility timeout redelivers it.
            Err(e) => Err(e),
        }
    }

    async fn process_claimed(&self, id: Uuid) -> Result<Execution> {
        let mut execution = self
            .repository
            .get(id)
            .await?
            .ok_or(RunboxError::ExecutionNotFound(id))?;

        if execution.status.is_terminal() {
            tracing::info!(execution_id = %id, status = %execution.status, "Execution already finished, skipping");
            return Ok(execution);
        }
        if execution.origin == ExecutionOrigin::Sync {
            tracing::warn!(execution_id = %id, "Synchronous execution reached the queue, failing it");
            return self.fail_if_active(id, INTERRUPTED_SYNC_MESSAGE).await;
        }
        if execution.status == ExecutionStatus::Processing {
            // Redelivered before reconciliation reset the record.
            execution = self.repository.requeue(id).await?;
        }

        let tracked_queued = matches!(
            self.manager.get(id).await,
            Some(ref tracked) if tracked.status == ExecutionStatus::Queued
        );
        if !tracked_queued {
            self.manager.add(execution.clone()).await;
        }

        let backend = self.backend.clone();
        let sandbox_id = sandbox_id_for(backend.as_ref());
        if !self.manager.assign_sandbox(id, &sandbox_id).await {
            if self.manager.is_cancel_requested(id).await {
                tracing::info!(execution_id = %id, "Execution cancelled before dispatch");
                return self.fail_if_active(id, "cancelled before execution").await;
            }
            return Err(RunboxError::Internal(format!(
                "could not bind execution {} to a sandbox",
                id
            )));
        }

        let limits = self.config.default_limits.clone();
        match self
            .run_on_sandbox(backend.as_ref(), execution, &sandbox_id, limits)
            .await
        {
            Ok((execution, _)) => Ok(execution),
            // Changed under us (e.g. cancelled) between load and dispatch.
            Err(RunboxError::InvalidTransition { .. }) => self
                .repository
                .get(id)
                .await?
                .ok_or(RunboxError::ExecutionNotFound(id)),
            Err(e) => Err(e),
        }
    }

    async fn fail_if_active(&self, id: Uuid, message: &str) -> Result<Execution> {
        match self.repository.fail(id, message).await {
            Ok(execution) => Ok(execution),
            Err(RunboxError::InvalidTransition { .. }) => self
                .repository
                .get(id)
                .await?
                .ok_or(RunboxError::ExecutionNotFound(id)),
            Err(e) => Err(e),
        }
    }

    /// Cancel a QUEUED or PROCESSING execution.
    ///
    /// Returns `true` when the execution will not produce a result: it was
    /// removed from the queue, caught before dispatch, or aborted by a
    /// backend that supports abort. Returns `false` for unknown or finished
    /// executions, and for in-flight runs on a backend without abort; those
    /// are flagged and recorded as FAILED once the backend returns.
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let Some(execution) = self.repository.get(id).await? else {
            return Ok(false);
        };
        if execution.status.is_terminal() {
            return Ok(false);
        }

        if self.queue.remove(id).await {
            self.manager.complete(id).await;
            return match self.repository.fail(id, "cancelled before execution").await {
                Ok(_) => {
                    tracing::info!(execution_id = %id, "Queued execution cancelled");
                    Ok(true)
                }
                Err(RunboxError::InvalidTransition { .. }) => Ok(false),
                Err(e) => Err(e),
            };
        }

        let Some(request) = self.manager.request_cancel(id).await else {
            tracing::warn!(execution_id = %id, "Cancellation requested for execution not handled by this process");
            return Ok(false);
        };
        if !request.dispatched {
            tracing::info!(execution_id = %id, "Execution cancelled before dispatch");
            return Ok(true);
        }

        let abortable = match self.manager.assigned_sandbox(id).await {
            Some(sandbox_id) => self.sandbox_supports_abort(&sandbox_id),
            None => false,
        };
        if abortable && self.manager.abort(id).await {
            tracing::info!(execution_id = %id, "Running execution aborted");
            Ok(true)
        } else {
            tracing::info!(execution_id = %id, "Cancellation noted for in-flight execution");
            Ok(false)
        }
    }

    fn sandbox_supports_abort(&self, sandbox_id: &str) -> bool {
        [&self.backend, &self.local_backend].iter().any(|backend| {
            backend.supports_abort() && sandbox_id.starts_with(&format!("{}-", backend.kind()))
        })
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Execution>> {
        self.repository.get(id).await
    }

    pub async fn get_status(&self, id: Uuid) -> Result<StatusView> {
        let execution = self
            .repository
            .get(id)
            .await?
            .ok_or(RunboxError::ExecutionNotFound(id))?;
        Ok(StatusView::from(&execution))
    }

    /// Output of a COMPLETED execution.
    pub async fn get_result(&self, id: Uuid) -> Result<ExecutionResultView> {
        let execution = self
            .repository
            .get(id)
            .await?
            .ok_or(RunboxError::ExecutionNotFound(id))?;
        match execution.result {
            Some(ref result) if execution.status == ExecutionStatus::Completed => {
                Ok(ExecutionResultView::new(&execution, result, false))
            }
            _ => Err(RunboxError::ResultNotAvailable(id, execution.status)),
        }
    }

    pub async fn get_queued(&self, limit: usize) -> Result<Vec<Execution>> {
        self.repository
            .list_by_status(ExecutionStatus::Queued, limit)
            .await
    }

    pub async fn get_processing(&self, limit: usize) -> Result<Vec<Execution>> {
        self.repository
            .list_by_status(ExecutionStatus::Processing, limit)
            .await
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    pub async fn pool_metrics(&self) -> PoolMetrics {
        let sandboxes = self.manager.snapshot().await;
        let queue = self.queue.stats().await;
        let in_use = sandboxes.busy + sandboxes.initializing;
        let total = self.config.sandbox_capacity.max(in_use);
        PoolMetrics {
            total_sandboxes: total,
            available_sandboxes: total - in_use,
            busy_sandboxes: sandboxes.busy,
            unhealthy_sandboxes: sandboxes.unhealthy,
            initializing_sandboxes: sandboxes.initializing,
            terminated_sandboxes: sandboxes.terminated,
            queue_length: queue.queue_length,
            processing_count: queue.processing_count,
            average_execution_time_ms: sandboxes.average_execution_time_ms,
            uptime_seconds: sandboxes.uptime_seconds,
        }
    }

    /// Startup recovery: rebuild the manager and queue from the repository.
    ///
    /// Assumes this process is the only one working from the repository,
    /// so every PROCESSING record belongs to a previous, dead instance.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let batch = self.config.recovery_batch;

        for stuck in self
            .repository
            .list_by_status(ExecutionStatus::Processing, batch)
            .await?
        {
            if stuck.origin == ExecutionOrigin::Sync {
                tracing::warn!(execution_id = %stuck.id, "Failing interrupted synchronous execution");
                self.fail_if_active(stuck.id, INTERRUPTED_SYNC_MESSAGE).await?;
                report.abandoned += 1;
                continue;
            }
            self.repository.requeue(stuck.id).await?;
            report.requeued += 1;
        }

        self.manager
            .rebuild(self.repository.as_ref(), batch)
            .await?;
        for queued in self
            .repository
            .list_by_status(ExecutionStatus::Queued, batch)
            .await?
        {
            if self.queue.enqueue(queued.id).await? {
                report.enqueued += 1;
            }
        }

        tracing::info!(
            requeued = report.requeued,
            enqueued = report.enqueued,
            abandoned = report.abandoned,
            "Recovered executions from repository"
        );
        Ok(report)
    }

    /// Periodic repair: redeliver ids whose visibility timeout lapsed,
    /// re-enqueue queued records that nothing is working on, and fail
    /// synchronous records whose caller is gone. Returns how many ids were
    /// handed back to the queue.
    pub async fn reconcile(&self) -> Result<usize> {
        let mut redelivered = 0;

        for id in self.queue.reclaim_expired().await {
            self.manager.complete(id).await;
            match self.repository.requeue(id).await {
                Ok(_) | Err(RunboxError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
            redelivered += 1;
        }

        let stale_before = Utc::now()
            - chrono::Duration::from_std(self.config.stale_after)
                .map_err(|e| RunboxError::Config(e.to_string()))?;
        let batch = self.config.recovery_batch;

        for execution in self
            .repository
            .list_by_status(ExecutionStatus::Processing, batch)
            .await?
        {
            let stale = execution.started_at.map_or(true, |t| t < stale_before);
            if !stale || self.is_owned_here(execution.id).await {
                continue;
            }
            if execution.origin == ExecutionOrigin::Sync {
                tracing::warn!(execution_id = %execution.id, "Stale synchronous execution, failing it");
                self.fail_if_active(execution.id, INTERRUPTED_SYNC_MESSAGE).await?;
                continue;
            }
            tracing::warn!(execution_id = %execution.id, "Stale PROCESSING execution, re-queueing");
            self.repository.requeue(execution.id).await?;
            if self.queue.enqueue(execution.id).await? {
                redelivered += 1;
            }
        }

        for execution in self
            .repository
            .list_by_status(ExecutionStatus::Queued, batch)
            .await?
        {
            if execution.created_at >= stale_before || self.queue.contains(execution.id).await {
                continue;
            }
            tracing::warn!(execution_id = %execution.id, "Orphaned QUEUED execution, re-enqueueing");
            if self.queue.enqueue(execution.id).await? {
                redelivered += 1;
            }
        }

        Ok(redelivered)
    }

    async fn is_owned_here(&self, id: Uuid) -> bool {
        self.manager.contains(id).await || self.queue.contains(id).await
    }
}

fn sandbox_id_for(backend: &dyn SandboxBackend) -> String {
    format!("{}-{}", backend.kind(), Uuid::new_v4())
}
