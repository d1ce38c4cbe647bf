use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, RunboxError};

/// Exit code reported when the wall-clock budget is exhausted.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when the backend itself failed (network, platform, bad response).
pub const BACKEND_FAILURE_EXIT_CODE: i32 = 125;

/// Exit code reported when code finished without binding the required `result` variable.
pub const MISSING_RESULT_EXIT_CODE: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }

    /// Legal edges of the lifecycle.
    ///
    /// `Processing -> Queued` is the redelivery edge used by reconciliation
    /// and `Queued -> Failed` is cancellation before pickup.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Timeout)
                | (Processing, Queued)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Queued => write!(f, "QUEUED"),
            ExecutionStatus::Processing => write!(f, "PROCESSING"),
            ExecutionStatus::Completed => write!(f, "COMPLETED"),
            ExecutionStatus::Failed => write!(f, "FAILED"),
            ExecutionStatus::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = RunboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(ExecutionStatus::Queued),
            "PROCESSING" => Ok(ExecutionStatus::Processing),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "TIMEOUT" => Ok(ExecutionStatus::Timeout),
            other => Err(RunboxError::InvalidInput(format!(
                "unknown execution status: {}",
                other
            ))),
        }
    }
}

/// Which path created an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOrigin {
    /// Submitted and run by a worker; may be redelivered.
    #[default]
    Queue,
    /// Run in the request path. Its caller holds the outcome, so it is
    /// never handed to the queue.
    Sync,
}

impl std::fmt::Display for ExecutionOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionOrigin::Queue => write!(f, "queue"),
            ExecutionOrigin::Sync => write!(f, "sync"),
        }
    }
}

/// Raw outcome of running code in a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u64,
    pub memory_usage_kb: u64,
    /// Files deposited by the code, keyed by file name
    #[serde(default)]
    pub output_files: BTreeMap<String, String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Result for an execution killed at its wall-clock boundary.
    pub fn timed_out(timeout_seconds: u64, elapsed_ms: u64, stdout: String) -> Self {
        Self {
            stdout,
            stderr: format!(
                "Execution timed out after {} seconds and was terminated",
                timeout_seconds
            ),
            exit_code: TIMEOUT_EXIT_CODE,
            execution_time_ms: elapsed_ms,
            ..Default::default()
        }
    }

    /// Result for a failure of the backend rather than of the submitted code.
    pub fn backend_failure(message: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            stderr: message.into(),
            exit_code: BACKEND_FAILURE_EXIT_CODE,
            execution_time_ms: elapsed_ms,
            ..Default::default()
        }
    }

    /// Last non-empty stderr line, used as a short failure summary.
    pub fn stderr_summary(&self) -> Option<&str> {
        self.stderr.lines().rev().map(str::trim).find(|l| !l.is_empty())
    }
}

/// Backend-reported metrics stored alongside a completed result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub execution_time_ms: u64,
    pub memory_usage_kb: u64,
}

/// One code-execution request and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub code: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub origin: ExecutionOrigin,
    pub input_data: Option<Value>,
    pub result: Option<ExecutionResult>,
    pub error_message: Option<String>,
    pub sandbox_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<u64>,
    pub memory_usage_kb: Option<u64>,
}

impl Execution {
    pub fn new(code: String, input_data: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            status: ExecutionStatus::Queued,
            origin: ExecutionOrigin::Queue,
            input_data,
            result: None,
            error_message: None,
            sandbox_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            execution_time_ms: None,
            memory_usage_kb: None,
        }
    }

    fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RunboxError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Enter PROCESSING on the given sandbox.
    ///
    /// A record already in PROCESSING without a sandbox (seeded by the
    /// synchronous path) only gets its sandbox recorded.
    pub fn start(&mut self, sandbox_id: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if self.status == ExecutionStatus::Processing && self.sandbox_id.is_none() {
            self.sandbox_id = Some(sandbox_id.into());
            self.started_at.get_or_insert(now);
            return Ok(());
        }
        self.transition(ExecutionStatus::Processing)?;
        self.sandbox_id = Some(sandbox_id.into());
        self.started_at = Some(now);
        Ok(())
    }

    pub fn complete(
        &mut self,
        result: ExecutionResult,
        metrics: Option<ExecutionMetrics>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(ExecutionStatus::Completed)?;
        let metrics = metrics.unwrap_or(ExecutionMetrics {
            execution_time_ms: result.execution_time_ms,
            memory_usage_kb: result.memory_usage_kb,
        });
        self.finish(now);
        self.execution_time_ms = Some(metrics.execution_time_ms);
        self.memory_usage_kb = Some(metrics.memory_usage_kb);
        self.result = Some(result);
        self.error_message = None;
        Ok(())
    }

    pub fn fail(&mut self, error_message: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(ExecutionStatus::Failed)?;
        self.finish(now);
        self.error_message = Some(error_message.into());
        self.result = None;
        Ok(())
    }

    pub fn time_out(&mut self, error_message: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(ExecutionStatus::Timeout)?;
        self.finish(now);
        self.error_message = Some(error_message.into());
        self.result = None;
        Ok(())
    }

    /// Hand a stuck PROCESSING record back to the queue.
    ///
    /// Synchronous records never go back to the queue.
    pub fn requeue(&mut self) -> Result<()> {
        if self.origin == ExecutionOrigin::Sync {
            return Err(RunboxError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: ExecutionStatus::Queued,
            });
        }
        self.transition(ExecutionStatus::Queued)?;
        self.sandbox_id = None;
        self.started_at = None;
        Ok(())
    }

    /// Generic non-terminal move; terminal states carry payloads and go
    /// through [`complete`](Self::complete), [`fail`](Self::fail) or
    /// [`time_out`](Self::time_out).
    pub fn set_status(&mut self, status: ExecutionStatus, now: DateTime<Utc>) -> Result<()> {
        if status.is_terminal() {
            return Err(RunboxError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: status,
            });
        }
        match status {
            ExecutionStatus::Processing => {
                self.transition(status)?;
                self.started_at = Some(now);
                Ok(())
            }
            _ => self.requeue(),
        }
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        let completed_at = match self.started_at {
            Some(started) if now < started => started,
            _ => now,
        };
        self.completed_at = Some(completed_at);
        if let Some(started) = self.started_at {
            let elapsed = (completed_at - started).num_milliseconds().max(0) as u64;
            self.execution_time_ms = Some(elapsed);
        }
    }

    /// Holds when result/error/sandbox/timestamps agree with the status.
    pub fn is_consistent(&self) -> bool {
        let result_ok = self.result.is_some() == (self.status == ExecutionStatus::Completed);
        let error_ok = self.error_message.is_some()
            == matches!(
                self.status,
                ExecutionStatus::Failed | ExecutionStatus::Timeout
            );
        let sandbox_ok = self.status != ExecutionStatus::Queued || self.sandbox_id.is_none();
        let time_ok = match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => started <= completed,
            _ => true,
        };
        result_ok && error_ok && sandbox_ok && time_ok
    }
}
