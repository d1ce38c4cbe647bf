//! Sandbox backends: run code under a resource/time budget and report raw results.
//!
//! Two interchangeable implementations of [`SandboxBackend`]:
//!
//! - [`LocalBackend`]: a subprocess on this host. Low latency, weak
//!   isolation, supports mid-flight abort. Meant for trusted workloads.
//! - [`RemoteBackend`]: an HTTP function-execution platform (see
//!   [`function`] for the platform side). Each call runs in a disposable
//!   environment with hard ceilings, at the cost of cold starts.
//!
//! Backends never fail an invocation with an error: platform and transport
//! problems come back as an [`ExecutionResult`] with a non-zero exit code
//! and a populated stderr. Only [`SandboxBackend::check_limits`] returns
//! `Err`, before anything runs.

pub mod function;
pub mod local;
pub mod process;
pub mod remote;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ResourceLimits;
use crate::error::Result;
use crate::execution::{ExecutionMetrics, ExecutionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Remote,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Remote => write!(f, "remote"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "remote" => Ok(BackendKind::Remote),
            other => Err(format!("unknown backend: {}", other)),
        }
    }
}

/// Metrics reported alongside every result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxMetrics {
    pub execution_time_ms: u64,
    pub memory_usage_kb: u64,
    pub success: bool,
    /// The remote environment had to be initialised for this call
    pub cold_start: bool,
    /// Killed at the wall-clock boundary
    pub timed_out: bool,
    /// Aborted through the cancellation token
    pub cancelled: bool,
    /// The backend, not the code, failed (spawn error, network, bad response)
    pub backend_failure: bool,
}

impl SandboxMetrics {
    pub fn execution(&self) -> ExecutionMetrics {
        ExecutionMetrics {
            execution_time_ms: self.execution_time_ms,
            memory_usage_kb: self.memory_usage_kb,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub code: String,
    pub input_data: Option<Value>,
    pub limits: ResourceLimits,
    /// Fires when the caller wants the run aborted; honoured only by
    /// backends whose [`SandboxBackend::supports_abort`] is true
    pub cancel: CancellationToken,
}

impl SandboxRequest {
    pub fn new(code: impl Into<String>, input_data: Option<Value>, limits: ResourceLimits) -> Self {
        Self {
            code: code.into(),
            input_data,
            limits,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOutcome {
    pub result: ExecutionResult,
    pub metrics: SandboxMetrics,
}

impl BackendOutcome {
    /// Outcome for a failure of the backend itself.
    pub fn backend_failure(message: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            result: ExecutionResult::backend_failure(message, elapsed_ms),
            metrics: SandboxMetrics {
                execution_time_ms: elapsed_ms,
                backend_failure: true,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether a fired cancellation token terminates a running invocation.
    fn supports_abort(&self) -> bool {
        false
    }

    /// Reject limits this backend cannot guarantee.
    fn check_limits(&self, limits: &ResourceLimits) -> Result<()>;

    /// Worst-case time an invocation may take beyond its execution
    /// timeout: transport slack, retries, cold starts. The orchestrator
    /// waits at least this long before declaring a timeout itself.
    fn max_overhead(&self) -> Duration {
        Duration::ZERO
    }

    /// Run the code. Must return within `limits.timeout_seconds` plus
    /// [`max_overhead`](Self::max_overhead).
    async fn execute(&self, request: SandboxRequest) -> BackendOutcome;
}
