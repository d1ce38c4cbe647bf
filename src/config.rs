use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunboxError};

/// Resource budget attached to a single sandbox invocation.
///
/// Each backend enforces the fields it can and rejects limits it cannot
/// honour in [`crate::sandbox::SandboxBackend::check_limits`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Address-space cap for the interpreter process, in MB
    pub memory_mb: u64,
    /// Share of one CPU (e.g. 0.5 for half a core)
    pub cpu_share: f64,
    /// Maximum number of processes the code may hold
    pub max_processes: u32,
    /// Wall-clock execution timeout in seconds
    pub timeout_seconds: u64,
    /// Scratch disk quota, in MB
    pub disk_quota_mb: u64,
    /// Largest single file the code may write, in KB
    pub max_file_size_kb: u64,
    /// Whether the code may open network connections
    pub network_access: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_share: 1.0,
            max_processes: 32,
            timeout_seconds: 30,
            disk_quota_mb: 100,
            max_file_size_kb: 1024,
            network_access: false,
        }
    }
}

impl ResourceLimits {
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Reject values that no backend could honour.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_seconds == 0 {
            return Err(RunboxError::InvalidTimeout(0));
        }
        if self.memory_mb == 0 {
            return Err(RunboxError::InvalidInput("memory_mb must be positive".into()));
        }
        if self.cpu_share.is_nan() || self.cpu_share <= 0.0 {
            return Err(RunboxError::InvalidInput("cpu_share must be positive".into()));
        }
        if self.max_processes == 0 {
            return Err(RunboxError::InvalidInput(
                "max_processes must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the same-host subprocess backend.
#[derive(Debug, Clone)]
pub struct LocalBackendConfig {
    /// Interpreter used to run the harness
    pub interpreter: String,
    /// Require submitted code to bind a top-level `result` variable
    pub require_result: bool,
    /// Reject invocations asking for network isolation, which this backend cannot provide
    pub strict_isolation: bool,
    /// Largest memory cap this backend accepts, in MB
    pub max_memory_mb: u64,
    /// Largest timeout this backend accepts, in seconds
    pub max_timeout_seconds: u64,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            require_result: true,
            strict_isolation: false,
            max_memory_mb: 4096,
            max_timeout_seconds: 600,
        }
    }
}

/// Configuration for the remote function-platform backend.
#[derive(Debug, Clone)]
pub struct RemoteBackendConfig {
    /// Base URL of the function platform (e.g. "http://127.0.0.1:9090")
    pub base_url: String,
    /// API key sent as `X-API-Key`
    pub api_key: Option<String>,
    /// Extra time granted to the HTTP call on top of the execution timeout
    pub request_grace: Duration,
    /// Bound on establishing a connection to the platform
    pub connect_timeout: Duration,
    /// Retries for transport-level failures (never for executed code)
    pub max_retries: u32,
    /// Pause before retry `n` is `n * retry_backoff`
    pub retry_backoff: Duration,
    /// Largest memory cap the platform accepts, in MB
    pub max_memory_mb: u64,
    /// Largest timeout the platform accepts, in seconds
    pub max_timeout_seconds: u64,
}

impl Default for RemoteBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9090".to_string(),
            api_key: None,
            request_grace: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            max_memory_mb: 3008,
            max_timeout_seconds: 900,
        }
    }
}

/// Configuration for hosting the function-platform endpoint.
#[derive(Debug, Clone)]
pub struct FunctionConfig {
    pub listen_addr: SocketAddr,
    pub interpreter: String,
    /// API key expected in `X-API-Key`; unauthenticated when unset
    pub api_key: Option<String>,
    /// Ceiling applied to caller-supplied timeouts
    pub max_timeout_seconds: u64,
    /// Memory cap applied to every invocation, in MB
    pub memory_mb: u64,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:9090"
                .parse()
                .expect("default function address is valid"),
            interpreter: "python3".to_string(),
            api_key: None,
            max_timeout_seconds: 900,
            memory_mb: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// A dequeued id not acknowledged within this window is handed out again
    pub visibility_timeout: Duration,
    /// Enqueue fails once this many ids are waiting
    pub max_length: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_length: 10_000,
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Limits applied when the caller supplies none
    pub default_limits: ResourceLimits,
    /// Extra time the orchestrator waits beyond the backend timeout
    pub timeout_grace: Duration,
    /// PROCESSING records older than this and untracked locally are re-queued
    pub stale_after: Duration,
    /// Upper bound on records scanned by recovery/reconciliation
    pub recovery_batch: usize,
    /// Capacity reported in pool metrics
    pub sandbox_capacity: usize,
    pub queue: QueueConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_limits: ResourceLimits::default(),
            timeout_grace: Duration::from_secs(5),
            stale_after: Duration::from_secs(600),
            recovery_batch: 1000,
            sandbox_capacity: 4,
            queue: QueueConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn with_default_limits(mut self, limits: ResourceLimits) -> Self {
        self.default_limits = limits;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.queue.visibility_timeout = timeout;
        self
    }

    pub fn with_sandbox_capacity(mut self, capacity: usize) -> Self {
        self.sandbox_capacity = capacity;
        self
    }

    /// How long the orchestrator waits on a backend call with `timeout`,
    /// given the backend's own worst-case overhead.
    pub fn dispatch_window(&self, timeout: Duration, backend_overhead: Duration) -> Duration {
        timeout + self.timeout_grace.max(backend_overhead)
    }

    /// The longest a single dispatch with default limits may stay in flight.
    pub fn max_dispatch_window(&self) -> Duration {
        self.dispatch_window(self.default_limits.timeout(), Duration::ZERO)
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_for_backend(Duration::ZERO)
    }

    /// Like [`validate`](Self::validate), for a backend that may take up to
    /// `backend_overhead` beyond the execution timeout.
    pub fn validate_for_backend(&self, backend_overhead: Duration) -> Result<()> {
        self.default_limits.validate()?;
        let window = self.dispatch_window(self.default_limits.timeout(), backend_overhead);
        if self.queue.visibility_timeout <= window {
            return Err(RunboxError::Config(format!(
                "visibility timeout ({:?}) must exceed execution timeout plus grace ({:?})",
                self.queue.visibility_timeout, window
            )));
        }
        if self.stale_after <= window {
            return Err(RunboxError::Config(
                "stale_after must exceed execution timeout plus grace".into(),
            ));
        }
        if self.recovery_batch == 0 {
            return Err(RunboxError::Config("recovery_batch must be positive".into()));
        }
        Ok(())
    }
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    /// First sleep after an empty poll
    pub idle_backoff_min: Duration,
    /// Sleep ceiling while the queue stays empty
    pub idle_backoff_max: Duration,
    /// Interval of the reconciliation loop
    pub reconcile_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            idle_backoff_min: Duration::from_millis(100),
            idle_backoff_max: Duration::from_secs(2),
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

/// Top-level server configuration assembled by the CLI.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Directory for the file-backed repository; in-memory when unset
    pub data_dir: Option<PathBuf>,
    pub service: ServiceConfig,
    pub worker: WorkerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:8080"
                .parse()
                .expect("default listen address is valid"),
            data_dir: None,
            service: ServiceConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}
