use async_trait::async_trait;

use crate::config::{LocalBackendConfig, ResourceLimits};
use crate::error::{Result, RunboxError};
use crate::sandbox::process::{ProcessEnd, ProcessRunner};
use crate::sandbox::{BackendKind, BackendOutcome, SandboxBackend, SandboxMetrics, SandboxRequest};

/// Runs code in a Python subprocess on this host.
///
/// Contract for submitted code:
/// - `input_data` is bound as a top-level variable.
/// - The value to return must be bound to a top-level variable named
///   `result`; it comes back JSON-encoded as `output_files["result.json"]`.
///   When `require_result` is set, finishing without it is an error (exit
///   code 3) rather than falling back to some other variable.
/// - Other files written to the working directory are returned in
///   `output_files`.
///
/// Memory, process count and file size are enforced with rlimits and the
/// timeout by killing the process group. Network and CPU share are not
/// isolated.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    config: LocalBackendConfig,
    runner: ProcessRunner,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new(LocalBackendConfig::default())
    }
}

impl LocalBackend {
    pub fn new(config: LocalBackendConfig) -> Self {
        Self {
            runner: ProcessRunner::new(config.interpreter.clone()),
            config,
        }
    }

    pub fn config(&self) -> &LocalBackendConfig {
        &self.config
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn supports_abort(&self) -> bool {
        true
    }

    fn check_limits(&self, limits: &ResourceLimits) -> Result<()> {
        limits.validate()?;
        if limits.memory_mb > self.config.max_memory_mb {
            return Err(RunboxError::LimitsUnsupported(format!(
                "memory {} MB exceeds local ceiling of {} MB",
                limits.memory_mb, self.config.max_memory_mb
            )));
        }
        if limits.timeout_seconds > self.config.max_timeout_seconds {
            return Err(RunboxError::LimitsUnsupported(format!(
                "timeout {} s exceeds local ceiling of {} s",
                limits.timeout_seconds, self.config.max_timeout_seconds
            )));
        }
        if !limits.network_access {
            if self.config.strict_isolation {
                return Err(RunboxError::LimitsUnsupported(
                    "local backend cannot isolate network access".into(),
                ));
            }
            tracing::debug!("Local backend does not isolate network access");
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, request), fields(sandbox = "local"))]
    async fn execute(&self, request: SandboxRequest) -> BackendOutcome {
        let outcome = self
            .runner
            .run(
                &request.code,
                request.input_data.as_ref(),
                &request.limits,
                self.config.require_result,
                &request.cancel,
            )
            .await;

        let result = outcome.result;
        let metrics = SandboxMetrics {
            execution_time_ms: result.execution_time_ms,
            memory_usage_kb: result.memory_usage_kb,
            success: outcome.end == ProcessEnd::Finished && result.is_success(),
            cold_start: false,
            timed_out: outcome.end == ProcessEnd::TimedOut,
            cancelled: outcome.end == ProcessEnd::Cancelled,
            backend_failure: outcome.end == ProcessEnd::SpawnFailed,
        };
        tracing::debug!(
            exit_code = result.exit_code,
            execution_time_ms = metrics.execution_time_ms,
            timed_out = metrics.timed_out,
            "Local execution finished"
        );
        BackendOutcome { result, metrics }
    }
}
