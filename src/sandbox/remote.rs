use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;

use crate::config::{RemoteBackendConfig, ResourceLimits};
use crate::error::{Result, RunboxError};
use crate::execution::{ExecutionResult, TIMEOUT_EXIT_CODE};
use crate::sandbox::function::{FunctionRequest, FunctionResponse, HealthResponse, API_KEY_HEADER};
use crate::sandbox::{BackendKind, BackendOutcome, SandboxBackend, SandboxMetrics, SandboxRequest};

/// Client for a remote function-execution platform.
///
/// Every invocation runs in a disposable environment on the platform. The
/// HTTP call is bounded by the execution timeout plus `request_grace`; a
/// call that runs past it is reported as a timeout. Connection failures,
/// including connect timeouts, are retried (the code never ran) and end as
/// a backend failure; everything else is converted into a failed
/// [`ExecutionResult`]. There is no mid-flight abort.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    config: RemoteBackendConfig,
    client: Client,
}

impl RemoteBackend {
    pub fn new(config: RemoteBackendConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| RunboxError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Query the platform's health endpoint.
    pub async fn health(&self) -> Result<HealthResponse> {
        let mut request = self.client.get(self.url("/health"));
        if let Some(ref key) = self.config.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RunboxError::Internal(format!("health check failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(RunboxError::Internal(format!(
                "health check failed: {}",
                response.status()
            )));
        }
        response
            .json::<HealthResponse>()
            .await
            .map_err(|e| RunboxError::Internal(format!("malformed health response: {}", e)))
    }

    async fn invoke_once(
        &self,
        body: &FunctionRequest,
        timeout: Duration,
    ) -> std::result::Result<FunctionResponse, InvokeError> {
        let mut request = self.client.post(self.url("/execute")).timeout(timeout).json(body);
        if let Some(ref key) = self.config.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await.map_err(InvokeError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(InvokeError::Platform(format!(
                "function platform returned {}: {}",
                status, text
            )));
        }
        let bytes = response.bytes().await.map_err(InvokeError::from_reqwest)?;
        serde_json::from_slice::<FunctionResponse>(&bytes).map_err(|e| {
            InvokeError::Platform(format!("malformed function platform response: {}", e))
        })
    }
}

#[derive(Debug)]
enum InvokeError {
    /// Never reached the platform; safe to retry
    Connect(String),
    TimedOut,
    Platform(String),
}

impl InvokeError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        // reqwest flags connect timeouts as both; the code never ran.
        if e.is_connect() {
            InvokeError::Connect(e.to_string())
        } else if e.is_timeout() {
            InvokeError::TimedOut
        } else {
            InvokeError::Platform(format!("function platform request failed: {}", e))
        }
    }
}

#[async_trait]
impl SandboxBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    /// Request grace plus, for every retry, a full connect timeout and its
    /// backoff pause.
    fn max_overhead(&self) -> Duration {
        (1..=self.config.max_retries).fold(self.config.request_grace, |total, attempt| {
            total + self.config.connect_timeout + self.config.retry_backoff * attempt
        })
    }

    fn check_limits(&self, limits: &ResourceLimits) -> Result<()> {
        limits.validate()?;
        if limits.memory_mb > self.config.max_memory_mb {
            return Err(RunboxError::LimitsUnsupported(format!(
                "memory {} MB exceeds platform ceiling of {} MB",
                limits.memory_mb, self.config.max_memory_mb
            )));
        }
        if limits.timeout_seconds > self.config.max_timeout_seconds {
            return Err(RunboxError::LimitsUnsupported(format!(
                "timeout {} s exceeds platform ceiling of {} s",
                limits.timeout_seconds, self.config.max_timeout_seconds
            )));
        }
        if limits.network_access {
            return Err(RunboxError::LimitsUnsupported(
                "remote sandboxes run without network access".into(),
            ));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, request), fields(sandbox = "remote", base_url = %self.config.base_url))]
    async fn execute(&self, request: SandboxRequest) -> BackendOutcome {
        let start = Instant::now();
        let timeout_seconds = request.limits.timeout_seconds;
        let http_timeout = request.limits.timeout() + self.config.request_grace;
        let body = FunctionRequest {
            code: request.code,
            input_data: request.input_data,
            timeout_seconds,
            limits: Some(request.limits),
        };

        let mut attempt = 0;
        let response = loop {
            match self.invoke_once(&body, http_timeout).await {
                Err(InvokeError::Connect(e)) if attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "Function platform unreachable, retrying");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                other => break other,
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match response {
            Ok(response) => {
                let timed_out = response
                    .timed_out
                    .unwrap_or(response.exit_code == TIMEOUT_EXIT_CODE);
                tracing::debug!(
                    exit_code = response.exit_code,
                    cold_start = response.cold_start,
                    "Remote execution finished"
                );
                let metrics = SandboxMetrics {
                    execution_time_ms: response.execution_time_ms,
                    memory_usage_kb: response.memory_usage_kb,
                    success: response.exit_code == 0,
                    cold_start: response.cold_start,
                    timed_out,
                    cancelled: false,
                    backend_failure: false,
                };
                BackendOutcome {
                    result: ExecutionResult {
                        stdout: response.stdout,
                        stderr: response.stderr,
                        exit_code: response.exit_code,
                        execution_time_ms: response.execution_time_ms,
                        memory_usage_kb: response.memory_usage_kb,
                        output_files: response.output_files,
                    },
                    metrics,
                }
            }
            Err(InvokeError::TimedOut) => {
                tracing::warn!(timeout_seconds, "Function platform call timed out");
                BackendOutcome {
                    result: ExecutionResult::timed_out(timeout_seconds, elapsed_ms, String::new()),
                    metrics: SandboxMetrics {
                        execution_time_ms: elapsed_ms,
                        timed_out: true,
                        ..Default::default()
                    },
                }
            }
            Err(InvokeError::Connect(e)) | Err(InvokeError::Platform(e)) => {
                tracing::warn!(error = %e, "Function platform invocation failed");
                BackendOutcome::backend_failure(e, elapsed_ms)
            }
        }
    }
}
