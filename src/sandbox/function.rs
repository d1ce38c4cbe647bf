//! The function-execution platform side of the remote backend.
//!
//! Exposes `POST /execute`, which runs each request as an isolated child
//! interpreter and answers with the captured output as JSON, and
//! `GET /health`. [`RemoteBackend`](crate::sandbox::RemoteBackend) is the
//! client for this endpoint.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{FunctionConfig, ResourceLimits};
use crate::sandbox::process::{ProcessEnd, ProcessRunner};

pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionRequest {
    pub code: String,
    #[serde(default)]
    pub input_data: Option<Value>,
    pub timeout_seconds: u64,
    /// Caller-requested limits; the platform clamps them to its own ceilings
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u64,
    pub memory_usage_kb: u64,
    #[serde(default)]
    pub output_files: BTreeMap<String, String>,
    #[serde(default)]
    pub cold_start: bool,
    /// Absent on platforms that only signal timeouts through exit code 124
    #[serde(default)]
    pub timed_out: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub interpreter: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Clone)]
pub struct FunctionState {
    config: Arc<FunctionConfig>,
    runner: ProcessRunner,
    /// Cleared by the first request this process serves
    cold: Arc<AtomicBool>,
}

impl FunctionState {
    pub fn new(config: FunctionConfig) -> Self {
        Self {
            runner: ProcessRunner::new(config.interpreter.clone()),
            config: Arc::new(config),
            cold: Arc::new(AtomicBool::new(true)),
        }
    }
}

pub fn router(state: FunctionState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/execute", post(execute_handler))
        .with_state(state)
}

pub async fn run_function_server(config: FunctionConfig) -> std::io::Result<()> {
    let addr: SocketAddr = config.listen_addr;
    let app = router(FunctionState::new(config));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting function platform server");
    axum::serve(listener, app).await
}

async fn health_handler(State(state): State<FunctionState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        interpreter: state.runner.interpreter().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn reject(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

async fn execute_handler(
    State(state): State<FunctionState>,
    headers: HeaderMap,
    Json(request): Json<FunctionRequest>,
) -> Response {
    if let Some(expected) = state.config.api_key.as_deref() {
        let provided = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected) {
            return reject(StatusCode::UNAUTHORIZED, "invalid API key");
        }
    }
    if request.code.trim().is_empty() {
        return reject(StatusCode::BAD_REQUEST, "code must not be empty");
    }
    if request.timeout_seconds == 0 {
        return reject(StatusCode::BAD_REQUEST, "timeout_seconds must be positive");
    }

    let mut limits = request.limits.unwrap_or_default();
    limits.timeout_seconds = request.timeout_seconds.min(state.config.max_timeout_seconds);
    limits.memory_mb = limits.memory_mb.min(state.config.memory_mb);
    limits.network_access = false;

    let cold_start = state.cold.swap(false, Ordering::SeqCst);
    tracing::info!(
        timeout_seconds = limits.timeout_seconds,
        cold_start,
        "Function invocation"
    );

    let outcome = state
        .runner
        .run(
            &request.code,
            request.input_data.as_ref(),
            &limits,
            false,
            &CancellationToken::new(),
        )
        .await;

    if outcome.end == ProcessEnd::SpawnFailed {
        return reject(StatusCode::INTERNAL_SERVER_ERROR, outcome.result.stderr);
    }

    let result = outcome.result;
    Json(FunctionResponse {
        stdout: result.stdout,
        stderr: result.stderr,
        exit_code: result.exit_code,
        execution_time_ms: result.execution_time_ms,
        memory_usage_kb: result.memory_usage_kb,
        output_files: result.output_files,
        cold_start,
        timed_out: Some(outcome.end == ProcessEnd::TimedOut),
    })
    .into_response()
}
