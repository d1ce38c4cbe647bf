use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::RunboxError;
use crate::execution::{Execution, ExecutionStatus};
use crate::queue::QueueStats;
use crate::service::{ExecutionService, StatusView};

const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<ExecutionService>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub code: String,
    #[serde(default)]
    pub input_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub code: String,
    #[serde(default)]
    pub input_data: Option<Value>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub execution_id: Uuid,
    pub cancelled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueResponse {
    pub stats: QueueStats,
    pub next: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PeekParams {
    pub count: Option<usize>,
}

/// Request-path failure, rendered as an HTTP status with a JSON body.
struct ApiError(RunboxError);

impl From<RunboxError> for ApiError {
    fn from(e: RunboxError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_validation() {
            StatusCode::BAD_REQUEST
        } else if self.0.is_not_found() {
            StatusCode::NOT_FOUND
        } else if self.0.is_conflict() {
            StatusCode::CONFLICT
        } else if matches!(self.0, RunboxError::Queue(_)) {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            tracing::error!(error = %self.0, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// HTTP surface over [`ExecutionService`].
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/executions", post(submit_handler).get(list_handler))
        .route("/api/executions/sync", post(execute_sync_handler))
        .route("/api/executions/local", post(execute_local_handler))
        .route("/api/executions/:id", get(status_handler))
        .route("/api/executions/:id/result", get(result_handler))
        .route("/api/executions/:id/cancel", post(cancel_handler))
        .route("/api/queue", get(queue_handler))
        .route("/api/metrics", get(metrics_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(addr: SocketAddr, state: ApiState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting API server");
    axum::serve(listener, router(state)).await
}

/// Like [`run_api`], but stops accepting once `shutdown` fires.
pub async fn run_api_until(
    addr: SocketAddr,
    state: ApiState,
    shutdown: tokio_util::sync::CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting API server");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn submit_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let execution = state
        .service
        .submit(payload.code, payload.input_data)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            execution_id: execution.id,
            status: execution.status,
        }),
    ))
}

async fn execute_sync_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SyncRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .service
        .execute_sync(payload.code, payload.input_data, payload.timeout_seconds)
        .await?;
    Ok(Json(outcome.view()))
}

async fn execute_local_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SyncRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .service
        .execute_local(payload.code, payload.input_data, payload.timeout_seconds)
        .await?;
    Ok(Json(outcome.view()))
}

async fn status_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<StatusView>> {
    Ok(Json(state.service.get_status(id).await?))
}

async fn result_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get_result(id).await?))
}

async fn cancel_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state.service.cancel(id).await?;
    Ok(Json(CancelResponse {
        execution_id: id,
        cancelled,
    }))
}

async fn list_handler(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<Execution>>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let status = match params.status.as_deref() {
        None => ExecutionStatus::Queued,
        Some(s) => s
            .to_ascii_uppercase()
            .parse::<ExecutionStatus>()
            .map_err(|_| RunboxError::InvalidInput(format!("unknown status: {}", s)))?,
    };
    let executions = match status {
        ExecutionStatus::Queued => state.service.get_queued(limit).await?,
        ExecutionStatus::Processing => state.service.get_processing(limit).await?,
        other => {
            state
                .service
                .repository()
                .list_by_status(other, limit)
                .await?
        }
    };
    Ok(Json(executions))
}

async fn queue_handler(
    State(state): State<ApiState>,
    Query(params): Query<PeekParams>,
) -> impl IntoResponse {
    let count = params.count.unwrap_or(10);
    Json(QueueResponse {
        stats: state.service.queue_stats().await,
        next: state.service.queue().peek(count).await,
    })
}

async fn metrics_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.service.pool_metrics().await)
}
