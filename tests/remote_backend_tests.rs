//! Remote backend against an in-process function platform.


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::post,
    Router,
};
use serde_json::json;
use tower::ServiceExt;

use runbox::config::{FunctionConfig, RemoteBackendConfig, ResourceLimits};
use runbox::error::RunboxError;
use runbox::execution::{
    ExecutionManager, ExecutionRepository, ExecutionStatus, InMemoryExecutionRepository,
    TIMEOUT_EXIT_CODE,
};
use runbox::queue::QueueService;
use runbox::sandbox::function::{router, FunctionState, API_KEY_HEADER};
use runbox::sandbox::{RemoteBackend, SandboxBackend, SandboxRequest};
use runbox::service::ExecutionService;
use test_harness::{python_available, test_config};

/// Serve `app` on an ephemeral port and return its base URL.
async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn platform(api_key: Option<&str>) -> String {
    let config = FunctionConfig {
        api_key: api_key.map(str::to_string),
        ..FunctionConfig::default()
    };
    serve(router(FunctionState::new(config))).await
}

fn client(base_url: String, api_key: Option<&str>) -> RemoteBackend {
    RemoteBackend::new(RemoteBackendConfig {
        base_url,
        api_key: api_key.map(str::to_string),
        request_grace: Duration::from_millis(500),
        max_retries: 1,
        ..RemoteBackendConfig::default()
    })
    .unwrap()
}

fn request(code: &str, timeout_seconds: u64) -> SandboxRequest {
    SandboxRequest::new(
        code,
        None,
        ResourceLimits::default().with_timeout(timeout_seconds),
    )
}

#[tokio::test]
async fn test_remote_round_trip() {
    if !python_available() {
        return;
    }
    let backend = client(platform(None).await, None);
    let req = SandboxRequest::new(
        "print(input_data['n'] * 2)\nresult = 'ok'",
        Some(json!({"n": 21})),
        ResourceLimits::default(),
    );

    let outcome = backend.execute(req).await;

    assert_eq!(outcome.result.exit_code, 0);
    assert_eq!(outcome.result.stdout, "42\n");
    assert!(outcome.metrics.success);
    assert!(!outcome.metrics.backend_failure);
}

#[tokio::test]
async fn test_first_invocation_is_cold_start() {
    if !python_available() {
        return;
    }
    let backend = client(platform(None).await, None);

    let first = backend.execute(request("x = 1", 10)).await;
    let second = backend.execute(request("x = 1", 10)).await;

    assert!(first.metrics.cold_start);
    assert!(!second.metrics.cold_start);
}

#[tokio::test]
async fn test_remote_timeout_is_reported() {
    if !python_available() {
        return;
    }
    let backend = client(platform(None).await, None);

    let started = Instant::now();
    let outcome = backend
        .execute(request("import time\ntime.sleep(30)", 1))
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome.result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(outcome.metrics.timed_out);
}

#[tokio::test]
async fn test_remote_code_error_is_not_backend_failure() {
    if !python_available() {
        return;
    }
    let backend = client(platform(None).await, None);
    let outcome = backend.execute(request("raise KeyError('k')", 10)).await;

    assert_eq!(outcome.result.exit_code, 1);
    assert!(outcome.result.stderr.contains("KeyError"));
    assert!(!outcome.metrics.backend_failure);
}

#[tokio::test]
async fn test_wrong_api_key_is_backend_failure() {
    let backend = client(platform(Some("secret")).await, Some("wrong"));
    let outcome = backend.execute(request("x = 1", 5)).await;

    assert!(outcome.metrics.backend_failure);
    assert_ne!(outcome.result.exit_code, 0);
    assert!(outcome.result.stderr.contains("401"));
}

#[tokio::test]
async fn test_unreachable_platform_is_backend_failure() {
    // Bind and drop to get a port nothing listens on.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let backend = client(format!("http://{}", addr), None);

    let outcome = backend.execute(request("x = 1", 5)).await;

    assert!(outcome.metrics.backend_failure);
    assert_ne!(outcome.result.exit_code, 0);
    assert!(!outcome.result.stderr.is_empty());
}

#[tokio::test]
async fn test_connect_timeout_is_backend_failure() {
    // Non-routable address: the connect either hangs until the connect
    // timeout or is refused outright. Neither means the code ran.
    let backend = RemoteBackend::new(RemoteBackendConfig {
        base_url: "http://10.255.255.1:9".to_string(),
        connect_timeout: Duration::from_millis(200),
        retry_backoff: Duration::from_millis(50),
        max_retries: 1,
        ..RemoteBackendConfig::default()
    })
    .unwrap();

    let started = Instant::now();
    let outcome = backend.execute(request("x = 1", 5)).await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(outcome.metrics.backend_failure);
    assert!(!outcome.metrics.timed_out);
    assert_ne!(outcome.result.exit_code, TIMEOUT_EXIT_CODE);
}

#[test]
fn test_max_overhead_covers_grace_and_retries() {
    let backend = RemoteBackend::new(RemoteBackendConfig {
        request_grace: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(1),
        retry_backoff: Duration::from_millis(100),
        max_retries: 2,
        ..RemoteBackendConfig::default()
    })
    .unwrap();

    // 0.5 s grace + (1 s + 0.1 s) + (1 s + 0.2 s)
    assert_eq!(backend.max_overhead(), Duration::from_millis(2800));
}

#[tokio::test]
async fn test_service_waits_out_slow_platform() {
    let app = Router::new().route(
        "/execute",
        post(|| async {
            tokio::time::sleep(Duration::from_millis(1800)).await;
            axum::Json(json!({
                "stdout": "slow but fine\n",
                "stderr": "",
                "exit_code": 0,
                "execution_time_ms": 900,
                "memory_usage_kb": 1024,
                "cold_start": true
            }))
        }),
    );
    let backend = Arc::new(
        RemoteBackend::new(RemoteBackendConfig {
            base_url: serve(app).await,
            request_grace: Duration::from_secs(2),
            max_retries: 0,
            ..RemoteBackendConfig::default()
        })
        .unwrap(),
    );
    // The service's own grace (500 ms) is shorter than the backend's.
    let service = ExecutionService::new(
        Arc::new(InMemoryExecutionRepository::new()) as Arc<dyn ExecutionRepository>,
        Arc::new(QueueService::default()),
        Arc::new(ExecutionManager::new()),
        backend.clone(),
        backend,
        test_config(),
    );

    let outcome = service
        .execute_sync("x = 1".to_string(), None, Some(1))
        .await
        .unwrap();

    assert_eq!(outcome.execution.status, ExecutionStatus::Completed);
    assert!(outcome.success);
    assert_eq!(outcome.result.stdout, "slow but fine\n");
    assert!(outcome.metrics.cold_start);
}

#[tokio::test]
async fn test_hung_platform_times_out_at_timeout_plus_grace() {
    let app = Router::new().route(
        "/execute",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "never"
        }),
    );
    let backend = client(serve(app).await, None);

    let started = Instant::now();
    let outcome = backend.execute(request("x = 1", 1)).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(5));
    assert!(outcome.metrics.timed_out);
    assert_eq!(outcome.result.exit_code, TIMEOUT_EXIT_CODE);
}

#[tokio::test]
async fn test_malformed_platform_response_is_backend_failure() {
    let app = Router::new().route("/execute", post(|| async { "definitely not json" }));
    let backend = client(serve(app).await, None);

    let outcome = backend.execute(request("x = 1", 5)).await;

    assert!(outcome.metrics.backend_failure);
    assert!(outcome.result.stderr.contains("malformed"));
}

#[tokio::test]
async fn test_health_reports_interpreter() {
    let backend = client(platform(None).await, None);
    let health = backend.health().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.interpreter, "python3");
}

#[test]
fn test_check_limits_rejects_network_access() {
    let backend = client("http://127.0.0.1:1".to_string(), None);
    let limits = ResourceLimits {
        network_access: true,
        ..ResourceLimits::default()
    };
    assert!(matches!(
        backend.check_limits(&limits),
        Err(RunboxError::LimitsUnsupported(_))
    ));
    assert!(backend
        .check_limits(&ResourceLimits::default().with_timeout(10_000))
        .is_err());
    assert!(backend.check_limits(&ResourceLimits::default()).is_ok());
}

// =============================================================================
// Platform endpoint validation
// =============================================================================

fn execute_request(body: serde_json::Value, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/execute")
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header(API_KEY_HEADER, key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_platform_rejects_empty_code() {
    let app = router(FunctionState::new(FunctionConfig::default()));
    let response = app
        .oneshot(execute_request(
            json!({"code": "  ", "timeout_seconds": 5}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_platform_rejects_zero_timeout() {
    let app = router(FunctionState::new(FunctionConfig::default()));
    let response = app
        .oneshot(execute_request(
            json!({"code": "x = 1", "timeout_seconds": 0}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_platform_requires_api_key() {
    let config = FunctionConfig {
        api_key: Some("secret".to_string()),
        ..FunctionConfig::default()
    };
    let app = router(FunctionState::new(config));
    let response = app
        .oneshot(execute_request(
            json!({"code": "x = 1", "timeout_seconds": 5}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
