//! Local subprocess backend against a real `python3`. Tests return early
//! when no interpreter is installed.


use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use runbox::config::{LocalBackendConfig, ResourceLimits};
use runbox::error::RunboxError;
use runbox::execution::{MISSING_RESULT_EXIT_CODE, TIMEOUT_EXIT_CODE};
use runbox::sandbox::process::{CANCELLED_EXIT_CODE, RESULT_FILE};
use runbox::sandbox::{LocalBackend, SandboxBackend, SandboxRequest};
use test_harness::python_available;

fn backend() -> LocalBackend {
    LocalBackend::new(LocalBackendConfig {
        require_result: false,
        ..LocalBackendConfig::default()
    })
}

fn request(code: &str) -> SandboxRequest {
    SandboxRequest::new(code, None, ResourceLimits::default().with_timeout(10))
}

#[tokio::test]
async fn test_captures_stdout_and_stderr() {
    if !python_available() {
        return;
    }
    let outcome = backend()
        .execute(request(
            "import sys\nprint('hello')\nprint('warn', file=sys.stderr)",
        ))
        .await;

    assert_eq!(outcome.result.exit_code, 0);
    assert_eq!(outcome.result.stdout, "hello\n");
    assert_eq!(outcome.result.stderr, "warn\n");
    assert!(outcome.metrics.success);
    assert!(!outcome.metrics.cold_start);
}

#[tokio::test]
async fn test_input_data_is_bound() {
    if !python_available() {
        return;
    }
    let req = SandboxRequest::new(
        "print(input_data['a'] + input_data['b'])",
        Some(json!({"a": 2, "b": 40})),
        ResourceLimits::default(),
    );
    let outcome = backend().execute(req).await;

    assert_eq!(outcome.result.stdout, "42\n");
}

#[tokio::test]
async fn test_result_variable_is_returned() {
    if !python_available() {
        return;
    }
    let outcome = LocalBackend::default()
        .execute(request("result = {'total': sum(range(5))}"))
        .await;

    assert_eq!(outcome.result.exit_code, 0);
    let returned: serde_json::Value =
        serde_json::from_str(outcome.result.output_files.get(RESULT_FILE).unwrap()).unwrap();
    assert_eq!(returned, json!({"total": 10}));
}

#[tokio::test]
async fn test_missing_result_is_an_error_when_required() {
    if !python_available() {
        return;
    }
    let outcome = LocalBackend::default()
        .execute(request("answer = 42"))
        .await;

    assert_eq!(outcome.result.exit_code, MISSING_RESULT_EXIT_CODE);
    assert!(outcome.result.stderr.contains("result"));
    assert!(!outcome.result.output_files.contains_key(RESULT_FILE));
}

#[tokio::test]
async fn test_exception_gives_non_zero_exit_and_traceback() {
    if !python_available() {
        return;
    }
    let outcome = backend().execute(request("1 / 0")).await;

    assert_eq!(outcome.result.exit_code, 1);
    assert!(outcome.result.stderr.contains("ZeroDivisionError"));
    assert!(!outcome.metrics.success);
    assert!(!outcome.metrics.backend_failure);
}

#[tokio::test]
async fn test_sys_exit_code_is_preserved() {
    if !python_available() {
        return;
    }
    let outcome = backend().execute(request("import sys\nsys.exit(7)")).await;
    assert_eq!(outcome.result.exit_code, 7);
}

#[tokio::test]
async fn test_timeout_kills_run_promptly() {
    if !python_available() {
        return;
    }
    let req = SandboxRequest::new(
        "import time\nwhile True:\n    time.sleep(0.1)",
        None,
        ResourceLimits::default().with_timeout(1),
    );

    let started = Instant::now();
    let outcome = backend().execute(req).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(4));
    assert_eq!(outcome.result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(outcome.metrics.timed_out);
}

#[tokio::test]
async fn test_timeout_also_kills_spawned_children() {
    if !python_available() {
        return;
    }
    let req = SandboxRequest::new(
        "import subprocess, time\ntry:\n    subprocess.Popen(['sleep', '30'])\nexcept OSError:\n    pass\ntime.sleep(30)",
        None,
        ResourceLimits::default().with_timeout(1),
    );

    let started = Instant::now();
    let outcome = backend().execute(req).await;

    // Pipes close only once every process in the group is gone.
    assert!(started.elapsed() < Duration::from_secs(6));
    assert!(outcome.metrics.timed_out);
}

#[tokio::test]
async fn test_cancel_aborts_run() {
    if !python_available() {
        return;
    }
    let cancel = CancellationToken::new();
    let req = request("import time\ntime.sleep(30)").with_cancel(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = backend().execute(req).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome.result.exit_code, CANCELLED_EXIT_CODE);
    assert!(outcome.metrics.cancelled);
}

#[tokio::test]
async fn test_written_files_are_returned() {
    if !python_available() {
        return;
    }
    let outcome = backend()
        .execute(request("with open('report.csv', 'w') as f:\n    f.write('a,b\\n1,2\\n')"))
        .await;

    assert_eq!(outcome.result.exit_code, 0);
    assert_eq!(
        outcome.result.output_files.get("report.csv").map(String::as_str),
        Some("a,b\n1,2\n")
    );
}

#[tokio::test]
async fn test_environment_is_not_inherited() {
    if !python_available() {
        return;
    }
    std::env::set_var("RUNBOX_TEST_SECRET", "hunter2");
    let outcome = backend()
        .execute(request(
            "import os\nprint(os.environ.get('RUNBOX_TEST_SECRET', 'absent'))",
        ))
        .await;

    assert_eq!(outcome.result.stdout, "absent\n");
}

#[tokio::test]
async fn test_missing_interpreter_is_backend_failure() {
    let backend = LocalBackend::new(LocalBackendConfig {
        interpreter: "/nonexistent/python-runbox".to_string(),
        ..LocalBackendConfig::default()
    });
    let outcome = backend.execute(request("print(1)")).await;

    assert!(outcome.metrics.backend_failure);
    assert_ne!(outcome.result.exit_code, 0);
    assert!(outcome.result.stderr.contains("failed to start interpreter"));
}

#[test]
fn test_check_limits_enforces_ceilings() {
    let backend = backend();
    assert!(backend.check_limits(&ResourceLimits::default()).is_ok());

    let err = backend
        .check_limits(&ResourceLimits::default().with_memory_mb(1_000_000))
        .unwrap_err();
    assert!(matches!(err, RunboxError::LimitsUnsupported(_)));

    let err = backend
        .check_limits(&ResourceLimits::default().with_timeout(100_000))
        .unwrap_err();
    assert!(matches!(err, RunboxError::LimitsUnsupported(_)));
}

#[test]
fn test_strict_isolation_rejects_network_restriction() {
    let strict = LocalBackend::new(LocalBackendConfig {
        strict_isolation: true,
        ..LocalBackendConfig::default()
    });
    assert!(strict.check_limits(&ResourceLimits::default()).is_err());

    let open = ResourceLimits {
        network_access: true,
        ..ResourceLimits::default()
    };
    assert!(strict.check_limits(&open).is_ok());
}
