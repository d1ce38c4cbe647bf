use chrono::{Duration, Utc};
use serde_json::json;

use runbox::error::RunboxError;
use runbox::execution::{
    Execution, ExecutionMetrics, ExecutionOrigin, ExecutionResult, ExecutionStatus,
    TIMEOUT_EXIT_CODE,
};

fn ok_result() -> ExecutionResult {
    ExecutionResult {
        stdout: "ok\n".to_string(),
        exit_code: 0,
        execution_time_ms: 40,
        memory_usage_kb: 1024,
        ..Default::default()
    }
}

#[test]
fn test_new_execution_is_queued() {
    let execution = Execution::new("print(1)".to_string(), Some(json!({"a": 1})));
    assert_eq!(execution.status, ExecutionStatus::Queued);
    assert!(execution.result.is_none());
    assert!(execution.sandbox_id.is_none());
    assert!(execution.started_at.is_none());
    assert!(execution.is_consistent());
}

#[test]
fn test_lifecycle_edges() {
    use ExecutionStatus::*;

    assert!(Queued.can_transition_to(Processing));
    assert!(Queued.can_transition_to(Failed));
    assert!(Processing.can_transition_to(Completed));
    assert!(Processing.can_transition_to(Failed));
    assert!(Processing.can_transition_to(Timeout));
    assert!(Processing.can_transition_to(Queued));

    assert!(!Queued.can_transition_to(Completed));
    assert!(!Queued.can_transition_to(Timeout));
    for terminal in [Completed, Failed, Timeout] {
        assert!(terminal.is_terminal());
        for next in [Queued, Processing, Completed, Failed, Timeout] {
            assert!(!terminal.can_transition_to(next));
        }
    }
}

#[test]
fn test_complete_records_result_and_metrics() {
    let mut execution = Execution::new("x = 1".to_string(), None);
    let now = Utc::now();
    execution.start("local-1", now).unwrap();
    execution
        .complete(
            ok_result(),
            Some(ExecutionMetrics {
                execution_time_ms: 55,
                memory_usage_kb: 2048,
            }),
            now + Duration::milliseconds(60),
        )
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.sandbox_id.as_deref(), Some("local-1"));
    assert_eq!(execution.execution_time_ms, Some(55));
    assert_eq!(execution.memory_usage_kb, Some(2048));
    assert_eq!(execution.result.as_ref().unwrap().stdout, "ok\n");
    assert!(execution.is_consistent());
}

#[test]
fn test_complete_without_metrics_uses_result_figures() {
    let mut execution = Execution::new("x = 1".to_string(), None);
    execution.start("local-1", Utc::now()).unwrap();
    execution.complete(ok_result(), None, Utc::now()).unwrap();

    assert_eq!(execution.execution_time_ms, Some(40));
    assert_eq!(execution.memory_usage_kb, Some(1024));
}

#[test]
fn test_completed_at_never_precedes_started_at() {
    let mut execution = Execution::new("x = 1".to_string(), None);
    let started = Utc::now();
    execution.start("local-1", started).unwrap();
    execution
        .fail("boom", started - Duration::seconds(5))
        .unwrap();

    assert!(execution.completed_at.unwrap() >= execution.started_at.unwrap());
    assert!(execution.is_consistent());
}

#[test]
fn test_terminal_state_is_final() {
    let mut execution = Execution::new("x = 1".to_string(), None);
    execution.start("remote-1", Utc::now()).unwrap();
    execution.time_out("timed out", Utc::now()).unwrap();

    let err = execution.complete(ok_result(), None, Utc::now()).unwrap_err();
    assert!(matches!(
        err,
        RunboxError::InvalidTransition {
            from: ExecutionStatus::Timeout,
            to: ExecutionStatus::Completed,
            ..
        }
    ));
    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert_eq!(execution.error_message.as_deref(), Some("timed out"));
}

#[test]
fn test_cancel_before_pickup_fails_queued_record() {
    let mut execution = Execution::new("x = 1".to_string(), None);
    execution.fail("cancelled before execution", Utc::now()).unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.started_at.is_none());
    assert!(execution.is_consistent());
}

#[test]
fn test_requeue_clears_sandbox_binding() {
    let mut execution = Execution::new("x = 1".to_string(), None);
    execution.start("remote-1", Utc::now()).unwrap();
    execution.requeue().unwrap();

    assert_eq!(execution.status, ExecutionStatus::Queued);
    assert!(execution.sandbox_id.is_none());
    assert!(execution.started_at.is_none());
    assert!(execution.is_consistent());
}

#[test]
fn test_sync_record_refuses_requeue() {
    let mut execution = Execution::new("x = 1".to_string(), None);
    execution.origin = ExecutionOrigin::Sync;
    execution.start("local-1", Utc::now()).unwrap();

    let err = execution.requeue().unwrap_err();
    assert!(matches!(
        err,
        RunboxError::InvalidTransition {
            from: ExecutionStatus::Processing,
            to: ExecutionStatus::Queued,
            ..
        }
    ));
    assert_eq!(execution.status, ExecutionStatus::Processing);
    assert_eq!(execution.sandbox_id.as_deref(), Some("local-1"));
}

#[test]
fn test_records_without_origin_default_to_queue() {
    let execution = Execution::new("x = 1".to_string(), None);
    let mut stored = serde_json::to_value(&execution).unwrap();
    stored.as_object_mut().unwrap().remove("origin");

    let loaded: Execution = serde_json::from_value(stored).unwrap();
    assert_eq!(loaded.origin, ExecutionOrigin::Queue);
}

#[test]
fn test_set_status_refuses_terminal_states() {
    let mut execution = Execution::new("x = 1".to_string(), None);
    assert!(execution
        .set_status(ExecutionStatus::Completed, Utc::now())
        .is_err());
    execution
        .set_status(ExecutionStatus::Processing, Utc::now())
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Processing);
}

#[test]
fn test_status_serializes_upper_case() {
    assert_eq!(
        serde_json::to_string(&ExecutionStatus::Processing).unwrap(),
        "\"PROCESSING\""
    );
    assert_eq!(
        "timeout".parse::<ExecutionStatus>().unwrap(),
        ExecutionStatus::Timeout
    );
    assert!("RUNNING".parse::<ExecutionStatus>().is_err());
}

#[test]
fn test_timed_out_result_uses_timeout_exit_code() {
    let result = ExecutionResult::timed_out(5, 5003, "partial".to_string());
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert_eq!(result.stdout, "partial");
    assert!(result.stderr.contains("5 seconds"));
    assert!(!result.is_success());
}

#[test]
fn test_stderr_summary_is_last_non_empty_line() {
    let result = ExecutionResult {
        stderr: "Traceback\n  File \"<code>\"\nZeroDivisionError: division by zero\n\n".to_string(),
        exit_code: 1,
        ..Default::default()
    };
    assert_eq!(
        result.stderr_summary(),
        Some("ZeroDivisionError: division by zero")
    );
    assert_eq!(ExecutionResult::default().stderr_summary(), None);
}
