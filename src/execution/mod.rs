//! Execution records, their storage, and the in-process index of active work.
//!
//! - [`Execution`]: one request and its lifecycle
//!   (`QUEUED -> PROCESSING -> COMPLETED | FAILED | TIMEOUT`)
//! - [`ExecutionRepository`]: durable storage, with in-memory and
//!   file-backed implementations
//! - [`ExecutionManager`]: executions this process is currently handling

pub mod file_repository;
pub mod manager;
pub mod record;
pub mod repository;

pub use file_repository::FileExecutionRepository;
pub use manager::{CancelRequest, ExecutionManager, SandboxSnapshot};
pub use record::{
    Execution, ExecutionMetrics, ExecutionOrigin, ExecutionResult, ExecutionStatus,
    BACKEND_FAILURE_EXIT_CODE, MISSING_RESULT_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
pub use repository::{ExecutionRepository, InMemoryExecutionRepository};
