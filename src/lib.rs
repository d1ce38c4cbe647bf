//! Orchestration engine for running untrusted code in disposable sandboxes.
//!
//! Requests arrive either asynchronously (stored, queued, and picked up by
//! a worker) or synchronously (run immediately). Each run goes to a
//! [`sandbox::SandboxBackend`]: a local subprocess or a remote
//! function-execution platform.

pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod queue;
pub mod sandbox;
pub mod service;
pub mod shutdown;
pub mod worker;

pub use error::{Result, RunboxError};
pub use service::ExecutionService;
