use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, RunboxError};
use crate::execution::record::{
    Execution, ExecutionMetrics, ExecutionOrigin, ExecutionResult, ExecutionStatus,
};

/// Durable store of execution records.
///
/// Every mutating call returns only after the change is stored. Terminal
/// records are final: any further mutation fails with
/// [`RunboxError::InvalidTransition`], so of two racing terminal writes
/// exactly one wins.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Execution>>;

    /// Create a QUEUED record.
    async fn create(&self, code: String, input_data: Option<Value>) -> Result<Execution> {
        self.create_with_status(code, input_data, ExecutionStatus::Queued)
            .await
    }

    /// Create a record in QUEUED, or in PROCESSING for the synchronous
    /// path. PROCESSING records are marked [`ExecutionOrigin::Sync`].
    async fn create_with_status(
        &self,
        code: String,
        input_data: Option<Value>,
        status: ExecutionStatus,
    ) -> Result<Execution>;

    /// Move to a non-terminal status.
    async fn update_status(&self, id: Uuid, status: ExecutionStatus) -> Result<Execution>;

    /// Enter PROCESSING on `sandbox_id`, stamping `started_at`.
    async fn mark_processing(&self, id: Uuid, sandbox_id: &str) -> Result<Execution>;

    async fn complete(
        &self,
        id: Uuid,
        result: ExecutionResult,
        metrics: Option<ExecutionMetrics>,
    ) -> Result<Execution>;

    async fn fail(&self, id: Uuid, error_message: &str) -> Result<Execution>;

    async fn mark_timeout(&self, id: Uuid, error_message: &str) -> Result<Execution>;

    /// Return a PROCESSING record to QUEUED for redelivery.
    async fn requeue(&self, id: Uuid) -> Result<Execution>;

    /// Records in `status`, oldest first.
    async fn list_by_status(&self, status: ExecutionStatus, limit: usize)
        -> Result<Vec<Execution>>;
}

/// Build a fresh record, validating the code and initial status.
pub(crate) fn new_record(
    code: String,
    input_data: Option<Value>,
    status: ExecutionStatus,
) -> Result<Execution> {
    if code.trim().is_empty() {
        return Err(RunboxError::EmptyCode);
    }
    let mut execution = Execution::new(code, input_data);
    match status {
        ExecutionStatus::Queued => {}
        ExecutionStatus::Processing => {
            execution.set_status(status, Utc::now())?;
            execution.origin = ExecutionOrigin::Sync;
        }
        other => {
            return Err(RunboxError::InvalidInput(format!(
                "records cannot be created in {}",
                other
            )))
        }
    }
    Ok(execution)
}

/// A single state change applied by a repository.
pub(crate) enum Mutation<'a> {
    Status(ExecutionStatus),
    Start(&'a str),
    Complete(ExecutionResult, Option<ExecutionMetrics>),
    Fail(&'a str),
    Timeout(&'a str),
    Requeue,
}

impl Mutation<'_> {
    pub(crate) fn apply(self, execution: &mut Execution) -> Result<()> {
        let now = Utc::now();
        match self {
            Mutation::Status(status) => execution.set_status(status, now),
            Mutation::Start(sandbox_id) => execution.start(sandbox_id, now),
            Mutation::Complete(result, metrics) => execution.complete(result, metrics, now),
            Mutation::Fail(message) => execution.fail(message, now),
            Mutation::Timeout(message) => execution.time_out(message, now),
            Mutation::Requeue => execution.requeue(),
        }
    }
}

pub(crate) fn oldest_first(mut executions: Vec<Execution>, limit: usize) -> Vec<Execution> {
    executions.sort_by_key(|e| e.created_at);
    executions.truncate(limit);
    executions
}

/// Process-local repository, used in tests and single-node deployments
/// that accept losing history on restart.
#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    executions: RwLock<HashMap<Uuid, Execution>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.read().await.is_empty()
    }

    async fn mutate(&self, id: Uuid, mutation: Mutation<'_>) -> Result<Execution> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id)
            .ok_or(RunboxError::ExecutionNotFound(id))?;
        // Apply to a copy so a rejected transition leaves the stored record untouched.
        let mut updated = execution.clone();
        mutation.apply(&mut updated)?;
        *execution = updated.clone();
        Ok(updated)
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn get(&self, id: Uuid) -> Result<Option<Execution>> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn create_with_status(
        &self,
        code: String,
        input_data: Option<Value>,
        status: ExecutionStatus,
    ) -> Result<Execution> {
        let execution = new_record(code, input_data, status)?;
        self.executions
            .write()
            .await
            .insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn update_status(&self, id: Uuid, status: ExecutionStatus) -> Result<Execution> {
        self.mutate(id, Mutation::Status(status)).await
    }

    async fn mark_processing(&self, id: Uuid, sandbox_id: &str) -> Result<Execution> {
        self.mutate(id, Mutation::Start(sandbox_id)).await
    }

    async fn complete(
        &self,
        id: Uuid,
        result: ExecutionResult,
        metrics: Option<ExecutionMetrics>,
    ) -> Result<Execution> {
        self.mutate(id, Mutation::Complete(result, metrics)).await
    }

    async fn fail(&self, id: Uuid, error_message: &str) -> Result<Execution> {
        self.mutate(id, Mutation::Fail(error_message)).await
    }

    async fn mark_timeout(&self, id: Uuid, error_message: &str) -> Result<Execution> {
        self.mutate(id, Mutation::Timeout(error_message)).await
    }

    async fn requeue(&self, id: Uuid) -> Result<Execution> {
        self.mutate(id, Mutation::Requeue).await
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
        limit: usize,
    ) -> Result<Vec<Execution>> {
        let executions = self.executions.read().await;
        let matching = executions
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        Ok(oldest_first(matching, limit))
    }
}
