use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::error::{Result, RunboxError};
use crate::execution::record::{Execution, ExecutionMetrics, ExecutionResult, ExecutionStatus};
use crate::execution::repository::{new_record, oldest_first, ExecutionRepository, Mutation};

/// Repository storing one JSON document per execution under a directory.
///
/// Writes go to a temporary file in the same directory which is fsynced and
/// renamed over the record, then the directory itself is fsynced, so a
/// record on disk is always either the old or the new version. Writers to
/// the same id are serialized by one of a fixed set of striped locks;
/// most different ids proceed in parallel.
#[derive(Debug)]
pub struct FileExecutionRepository {
    dir: PathBuf,
    locks: Vec<tokio::sync::Mutex<()>>,
}

const LOCK_STRIPES: usize = 64;

fn stripe_for(id: Uuid) -> usize {
    (id.as_u128() % LOCK_STRIPES as u128) as usize
}

impl FileExecutionRepository {
    /// Open (creating if needed) a repository rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        tracing::info!(dir = %dir.display(), "Opened file-backed execution repository");
        Ok(Self {
            dir,
            locks: (0..LOCK_STRIPES).map(|_| tokio::sync::Mutex::new(())).collect(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn lock_for(&self, id: Uuid) -> &tokio::sync::Mutex<()> {
        &self.locks[stripe_for(id)]
    }

    async fn read(&self, id: Uuid) -> Result<Option<Execution>> {
        let path = self.record_path(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RunboxError::Storage(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn write(&self, execution: &Execution) -> Result<()> {
        let dir = self.dir.clone();
        let path = self.record_path(execution.id);
        let bytes = serde_json::to_vec_pretty(execution)?;
        tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &bytes))
            .await
            .map_err(|e| RunboxError::Internal(format!("write task failed: {}", e)))?
    }

    async fn mutate(&self, id: Uuid, mutation: Mutation<'_>) -> Result<Execution> {
        let _guard = self.lock_for(id).lock().await;
        let mut execution = self
            .read(id)
            .await?
            .ok_or(RunboxError::ExecutionNotFound(id))?;
        mutation.apply(&mut execution)?;
        self.write(&execution).await?;
        Ok(execution)
    }
}

fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let storage = |e: std::io::Error| {
        RunboxError::Storage(format!("failed to write {}: {}", path.display(), e))
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(storage)?;
    tmp.write_all(bytes).map_err(storage)?;
    tmp.as_file().sync_all().map_err(storage)?;
    tmp.persist(path).map_err(|e| storage(e.error))?;
    #[cfg(unix)]
    std::fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(storage)?;
    Ok(())
}

#[async_trait]
impl ExecutionRepository for FileExecutionRepository {
    async fn get(&self, id: Uuid) -> Result<Option<Execution>> {
        self.read(id).await
    }

    async fn create_with_status(
        &self,
        code: String,
        input_data: Option<Value>,
        status: ExecutionStatus,
    ) -> Result<Execution> {
        let execution = new_record(code, input_data, status)?;
        self.write(&execution).await?;
        tracing::debug!(execution_id = %execution.id, status = %execution.status, "Execution record created");
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
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut matching = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // Removed between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<Execution>(&bytes) {
                Ok(execution) if execution.status == status => matching.push(execution),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable execution record");
                }
            }
        }
        Ok(oldest_first(matching, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripe_is_stable_and_in_range() {
        for _ in 0..1000 {
            let id = Uuid::new_v4();
            let stripe = stripe_for(id);
            assert!(stripe < LOCK_STRIPES);
            assert_eq!(stripe, stripe_for(id));
        }
    }

    #[tokio::test]
    async fn lock_table_does_not_grow_with_records() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileExecutionRepository::open(dir.path()).await.unwrap();

        for i in 0..200 {
            let created = repo.create(format!("n = {}", i), None).await.unwrap();
            repo.mark_processing(created.id, "local-1").await.unwrap();
            repo.fail(created.id, "done").await.unwrap();
        }

        assert_eq!(repo.locks.len(), LOCK_STRIPES);
        assert_eq!(
            repo.list_by_status(ExecutionStatus::Failed, 500).await.unwrap().len(),
            200
        );
    }
}
