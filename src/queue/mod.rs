//! FIFO work queue of execution ids.
//!
//! Dequeuing moves an id into a processing set stamped with the time it was
//! handed out. The id leaves that set only through
//! [`QueueService::complete_processing`]; ids whose worker never
//! acknowledges them are returned to the head of the queue by
//! [`QueueService::reclaim_expired`] once the visibility timeout lapses, so a
//! crashed worker cannot lose work.

mod metrics;

pub use metrics::{PoolMetrics, QueueStats};

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Result, RunboxError};

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Uuid>,
    processing: HashMap<Uuid, Instant>,
    stats: QueueStats,
}

#[derive(Debug)]
pub struct QueueService {
    state: Mutex<QueueState>,
    config: QueueConfig,
}

impl Default for QueueService {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl QueueService {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            config,
        }
    }

    /// Append an id. Returns `Ok(false)` if it is already waiting or being processed.
    pub async fn enqueue(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.processing.contains_key(&id) || state.pending.contains(&id) {
            tracing::debug!(execution_id = %id, "Execution already queued");
            return Ok(false);
        }
        if state.pending.len() >= self.config.max_length {
            return Err(RunboxError::Queue(format!(
                "queue is at capacity ({} items)",
                self.config.max_length
            )));
        }
        state.pending.push_back(id);
        state.stats.enqueued_total += 1;
        Ok(true)
    }

    /// Take the oldest id and move it into the processing set.
    pub async fn dequeue(&self) -> Option<Uuid> {
        let mut state = self.state.lock().await;
        let id = state.pending.pop_front()?;
        state.processing.insert(id, Instant::now());
        state.stats.dequeued_total += 1;
        Some(id)
    }

    /// Acknowledge a dequeued id. A second call for the same id is a no-op
    /// and returns `false`.
    pub async fn complete_processing(&self, id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        if state.processing.remove(&id).is_some() {
            state.stats.completed_total += 1;
            true
        } else {
            false
        }
    }

    /// Drop a waiting id without processing it. Returns `false` if the id
    /// was not waiting (never queued, or already dequeued).
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        match state.pending.iter().position(|queued| *queued == id) {
            Some(index) => {
                state.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Oldest `count` waiting ids, without dequeuing them.
    pub async fn peek(&self, count: usize) -> Vec<Uuid> {
        let state = self.state.lock().await;
        state.pending.iter().take(count).copied().collect()
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        let state = self.state.lock().await;
        state.pending.contains(&id) || state.processing.contains_key(&id)
    }

    pub async fn is_processing(&self, id: Uuid) -> bool {
        self.state.lock().await.processing.contains_key(&id)
    }

    pub async fn queue_length(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn processing_count(&self) -> usize {
        self.state.lock().await.processing.len()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            queue_length: state.pending.len(),
            processing_count: state.processing.len(),
            ..state.stats
        }
    }

    /// Return processing ids older than the visibility timeout to the head
    /// of the queue, oldest first. Returns the reclaimed ids.
    pub async fn reclaim_expired(&self) -> Vec<Uuid> {
        let mut state = self.state.lock().await;
        let timeout = self.config.visibility_timeout;
        let mut expired: Vec<(Uuid, Instant)> = state
            .processing
            .iter()
            .filter(|(_, since)| since.elapsed() >= timeout)
            .map(|(id, since)| (*id, *since))
            .collect();
        expired.sort_by_key(|(_, since)| *since);

        for (id, _) in expired.iter().rev() {
            state.processing.remove(id);
            state.pending.push_front(*id);
            state.stats.redelivered_total += 1;
            tracing::warn!(execution_id = %id, "Visibility timeout lapsed, execution re-queued");
        }
        expired.into_iter().map(|(id, _)| id).collect()
    }

    /// Drop every waiting and processing id. Administrative use only; not
    /// exposed through any request path.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let removed = state.pending.len() + state.processing.len();
        state.pending.clear();
        state.processing.clear();
        removed
    }
}
