//! Background loops that drain the queue.
//!
//! - **Workers**: each calls [`ExecutionService::process_next`] in a loop,
//!   backing off exponentially (with jitter) while the queue is empty.
//! - **Reconciler**: periodically redelivers work whose visibility timeout
//!   lapsed. See [`reconciler`].
//!
//! Every loop watches a shared [`CancellationToken`]. On shutdown a worker
//! finishes the execution it is running before exiting, so nothing it
//! dequeued is left unacknowledged.

pub mod reconciler;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::service::ExecutionService;

pub use reconciler::Reconciler;

/// A fixed set of worker loops plus the reconciler.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn `config.workers` worker loops and one reconciler.
    pub fn spawn(
        service: Arc<ExecutionService>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let mut handles = Vec::with_capacity(config.workers + 1);
        for worker_id in 0..config.workers {
            let service = service.clone();
            let config = config.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, service, config, shutdown).await;
            }));
        }

        let reconciler = Reconciler::new(service, config.reconcile_interval);
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            reconciler.run(token).await;
        }));

        tracing::info!(workers = config.workers, "Worker pool started");
        Self { handles, shutdown }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every loop to stop and wait for in-flight executions.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Wait for every loop to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

/// Pull executions until `shutdown` fires.
///
/// An empty poll doubles the sleep (from `idle_backoff_min` up to
/// `idle_backoff_max`); any dequeued item resets it. Errors are logged and
/// the loop continues; ids that failed on a storage error stay in the
/// processing set for the reconciler.
async fn worker_loop(
    worker_id: usize,
    service: Arc<ExecutionService>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    tracing::debug!(worker_id, "Worker started");
    let mut backoff = config.idle_backoff_min;

    while !shutdown.is_cancelled() {
        match service.process_next().await {
            Ok(Some(execution)) => {
                tracing::debug!(worker_id, execution_id = %execution.id, status = %execution.status, "Worker finished execution");
                backoff = config.idle_backoff_min;
                continue;
            }
            Ok(None) => {}
            Err(e) if e.is_not_found() => {
                backoff = config.idle_backoff_min;
                continue;
            }
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Failed to process execution");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(with_jitter(backoff)) => {}
        }
        backoff = (backoff * 2).min(config.idle_backoff_max);
    }
    tracing::debug!(worker_id, "Worker stopped");
}

/// Add up to 25% random jitter so idle workers do not poll in lockstep.
fn with_jitter(base: Duration) -> Duration {
    let spread = base.as_millis() as u64 / 4;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
