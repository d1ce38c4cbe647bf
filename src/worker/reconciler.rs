use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::service::ExecutionService;

/// Periodically runs [`ExecutionService::reconcile`].
pub struct Reconciler {
    service: Arc<ExecutionService>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(service: Arc<ExecutionService>, interval: Duration) -> Self {
        Self { service, interval }
    }

    /// Tick until `shutdown` fires. The first pass runs one full interval
    /// after start, since startup recovery has just run.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.service.reconcile().await {
                        Ok(0) => {}
                        Ok(redelivered) => {
                            tracing::info!(redelivered, "Reconciliation re-queued executions");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Reconciliation failed");
                        }
                    }
                }
            }
        }
    }
}
