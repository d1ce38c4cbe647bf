use serde::{Deserialize, Serialize};

/// Counters describing the queue at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_length: usize,
    pub processing_count: usize,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    pub completed_total: u64,
    /// Ids handed out again after their visibility timeout lapsed
    pub redelivered_total: u64,
}

/// Aggregate sandbox and queue health, computed on demand and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub total_sandboxes: usize,
    pub available_sandboxes: usize,
    pub busy_sandboxes: usize,
    pub unhealthy_sandboxes: u64,
    pub initializing_sandboxes: usize,
    pub terminated_sandboxes: u64,
    pub queue_length: usize,
    pub processing_count: usize,
    pub average_execution_time_ms: f64,
    pub uptime_seconds: u64,
}
