//! Store abstraction: the single source of truth for queue state
//!
//! Every operation is atomic with respect to every other operation on the
//! same store. Two workers never hold a live lease on the same task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::TaskResult;
use crate::task::{TaskId, TaskInfo, TaskMessage, TaskState};

pub mod memory;
pub mod redis;

pub use self::memory::{MemoryStore, Retention};
pub use self::redis::{RedisConfig, RedisStore};

/// Exclusive, time-bounded claim on an active task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub task_id: TaskId,
    pub queue: String,
    /// Distinguishes this claim from any later claim of the same task
    pub token: Uuid,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

/// A task handed out by `dequeue`, together with its lease
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub message: TaskMessage,
    pub lease: Lease,
}

/// Per-queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub scheduled: u64,
    pub active: u64,
    pub retry: u64,
    pub archived: u64,
    pub completed: u64,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new envelope. `Scheduled` if `process_at` is in the future.
    async fn enqueue(&self, message: TaskMessage) -> TaskResult<TaskInfo>;

    /// Claim up to `count` eligible tasks, walking `queues` in the given order.
    ///
    /// The lease expires after the task's timeout, or `default_lease` when it has none.
    async fn dequeue(
        &self,
        queues: &[String],
        count: usize,
        worker_id: &str,
        default_lease: Duration,
    ) -> TaskResult<Vec<ClaimedTask>>;

    /// Mark a leased task completed
    async fn ack(&self, lease: &Lease) -> TaskResult<()>;

    /// Record a failed attempt. Returns `Retry` or `Archived`.
    async fn fail(&self, lease: &Lease, error: &str) -> TaskResult<TaskState>;

    /// Archive a leased task without consuming a retry
    async fn archive(&self, lease: &Lease, error: &str) -> TaskResult<()>;

    /// Give a leased task back untouched (used when a worker shuts down)
    async fn requeue(&self, lease: &Lease) -> TaskResult<()>;

    /// Extend a live lease. Fails with `LeaseExpired` once it has lapsed.
    async fn renew_lease(&self, lease: &Lease, extend_by: Duration) -> TaskResult<DateTime<Utc>>;

    /// Move due scheduled and retry tasks into their ready lanes
    async fn forward_due(&self) -> TaskResult<u64>;

    /// Return tasks whose lease lapsed to an eligible (or archived) state
    async fn reap_expired_leases(&self) -> TaskResult<u64>;

    async fn get_task(&self, task_id: TaskId) -> TaskResult<Option<TaskMessage>>;

    async fn queue_stats(&self, queue: &str) -> TaskResult<QueueStats>;

    async fn list_queues(&self) -> TaskResult<Vec<String>>;
}
