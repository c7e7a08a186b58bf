//! # dtq
//!
//! A distributed task queue backed by Redis: producers enqueue tasks, workers
//! claim them under time-bounded leases, and a scheduler enqueues recurring
//! tasks from cron-like specs.
//!
//! ## Features
//!
//! - Weighted priority queues with an optional strict mode
//! - Delayed tasks, retries with exponential backoff, and an archive for dead tasks
//! - Per-task timeouts and deadlines with cooperative cancellation
//! - Lease renewal and recovery of tasks abandoned by crashed workers
//! - Unique tasks
//! - Handler middleware
//! - Periodic tasks (`* * * * *`, `@daily`, `@every 30s`)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dtq::{EnqueueOptions, RedisConfig, RedisStore, Task, TaskClient, TaskError, TaskHandlerRegistry, Worker, WorkerConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> dtq::TaskResult<()> {
//! let store = Arc::new(RedisStore::new(RedisConfig::default()).await?);
//!
//! let client = TaskClient::from_store(store.clone());
//! client
//!     .enqueue(&Task::new("email:deliver", br#"{"user_id":42}"#.to_vec()), EnqueueOptions::new().queue("low"))
//!     .await?;
//!
//! let mut registry = TaskHandlerRegistry::new();
//! registry.register_fn("email:deliver", |_ctx, task| async move {
//!     if task.payload().is_empty() {
//!         return Err(TaskError::skip_retry("empty payload"));
//!     }
//!     Ok(())
//! })?;
//!
//! let config = WorkerConfig::default().with_queues([("critical", 6), ("default", 3), ("low", 1)]);
//! Worker::new(config, store, registry)?.run_until_signal().await
//! # }
//! ```

pub mod client;
pub mod clock;
pub mod error;
pub mod mux;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use client::{EnqueueOptions, TaskClient};
pub use error::{TaskError, TaskResult};
pub use mux::{handler_fn, LoggingMiddleware, Middleware, TaskContext, TaskHandler, TaskHandlerRegistry};
pub use scheduler::{EntryId, SchedulerConfig, TaskScheduler};
pub use store::{MemoryStore, QueueStats, RedisConfig, RedisStore, Retention, TaskStore};
pub use task::{RetryConfig, Task, TaskId, TaskInfo, TaskMessage, TaskState};
pub use worker::{Worker, WorkerConfig, WorkerHandle, WorkerStats};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
