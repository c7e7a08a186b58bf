//! Client interface for submitting tasks to the queue

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{TaskError, TaskResult};
use crate::store::{QueueStats, RedisConfig, RedisStore, TaskStore};
use crate::task::{
    checked_offset, Task, TaskId, TaskInfo, TaskMessage, DEFAULT_MAX_RETRY, DEFAULT_QUEUE, DEFAULT_TIMEOUT,
};

/// How the unique key of a task is chosen
#[derive(Debug, Clone, PartialEq, Eq)]
enum Uniqueness {
    None,
    Key(String),
    /// Derived from queue, type and payload
    Derived,
}

/// Options applied to a single enqueue
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    queue: Option<String>,
    max_retry: Option<u32>,
    timeout: Option<Duration>,
    deadline: Option<DateTime<Utc>>,
    process_at: Option<DateTime<Utc>>,
    process_in: Option<Duration>,
    uniqueness: Uniqueness,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: None,
            max_retry: None,
            timeout: None,
            deadline: None,
            process_at: None,
            process_in: None,
            uniqueness: Uniqueness::None,
        }
    }
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue name
    pub fn queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Maximum number of retries after the first attempt
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    /// Limit on a single attempt
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Absolute expiry of the task
    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Earliest dispatch time
    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self.process_in = None;
        self
    }

    /// Dispatch no earlier than `delay` from enqueue
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = Some(delay);
        self.process_at = None;
        self
    }

    /// Reject the enqueue while another live task holds `key`
    pub fn unique_key<S: Into<String>>(mut self, key: S) -> Self {
        self.uniqueness = Uniqueness::Key(key.into());
        self
    }

    /// Derive the unique key from queue, type and payload
    pub fn unique(mut self) -> Self {
        self.uniqueness = Uniqueness::Derived;
        self
    }

    /// Whether a deadline or process_at pins the task to a fixed instant
    pub fn has_absolute_times(&self) -> bool {
        self.deadline.is_some() || self.process_at.is_some()
    }

    /// Build the envelope for `task`, validating every option
    pub fn build_message(&self, task: &Task, now: DateTime<Utc>) -> TaskResult<TaskMessage> {
        if task.task_type().trim().is_empty() {
            return Err(TaskError::validation("task type must not be empty"));
        }

        let queue = self.queue.clone().unwrap_or_else(|| DEFAULT_QUEUE.to_string());
        if queue.trim().is_empty() {
            return Err(TaskError::validation("queue name must not be empty"));
        }
        if queue.contains(':') {
            return Err(TaskError::validation(format!("queue name {:?} must not contain ':'", queue)));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(TaskError::validation("timeout must be greater than zero"));
        }
        if let Some(deadline) = self.deadline {
            if deadline <= now {
                return Err(TaskError::validation(format!("deadline {} is not in the future", deadline)));
            }
        }

        let mut message = TaskMessage::new(task, queue, now);
        message.max_retry = self.max_retry.unwrap_or(DEFAULT_MAX_RETRY);
        message.deadline = self.deadline;
        message.timeout = match (self.timeout, self.deadline) {
            (Some(timeout), _) => Some(timeout),
            (None, Some(_)) => None,
            (None, None) => Some(DEFAULT_TIMEOUT),
        };

        if let Some(at) = self.process_at {
            message.process_at = at;
        } else if let Some(delay) = self.process_in {
            message.process_at = checked_offset(now, delay)
                .ok_or_else(|| TaskError::validation(format!("process_in {:?} is out of range", delay)))?;
        }

        // The first lease is taken no earlier than process_at
        message.lease_expiry(message.process_at.max(now), DEFAULT_TIMEOUT)?;

        message.unique_key = match &self.uniqueness {
            Uniqueness::None => None,
            Uniqueness::Key(key) if key.trim().is_empty() => {
                return Err(TaskError::validation("unique key must not be empty"));
            }
            Uniqueness::Key(key) => Some(key.clone()),
            Uniqueness::Derived => Some(derived_unique_key(&message.queue, task)),
        };

        Ok(message)
    }
}

fn derived_unique_key(queue: &str, task: &Task) -> String {
    let digest = Sha256::digest(task.payload());
    format!("{}:{}:{}", queue, task.task_type(), hex::encode(digest))
}

/// Client for submitting tasks to the distributed task queue
#[derive(Clone)]
pub struct TaskClient {
    store: Arc<dyn TaskStore>,
}

impl TaskClient {
    /// Create a new task client backed by Redis
    pub async fn new(config: RedisConfig) -> TaskResult<Self> {
        let store = Arc::new(RedisStore::new(config).await?);
        Ok(Self { store })
    }

    /// Create a new task client with default configuration
    pub async fn new_default() -> TaskResult<Self> {
        Self::new(RedisConfig::default()).await
    }

    /// Create a task client from an existing store
    pub fn from_store(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Submit a task
    pub async fn enqueue(&self, task: &Task, options: EnqueueOptions) -> TaskResult<TaskInfo> {
        let message = options.build_message(task, Utc::now())?;
        let info = self.store.enqueue(message).await?;
        debug!("Enqueued task {} ({}) to queue {}", info.id, info.task_type, info.queue);
        Ok(info)
    }

    /// Submit a task whose payload is `value` encoded as JSON
    pub async fn enqueue_json<T: Serialize>(
        &self,
        task_type: &str,
        value: &T,
        options: EnqueueOptions,
    ) -> TaskResult<TaskInfo> {
        let task = Task::from_json(task_type, value)?;
        self.enqueue(&task, options).await
    }

    /// Submit multiple tasks with the same options, stopping at the first error
    pub async fn enqueue_batch(&self, tasks: &[Task], options: EnqueueOptions) -> TaskResult<Vec<TaskInfo>> {
        let mut infos = Vec::with_capacity(tasks.len());
        for task in tasks {
            infos.push(self.enqueue(task, options.clone()).await?);
        }
        Ok(infos)
    }

    /// Get task envelope by ID
    pub async fn get_task(&self, task_id: TaskId) -> TaskResult<Option<TaskMessage>> {
        self.store.get_task(task_id).await
    }

    /// Get queue statistics
    pub async fn queue_stats(&self, queue_name: &str) -> TaskResult<QueueStats> {
        self.store.queue_stats(queue_name).await
    }

    /// List all known queues
    pub async fn list_queues(&self) -> TaskResult<Vec<String>> {
        self.store.list_queues().await
    }

    /// Get access to the underlying store for advanced operations
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }
}
