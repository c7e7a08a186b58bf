//! Task definitions and management

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Queue used when the producer does not name one
pub const DEFAULT_QUEUE: &str = "default";

/// Retry budget used when the producer does not set one
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Per-attempt timeout used when neither a timeout nor a deadline is set
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// `from + by`, or `None` when chrono cannot represent the result
pub fn checked_offset(from: DateTime<Utc>, by: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| from.checked_add_signed(by))
}

/// Lifecycle state of a task envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Eligible for dispatch now
    Pending,
    /// Waiting for its `process_at` time
    Scheduled,
    /// Leased by a worker
    Active,
    /// Failed at least once, waiting for its backoff to elapse
    Retry,
    /// Dead-lettered; no further transitions
    Archived,
    /// Finished successfully; no further transitions
    Completed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Scheduled => "scheduled",
            TaskState::Active => "active",
            TaskState::Retry => "retry",
            TaskState::Archived => "archived",
            TaskState::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskState::Pending),
            "scheduled" => Some(TaskState::Scheduled),
            "active" => Some(TaskState::Active),
            "retry" => Some(TaskState::Retry),
            "archived" => Some(TaskState::Archived),
            "completed" => Some(TaskState::Completed),
            _ => None,
        }
    }

    /// Archived and Completed tasks never change state again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Archived | TaskState::Completed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff applied between retry attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Whether to use exponential backoff
    pub exponential_backoff: bool,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            exponential_backoff: true,
            max_delay: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry_count` (1-based)
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if !self.exponential_backoff {
            return self.base_delay.min(self.max_delay);
        }
        let exponent = retry_count.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1_u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// A unit of work as seen by producers and handlers: a type and an opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    task_type: String,
    payload: Vec<u8>,
}

impl Task {
    pub fn new<S: Into<String>, P: Into<Vec<u8>>>(task_type: S, payload: P) -> Self {
        Self {
            task_type: task_type.into(),
            payload: payload.into(),
        }
    }

    /// Build a task whose payload is the JSON encoding of `value`
    pub fn from_json<S, T>(task_type: S, value: &T) -> TaskResult<Self>
    where
        S: Into<String>,
        T: Serialize,
    {
        Ok(Self::new(task_type, serde_json::to_vec(value)?))
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode a JSON payload
    pub fn payload_json<T: DeserializeOwned>(&self) -> TaskResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

impl From<&TaskMessage> for Task {
    fn from(message: &TaskMessage) -> Self {
        Self::new(message.task_type.clone(), message.payload.clone())
    }
}

/// The durable envelope persisted by a store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    /// Unique task identifier
    pub id: TaskId,
    /// Task type used for handler dispatch
    #[serde(rename = "type")]
    pub task_type: String,
    /// Opaque producer-defined bytes
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    /// Queue name
    pub queue: String,
    /// Current lifecycle state
    pub state: TaskState,
    /// Maximum number of retries after the first attempt
    pub max_retry: u32,
    /// Retries consumed so far
    pub retry_count: u32,
    /// Limit on a single attempt
    pub timeout: Option<Duration>,
    /// Absolute expiry of the task
    pub deadline: Option<DateTime<Utc>>,
    /// Earliest time the task may be dispatched
    pub process_at: DateTime<Utc>,
    /// Dedupe key held while the task is not terminal
    pub unique_key: Option<String>,
    /// When the task was created
    pub created_at: DateTime<Utc>,
    /// When the task was last updated
    pub updated_at: DateTime<Utc>,
    /// Error message of the last failed attempt
    pub last_error: Option<String>,
    /// When the last attempt failed
    pub last_failed_at: Option<DateTime<Utc>>,
    /// When the task completed
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker holding or last holding the task
    pub worker_id: Option<String>,
}

impl TaskMessage {
    /// Create a pending envelope for `task` on `queue`
    pub fn new(task: &Task, queue: String, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new_v4(),
            task_type: task.task_type().to_string(),
            payload: task.payload().to_vec(),
            queue,
            state: TaskState::Pending,
            max_retry: DEFAULT_MAX_RETRY,
            retry_count: 0,
            timeout: None,
            deadline: None,
            process_at: now,
            unique_key: None,
            created_at: now,
            updated_at: now,
            last_error: None,
            last_failed_at: None,
            completed_at: None,
            worker_id: None,
        }
    }

    fn ensure_live(&self) -> TaskResult<()> {
        if self.state.is_terminal() {
            return Err(TaskError::InvalidState {
                task_id: self.id.to_string(),
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Mark task as leased by `worker_id`
    pub fn mark_active(&mut self, worker_id: &str, now: DateTime<Utc>) -> TaskResult<()> {
        self.ensure_live()?;
        self.state = TaskState::Active;
        self.worker_id = Some(worker_id.to_string());
        self.updated_at = now;
        Ok(())
    }

    /// Return the task to the ready lane without consuming a retry
    pub fn mark_pending(&mut self, now: DateTime<Utc>) -> TaskResult<()> {
        self.ensure_live()?;
        self.state = TaskState::Pending;
        self.worker_id = None;
        self.updated_at = now;
        Ok(())
    }

    /// Mark task as completed successfully
    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> TaskResult<()> {
        self.ensure_live()?;
        self.state = TaskState::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Mark task for retry after `backoff`
    pub fn mark_retry(&mut self, error: &str, now: DateTime<Utc>, backoff: Duration) -> TaskResult<()> {
        self.ensure_live()?;
        if !self.can_retry() {
            return Err(TaskError::RetryLimitExceeded {
                task_id: self.id.to_string(),
                max_retries: self.max_retry,
            });
        }
        let process_at = checked_offset(now, backoff)
            .ok_or_else(|| TaskError::validation(format!("retry backoff {:?} is out of range", backoff)))?;

        self.retry_count += 1;
        self.state = TaskState::Retry;
        self.last_error = Some(error.to_string());
        self.last_failed_at = Some(now);
        self.worker_id = None;
        self.updated_at = now;
        self.process_at = process_at;
        Ok(())
    }

    /// Dead-letter the task
    pub fn mark_archived(&mut self, error: &str, now: DateTime<Utc>) -> TaskResult<()> {
        self.ensure_live()?;
        self.state = TaskState::Archived;
        self.last_error = Some(error.to_string());
        self.last_failed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Check if task can be retried
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retry
    }

    /// Check if the task is due at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.process_at <= now
    }

    /// Whether the absolute deadline has passed
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|deadline| deadline <= now).unwrap_or(false)
    }

    /// Lease length for one attempt of this task
    pub fn lease_duration(&self, default_lease: Duration) -> Duration {
        self.timeout.unwrap_or(default_lease)
    }

    /// When a lease taken at `now` would lapse
    pub fn lease_expiry(&self, now: DateTime<Utc>, default_lease: Duration) -> TaskResult<DateTime<Utc>> {
        let length = self.lease_duration(default_lease);
        checked_offset(now, length).ok_or_else(|| {
            TaskError::validation(format!("lease of {:?} on task {} is out of range", length, self.id))
        })
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            queue: self.queue.clone(),
            task_type: self.task_type.clone(),
            state: self.state,
            max_retry: self.max_retry,
            retry_count: self.retry_count,
            process_at: self.process_at,
            deadline: self.deadline,
            timeout: self.timeout,
            last_error: self.last_error.clone(),
        }
    }
}

/// Summary returned to producers after enqueue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub queue: String,
    pub task_type: String,
    pub state: TaskState,
    pub max_retry: u32,
    pub retry_count: u32,
    pub process_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub timeout: Option<Duration>,
    pub last_error: Option<String>,
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> TaskMessage {
        let task = Task::new("email:deliver", b"{}".to_vec());
        TaskMessage::new(&task, DEFAULT_QUEUE.to_string(), Utc::now())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(2),
            exponential_backoff: true,
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(config.delay_for(1), Duration::from_secs(2));
        assert_eq!(config.delay_for(2), Duration::from_secs(4));
        assert_eq!(config.delay_for(3), Duration::from_secs(8));
        assert_eq!(config.delay_for(4), Duration::from_secs(10));
        assert_eq!(config.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_ignores_attempt() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(3),
            exponential_backoff: false,
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(config.delay_for(1), config.delay_for(7));
    }

    #[test]
    fn retry_stops_at_max_retry() {
        let mut msg = message();
        msg.max_retry = 2;
        let now = Utc::now();

        msg.mark_retry("boom", now, Duration::from_secs(1)).unwrap();
        msg.mark_retry("boom", now, Duration::from_secs(1)).unwrap();
        assert_eq!(msg.retry_count, 2);
        assert_eq!(msg.state, TaskState::Retry);
        assert!(msg.process_at > now);

        let err = msg.mark_retry("boom", now, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, TaskError::RetryLimitExceeded { max_retries: 2, .. }));
        assert_eq!(msg.retry_count, 2);
    }

    #[test]
    fn out_of_range_backoff_leaves_envelope_untouched() {
        let mut msg = message();
        let before = msg.clone();
        let err = msg
            .mark_retry("boom", Utc::now(), Duration::from_secs(10_000_000_000_000))
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation { .. }));
        assert_eq!(msg, before);
    }

    #[test]
    fn lease_expiry_is_bounded() {
        let now = Utc::now();
        let mut msg = message();
        msg.timeout = Some(Duration::from_secs(10));
        assert_eq!(
            msg.lease_expiry(now, Duration::from_secs(30)).unwrap(),
            now + chrono::Duration::seconds(10)
        );

        msg.timeout = Some(Duration::from_secs(10_000_000_000_000));
        assert!(matches!(
            msg.lease_expiry(now, Duration::from_secs(30)),
            Err(TaskError::Validation { .. })
        ));
        assert!(checked_offset(now, Duration::MAX).is_none());
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut msg = message();
        let now = Utc::now();
        msg.mark_completed(now).unwrap();

        assert!(matches!(msg.mark_active("w1", now), Err(TaskError::InvalidState { .. })));
        assert!(matches!(msg.mark_archived("late", now), Err(TaskError::InvalidState { .. })));
        assert_eq!(msg.state, TaskState::Completed);
    }

    #[test]
    fn envelope_json_keeps_payload_bytes() {
        let mut msg = message();
        msg.payload = vec![0, 159, 146, 150];
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"email:deliver\""));
        assert!(json.contains("\"state\":\"pending\""));

        let back: TaskMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload, vec![0, 159, 146, 150]);
    }

    #[test]
    fn json_payload_helpers() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct EmailDelivery {
            user_id: i64,
            message: String,
        }

        let task = Task::from_json(
            "email:deliver",
            &EmailDelivery {
                user_id: 42,
                message: "some:template:id".to_string(),
            },
        )
        .unwrap();
        let decoded: EmailDelivery = task.payload_json().unwrap();
        assert_eq!(decoded.user_id, 42);
        assert!(Task::new("x", b"not json".to_vec()).payload_json::<EmailDelivery>().is_err());
    }
}
