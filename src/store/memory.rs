//! In-process store: one mutex over the whole queue state

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ClaimedTask, Lease, QueueStats, TaskStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{TaskError, TaskResult};
use crate::task::{checked_offset, RetryConfig, TaskId, TaskInfo, TaskMessage, TaskState};

const LEASE_EXPIRED_ERROR: &str = "lease expired";

/// How long finished envelopes stay readable. Zero keeps them forever.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub completed: Duration,
    pub archived: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed: Duration::from_secs(86400), // 24 hours
            archived: Duration::from_secs(604800), // 7 days
        }
    }
}

impl Retention {
    fn expired(&self, message: &TaskMessage, now: DateTime<Utc>) -> bool {
        let keep = match message.state {
            TaskState::Completed => self.completed,
            TaskState::Archived => self.archived,
            _ => return false,
        };
        if keep.is_zero() {
            return false;
        }
        checked_offset(message.updated_at, keep).map_or(false, |until| until <= now)
    }
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<TaskId, TaskMessage>,
    /// Ready lanes per queue, FIFO
    ready: HashMap<String, VecDeque<TaskId>>,
    /// Scheduled and retry tasks ordered by due time, then insertion
    delayed: BTreeSet<(DateTime<Utc>, u64, TaskId)>,
    leases: HashMap<TaskId, Lease>,
    unique: HashMap<String, TaskId>,
    queues: BTreeSet<String>,
    seq: u64,
}

impl MemoryState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push_ready(&mut self, queue: &str, task_id: TaskId) {
        self.ready
            .entry(queue.to_string())
            .or_default()
            .push_back(task_id);
    }

    fn push_delayed(&mut self, process_at: DateTime<Utc>, task_id: TaskId) {
        let seq = self.next_seq();
        self.delayed.insert((process_at, seq, task_id));
    }

    /// Move due delayed tasks into their ready lanes
    fn promote_due(&mut self, now: DateTime<Utc>) -> u64 {
        let mut promoted = 0;
        while let Some(&(due, seq, task_id)) = self.delayed.first() {
            if due > now {
                break;
            }
            self.delayed.remove(&(due, seq, task_id));

            let Some(message) = self.tasks.get_mut(&task_id) else {
                continue;
            };
            if message.state == TaskState::Scheduled {
                message.state = TaskState::Pending;
                message.updated_at = now;
            }
            let queue = message.queue.clone();
            self.push_ready(&queue, task_id);
            promoted += 1;
        }
        promoted
    }

    fn check_lease(&self, lease: &Lease, now: DateTime<Utc>) -> TaskResult<()> {
        match self.leases.get(&lease.task_id) {
            Some(current) if current.token == lease.token && current.expires_at > now => Ok(()),
            _ => Err(TaskError::lease_expired(lease.task_id.to_string())),
        }
    }

    /// Remove the lease and hand back the leased message
    fn release(&mut self, lease: &Lease, now: DateTime<Utc>) -> TaskResult<&mut TaskMessage> {
        self.check_lease(lease, now)?;
        self.leases.remove(&lease.task_id);
        self.tasks
            .get_mut(&lease.task_id)
            .ok_or_else(|| TaskError::TaskNotFound {
                task_id: lease.task_id.to_string(),
            })
    }

    /// Drop finished envelopes past their retention
    fn prune_finished(&mut self, retention: &Retention, now: DateTime<Utc>) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, message| !retention.expired(message, now));
        before - self.tasks.len()
    }

    fn release_unique(&mut self, task_id: TaskId) {
        let key = self.tasks.get(&task_id).and_then(|m| m.unique_key.clone());
        if let Some(key) = key {
            if self.unique.get(&key) == Some(&task_id) {
                self.unique.remove(&key);
            }
        }
    }
}

/// Store backed by process memory.
///
/// Suitable for tests and single-process deployments; state is lost on exit.
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
    retry_config: RetryConfig,
    retention: Retention,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock: Arc::new(SystemClock),
            retry_config: RetryConfig::default(),
            retention: Retention::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Finished envelopes are dropped by the reaper once their retention lapses
    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn enqueue(&self, mut message: TaskMessage) -> TaskResult<TaskInfo> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if state.tasks.contains_key(&message.id) {
            return Err(TaskError::queue_operation(
                "enqueue".to_string(),
                format!("task id {} already exists", message.id),
            ));
        }

        if let Some(key) = &message.unique_key {
            if let Some(holder) = state.unique.get(key) {
                let live = state
                    .tasks
                    .get(holder)
                    .map(|m| !m.state.is_terminal())
                    .unwrap_or(false);
                if live {
                    return Err(TaskError::DuplicateTask {
                        unique_key: key.clone(),
                        task_id: holder.to_string(),
                    });
                }
            }
            state.unique.insert(key.clone(), message.id);
        }

        let task_id = message.id;
        if message.process_at > now {
            message.state = TaskState::Scheduled;
            state.push_delayed(message.process_at, task_id);
        } else {
            message.state = TaskState::Pending;
            state.push_ready(&message.queue, task_id);
        }
        state.queues.insert(message.queue.clone());

        let info = message.info();
        state.tasks.insert(task_id, message);

        debug!("Enqueued task {} to queue {} as {}", task_id, info.queue, info.state);
        Ok(info)
    }

    async fn dequeue(
        &self,
        queues: &[String],
        count: usize,
        worker_id: &str,
        default_lease: Duration,
    ) -> TaskResult<Vec<ClaimedTask>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.promote_due(now);

        let mut claimed = Vec::new();
        for queue in queues {
            while claimed.len() < count {
                let Some(task_id) = state.ready.get_mut(queue).and_then(|lane| lane.pop_front()) else {
                    break;
                };
                let Some(message) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                if message.state.is_terminal() || message.state == TaskState::Active {
                    continue;
                }

                // checked before the task leaves Pending
                let expires_at = match message.lease_expiry(now, default_lease) {
                    Ok(at) => at,
                    Err(e) => {
                        warn!("Archiving task {}: {}", task_id, e);
                        message.mark_archived(&e.to_string(), now)?;
                        state.release_unique(task_id);
                        continue;
                    }
                };

                message.mark_active(worker_id, now)?;
                let lease = Lease {
                    task_id,
                    queue: queue.clone(),
                    token: Uuid::new_v4(),
                    worker_id: worker_id.to_string(),
                    expires_at,
                };
                let message = message.clone();
                state.leases.insert(task_id, lease.clone());
                claimed.push(ClaimedTask { message, lease });
            }
            if claimed.len() >= count {
                break;
            }
        }

        if !claimed.is_empty() {
            debug!("Worker {} claimed {} task(s)", worker_id, claimed.len());
        }
        Ok(claimed)
    }

    async fn ack(&self, lease: &Lease) -> TaskResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.release(lease, now)?.mark_completed(now)?;
        state.release_unique(lease.task_id);

        debug!("Marked task {} as completed", lease.task_id);
        Ok(())
    }

    async fn fail(&self, lease: &Lease, error: &str) -> TaskResult<TaskState> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let message = state.release(lease, now)?;

        if message.can_retry() {
            let backoff = self.retry_config.delay_for(message.retry_count + 1);
            message.mark_retry(error, now, backoff)?;
            let process_at = message.process_at;
            state.push_delayed(process_at, lease.task_id);
            debug!("Task {} scheduled for retry at {}", lease.task_id, process_at);
            Ok(TaskState::Retry)
        } else {
            message.mark_archived(error, now)?;
            state.release_unique(lease.task_id);
            debug!("Task {} exhausted its retries and was archived", lease.task_id);
            Ok(TaskState::Archived)
        }
    }

    async fn archive(&self, lease: &Lease, error: &str) -> TaskResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.release(lease, now)?.mark_archived(error, now)?;
        state.release_unique(lease.task_id);

        debug!("Archived task {}", lease.task_id);
        Ok(())
    }

    async fn requeue(&self, lease: &Lease) -> TaskResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let message = state.release(lease, now)?;
        message.mark_pending(now)?;
        let queue = message.queue.clone();
        state
            .ready
            .entry(queue)
            .or_default()
            .push_front(lease.task_id);

        debug!("Requeued task {}", lease.task_id);
        Ok(())
    }

    async fn renew_lease(&self, lease: &Lease, extend_by: Duration) -> TaskResult<DateTime<Utc>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check_lease(lease, now)?;

        let expires_at = checked_offset(now, extend_by)
            .ok_or_else(|| TaskError::validation(format!("lease extension {:?} is out of range", extend_by)))?;
        if let Some(current) = state.leases.get_mut(&lease.task_id) {
            current.expires_at = expires_at;
        }
        Ok(expires_at)
    }

    async fn forward_due(&self) -> TaskResult<u64> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.promote_due(now))
    }

    async fn reap_expired_leases(&self) -> TaskResult<u64> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let expired: Vec<TaskId> = state
            .leases
            .values()
            .filter(|lease| lease.expires_at <= now)
            .map(|lease| lease.task_id)
            .collect();

        let mut reaped = 0;
        for task_id in expired {
            state.leases.remove(&task_id);
            let Some(message) = state.tasks.get_mut(&task_id) else {
                continue;
            };

            if message.can_retry() {
                message.mark_retry(LEASE_EXPIRED_ERROR, now, Duration::ZERO)?;
                let queue = message.queue.clone();
                state.push_ready(&queue, task_id);
            } else {
                message.mark_archived(LEASE_EXPIRED_ERROR, now)?;
                state.release_unique(task_id);
            }
            warn!("Recovered task {} from an expired lease", task_id);
            reaped += 1;
        }

        if reaped > 0 {
            info!("Reaped {} expired lease(s)", reaped);
        }

        let pruned = state.prune_finished(&self.retention, now);
        if pruned > 0 {
            debug!("Dropped {} finished task(s) past retention", pruned);
        }
        Ok(reaped)
    }

    async fn get_task(&self, task_id: TaskId) -> TaskResult<Option<TaskMessage>> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&task_id).cloned())
    }

    async fn queue_stats(&self, queue: &str) -> TaskResult<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for message in state.tasks.values().filter(|m| m.queue == queue) {
            match message.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Scheduled => stats.scheduled += 1,
                TaskState::Active => stats.active += 1,
                TaskState::Retry => stats.retry += 1,
                TaskState::Archived => stats.archived += 1,
                TaskState::Completed => stats.completed += 1,
            }
        }
        Ok(stats)
    }

    async fn list_queues(&self) -> TaskResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state.queues.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::task::{Task, DEFAULT_QUEUE};
    use std::collections::HashSet;

    const LEASE: Duration = Duration::from_secs(30);

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryStore::new()
            .with_clock(clock.clone())
            .with_retry_config(RetryConfig {
                base_delay: Duration::from_secs(1),
                exponential_backoff: true,
                max_delay: Duration::from_secs(60),
            });
        (store, clock)
    }

    fn message(clock: &ManualClock, queue: &str) -> TaskMessage {
        TaskMessage::new(&Task::new("email:deliver", b"{}".to_vec()), queue.to_string(), clock.now())
    }

    fn queues(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn delayed_task_is_invisible_until_due() {
        let (store, clock) = store_with_clock();
        let mut msg = message(&clock, DEFAULT_QUEUE);
        msg.process_at = clock.now() + chrono::Duration::seconds(5);
        let info = store.enqueue(msg).await.unwrap();
        assert_eq!(info.state, TaskState::Scheduled);

        let lanes = queues(&[DEFAULT_QUEUE]);
        for _ in 0..4 {
            assert!(store.dequeue(&lanes, 1, "w1", LEASE).await.unwrap().is_empty());
            clock.advance(chrono::Duration::seconds(1));
        }
        clock.advance(chrono::Duration::milliseconds(999));
        assert!(store.dequeue(&lanes, 1, "w1", LEASE).await.unwrap().is_empty());

        clock.advance(chrono::Duration::milliseconds(1));
        let claimed = store.dequeue(&lanes, 1, "w1", LEASE).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].message.id, info.id);
        assert_eq!(claimed[0].message.state, TaskState::Active);
    }

    #[tokio::test]
    async fn queues_are_walked_in_order_and_fifo_within_queue() {
        let (store, clock) = store_with_clock();
        let low_a = store.enqueue(message(&clock, "low")).await.unwrap();
        let critical = store.enqueue(message(&clock, "critical")).await.unwrap();
        let low_b = store.enqueue(message(&clock, "low")).await.unwrap();

        let claimed = store
            .dequeue(&queues(&["critical", "low"]), 3, "w1", LEASE)
            .await
            .unwrap();
        let ids: Vec<TaskId> = claimed.iter().map(|c| c.message.id).collect();
        assert_eq!(ids, vec![critical.id, low_a.id, low_b.id]);
    }

    #[tokio::test]
    async fn failing_task_retries_max_retry_times_then_archives() {
        let (store, clock) = store_with_clock();
        let mut msg = message(&clock, DEFAULT_QUEUE);
        msg.max_retry = 3;
        let info = store.enqueue(msg).await.unwrap();
        let lanes = queues(&[DEFAULT_QUEUE]);

        let mut attempts = 0;
        loop {
            clock.advance(chrono::Duration::minutes(5));
            let claimed = store.dequeue(&lanes, 1, "w1", LEASE).await.unwrap();
            if claimed.is_empty() {
                break;
            }
            attempts += 1;
            store.fail(&claimed[0].lease, "smtp unavailable").await.unwrap();
        }

        let stored = store.get_task(info.id).await.unwrap().unwrap();
        assert_eq!(attempts, 4);
        assert_eq!(stored.state, TaskState::Archived);
        assert_eq!(stored.retry_count, 3);
        assert_eq!(stored.last_error.as_deref(), Some("smtp unavailable"));
    }

    #[tokio::test]
    async fn retry_waits_for_backoff() {
        let (store, clock) = store_with_clock();
        store.enqueue(message(&clock, DEFAULT_QUEUE)).await.unwrap();
        let lanes = queues(&[DEFAULT_QUEUE]);

        let claimed = store.dequeue(&lanes, 1, "w1", LEASE).await.unwrap();
        let state = store.fail(&claimed[0].lease, "boom").await.unwrap();
        assert_eq!(state, TaskState::Retry);

        assert!(store.dequeue(&lanes, 1, "w1", LEASE).await.unwrap().is_empty());
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(store.dequeue(&lanes, 1, "w1", LEASE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn archive_skips_retry_budget() {
        let (store, clock) = store_with_clock();
        let mut msg = message(&clock, DEFAULT_QUEUE);
        msg.max_retry = 10;
        let info = store.enqueue(msg).await.unwrap();

        let claimed = store.dequeue(&queues(&[DEFAULT_QUEUE]), 1, "w1", LEASE).await.unwrap();
        store.archive(&claimed[0].lease, "bad payload").await.unwrap();

        let stored = store.get_task(info.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Archived);
        assert_eq!(stored.retry_count, 0);

        clock.advance(chrono::Duration::hours(1));
        assert!(store.dequeue(&queues(&[DEFAULT_QUEUE]), 1, "w1", LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_lease_is_reaped_exactly_once() {
        let (store, clock) = store_with_clock();
        let info = store.enqueue(message(&clock, DEFAULT_QUEUE)).await.unwrap();
        let lanes = queues(&[DEFAULT_QUEUE]);

        let claimed = store.dequeue(&lanes, 1, "w1", LEASE).await.unwrap();
        let lease = claimed[0].lease.clone();

        clock.advance(chrono::Duration::seconds(31));
        assert!(store.renew_lease(&lease, LEASE).await.unwrap_err().is_lease_expired());

        assert_eq!(store.reap_expired_leases().await.unwrap(), 1);
        assert_eq!(store.reap_expired_leases().await.unwrap(), 0);

        let stored = store.get_task(info.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Retry);
        assert_eq!(stored.retry_count, 1);

        let again = store.dequeue(&lanes, 5, "w2", LEASE).await.unwrap();
        assert_eq!(again.len(), 1);
        assert!(store.dequeue(&lanes, 5, "w2", LEASE).await.unwrap().is_empty());

        // the first worker's lease is gone for good
        assert!(store.ack(&lease).await.unwrap_err().is_lease_expired());
        store.ack(&again[0].lease).await.unwrap();
    }

    #[tokio::test]
    async fn renewal_keeps_lease_alive() {
        let (store, clock) = store_with_clock();
        store.enqueue(message(&clock, DEFAULT_QUEUE)).await.unwrap();
        let claimed = store.dequeue(&queues(&[DEFAULT_QUEUE]), 1, "w1", LEASE).await.unwrap();
        let lease = claimed[0].lease.clone();

        for _ in 0..3 {
            clock.advance(chrono::Duration::seconds(20));
            store.renew_lease(&lease, LEASE).await.unwrap();
        }
        assert_eq!(store.reap_expired_leases().await.unwrap(), 0);
        store.ack(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn lease_uses_task_timeout() {
        let (store, clock) = store_with_clock();
        let mut msg = message(&clock, DEFAULT_QUEUE);
        msg.timeout = Some(Duration::from_secs(10));
        store.enqueue(msg).await.unwrap();

        let claimed = store.dequeue(&queues(&[DEFAULT_QUEUE]), 1, "w1", LEASE).await.unwrap();
        assert_eq!(
            claimed[0].lease.expires_at,
            clock.now() + chrono::Duration::seconds(10)
        );
    }

    #[tokio::test]
    async fn unrepresentable_lease_archives_instead_of_stranding() {
        let (store, clock) = store_with_clock();
        let mut msg = message(&clock, DEFAULT_QUEUE);
        msg.timeout = Some(Duration::from_secs(10_000_000_000_000));
        msg.unique_key = Some("report:42".to_string());
        let bad = store.enqueue(msg).await.unwrap();
        let good = store.enqueue(message(&clock, DEFAULT_QUEUE)).await.unwrap();
        let lanes = queues(&[DEFAULT_QUEUE]);

        let claimed = store.dequeue(&lanes, 2, "w1", LEASE).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].message.id, good.id);

        let stored = store.get_task(bad.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Archived);
        assert!(stored.last_error.unwrap().contains("out of range"));

        // the unique key went with it
        let mut again = message(&clock, DEFAULT_QUEUE);
        again.unique_key = Some("report:42".to_string());
        store.enqueue(again).await.unwrap();
    }

    #[tokio::test]
    async fn finished_tasks_are_dropped_after_retention() {
        let (store, clock) = store_with_clock();
        let store = store.with_retention(Retention {
            completed: Duration::from_secs(60),
            archived: Duration::from_secs(600),
        });
        let lanes = queues(&[DEFAULT_QUEUE]);

        let mut completed = Vec::new();
        for _ in 0..20 {
            let info = store.enqueue(message(&clock, DEFAULT_QUEUE)).await.unwrap();
            let claimed = store.dequeue(&lanes, 1, "w1", LEASE).await.unwrap();
            store.ack(&claimed[0].lease).await.unwrap();
            completed.push(info.id);
        }
        let archived = store.enqueue(message(&clock, DEFAULT_QUEUE)).await.unwrap();
        let claimed = store.dequeue(&lanes, 1, "w1", LEASE).await.unwrap();
        store.archive(&claimed[0].lease, "bad payload").await.unwrap();

        clock.advance(chrono::Duration::seconds(59));
        store.reap_expired_leases().await.unwrap();
        assert_eq!(store.queue_stats(DEFAULT_QUEUE).await.unwrap().completed, 20);

        clock.advance(chrono::Duration::seconds(1));
        store.reap_expired_leases().await.unwrap();
        let stats = store.queue_stats(DEFAULT_QUEUE).await.unwrap();
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.archived, 1);
        for id in completed {
            assert!(store.get_task(id).await.unwrap().is_none());
        }

        clock.advance(chrono::Duration::minutes(10));
        store.reap_expired_leases().await.unwrap();
        assert!(store.get_task(archived.id).await.unwrap().is_none());
        assert_eq!(store.state.lock().await.tasks.len(), 0);
    }

    #[tokio::test]
    async fn zero_retention_keeps_finished_tasks() {
        let (store, clock) = store_with_clock();
        let store = store.with_retention(Retention {
            completed: Duration::ZERO,
            archived: Duration::ZERO,
        });
        let info = store.enqueue(message(&clock, DEFAULT_QUEUE)).await.unwrap();
        let claimed = store.dequeue(&queues(&[DEFAULT_QUEUE]), 1, "w1", LEASE).await.unwrap();
        store.ack(&claimed[0].lease).await.unwrap();

        clock.advance(chrono::Duration::days(365));
        store.reap_expired_leases().await.unwrap();
        assert!(store.get_task(info.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unique_key_blocks_until_terminal() {
        let (store, clock) = store_with_clock();
        let mut first = message(&clock, DEFAULT_QUEUE);
        first.unique_key = Some("report:42".to_string());
        store.enqueue(first).await.unwrap();

        let mut second = message(&clock, DEFAULT_QUEUE);
        second.unique_key = Some("report:42".to_string());
        let err = store.enqueue(second.clone()).await.unwrap_err();
        assert!(matches!(err, TaskError::DuplicateTask { .. }));

        let claimed = store.dequeue(&queues(&[DEFAULT_QUEUE]), 1, "w1", LEASE).await.unwrap();
        store.ack(&claimed[0].lease).await.unwrap();
        store.enqueue(second).await.unwrap();
    }

    #[tokio::test]
    async fn requeue_puts_task_back_at_the_front() {
        let (store, clock) = store_with_clock();
        let first = store.enqueue(message(&clock, DEFAULT_QUEUE)).await.unwrap();
        store.enqueue(message(&clock, DEFAULT_QUEUE)).await.unwrap();
        let lanes = queues(&[DEFAULT_QUEUE]);

        let claimed = store.dequeue(&lanes, 1, "w1", LEASE).await.unwrap();
        store.requeue(&claimed[0].lease).await.unwrap();

        let again = store.dequeue(&lanes, 1, "w2", LEASE).await.unwrap();
        assert_eq!(again[0].message.id, first.id);
        assert_eq!(again[0].message.retry_count, 0);
    }

    #[tokio::test]
    async fn two_workers_race_for_one_task() {
        let store = Arc::new(MemoryStore::new());
        store
            .enqueue(TaskMessage::new(&Task::new("t", Vec::new()), DEFAULT_QUEUE.to_string(), Utc::now()))
            .await
            .unwrap();

        let lanes = queues(&[DEFAULT_QUEUE]);
        let a = tokio::spawn({
            let (store, lanes) = (store.clone(), lanes.clone());
            async move { store.dequeue(&lanes, 1, "a", LEASE).await.unwrap().len() }
        });
        let b = tokio::spawn({
            let (store, lanes) = (store.clone(), lanes.clone());
            async move { store.dequeue(&lanes, 1, "b", LEASE).await.unwrap().len() }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a + b, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dequeue_never_double_claims() {
        let store = Arc::new(MemoryStore::new());
        for _ in 0..200 {
            store
                .enqueue(TaskMessage::new(&Task::new("t", Vec::new()), DEFAULT_QUEUE.to_string(), Utc::now()))
                .await
                .unwrap();
        }

        let lanes = queues(&[DEFAULT_QUEUE]);
        let mut workers = Vec::new();
        for w in 0..8 {
            let (store, lanes) = (store.clone(), lanes.clone());
            workers.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                loop {
                    let claimed = store.dequeue(&lanes, 3, &format!("w{w}"), LEASE).await.unwrap();
                    if claimed.is_empty() {
                        break;
                    }
                    ids.extend(claimed.into_iter().map(|c| c.message.id));
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for worker in workers {
            for id in worker.await.unwrap() {
                assert!(seen.insert(id), "task {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 200);
    }

    #[tokio::test]
    async fn stats_count_states_per_queue() {
        let (store, clock) = store_with_clock();
        store.enqueue(message(&clock, "low")).await.unwrap();
        store.enqueue(message(&clock, "low")).await.unwrap();
        let mut later = message(&clock, "low");
        later.process_at = clock.now() + chrono::Duration::minutes(1);
        store.enqueue(later).await.unwrap();
        store.enqueue(message(&clock, "critical")).await.unwrap();

        let claimed = store.dequeue(&queues(&["low"]), 1, "w1", LEASE).await.unwrap();
        store.ack(&claimed[0].lease).await.unwrap();

        let stats = store.queue_stats("low").await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(store.list_queues().await.unwrap(), vec!["critical", "low"]);
    }
}
