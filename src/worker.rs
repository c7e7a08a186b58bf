//! Worker implementation for processing tasks
//!
//! A worker claims tasks from weighted queues, runs each one in its own tokio
//! task under a lease, and reports the outcome back to the store. Control
//! arrives as messages through a [`WorkerHandle`].

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};
use crate::mux::{HandlerTable, TaskContext, TaskHandlerRegistry};
use crate::store::{ClaimedTask, Lease, TaskStore};
use crate::task::{checked_offset, Task, TaskState, DEFAULT_QUEUE};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifies this worker in leases and logs
    pub worker_id: String,
    /// Queue names and their relative weights
    pub queues: HashMap<String, u32>,
    /// Always drain higher-weight queues first
    pub strict_priority: bool,
    /// Maximum number of concurrent tasks
    pub concurrency: usize,
    /// Polling interval when queues were busy, in milliseconds
    pub polling_interval_ms: u64,
    /// Idle polling backs off up to this interval, in milliseconds
    pub max_polling_interval_ms: u64,
    /// Lease length for tasks without a timeout
    pub lease_duration: Duration,
    /// How long a graceful shutdown waits for running tasks
    pub shutdown_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// How often due scheduled and retry tasks are forwarded
    pub forward_interval: Duration,
    /// How often expired leases are reaped
    pub reaper_interval: Duration,
    /// Consecutive failed polls before the worker gives up
    pub max_store_errors: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            queues: HashMap::from([(DEFAULT_QUEUE.to_string(), 1)]),
            strict_priority: false,
            concurrency: 10,
            polling_interval_ms: 100,
            max_polling_interval_ms: 1000,
            lease_duration: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(8),
            heartbeat_interval: Duration::from_secs(5),
            forward_interval: Duration::from_secs(1),
            reaper_interval: Duration::from_secs(5),
            max_store_errors: 10,
        }
    }
}

impl WorkerConfig {
    /// Replace the queue set
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(|(name, weight)| (name.into(), weight)).collect();
        self
    }

    pub fn validate(&self) -> TaskResult<()> {
        if self.queues.is_empty() {
            return Err(TaskError::config("worker needs at least one queue"));
        }
        if let Some((name, _)) = self.queues.iter().find(|(_, weight)| **weight == 0) {
            return Err(TaskError::config(format!("queue {:?} has weight 0", name)));
        }
        if self.concurrency == 0 {
            return Err(TaskError::config("concurrency must be at least 1"));
        }
        if self.polling_interval_ms == 0 || self.max_polling_interval_ms < self.polling_interval_ms {
            return Err(TaskError::config(
                "polling interval must be positive and no larger than the maximum",
            ));
        }
        if self.lease_duration.is_zero() || checked_offset(Utc::now(), self.lease_duration).is_none() {
            return Err(TaskError::config("lease duration must be positive and representable"));
        }
        if self.max_store_errors == 0 {
            return Err(TaskError::config("max_store_errors must be at least 1"));
        }
        Ok(())
    }
}

/// Worker statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Attempts that ran to an outcome
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Failed attempts that were scheduled for another try
    pub retried: u64,
    pub archived: u64,
    pub active: usize,
    pub average_execution_time_ms: f64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            processed: 0,
            succeeded: 0,
            failed: 0,
            retried: 0,
            archived: 0,
            active: 0,
            average_execution_time_ms: 0.0,
            last_heartbeat: None,
            started_at: Utc::now(),
        }
    }
}

impl WorkerStats {
    fn record_execution(&mut self, elapsed: Duration) {
        self.processed += 1;
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.average_execution_time_ms +=
            (elapsed_ms - self.average_execution_time_ms) / self.processed as f64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlMessage {
    Pause,
    Resume,
    /// Stop claiming, let running tasks finish within the shutdown timeout
    Shutdown,
    /// Cancel running tasks and give them back immediately
    Stop,
}

/// Cloneable remote control for a running worker
#[derive(Clone)]
pub struct WorkerHandle {
    control: mpsc::UnboundedSender<ControlMessage>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop claiming new tasks; running tasks continue
    pub fn pause(&self) {
        self.send(ControlMessage::Pause);
    }

    pub fn resume(&self) {
        self.send(ControlMessage::Resume);
    }

    /// Graceful shutdown
    pub fn shutdown(&self) {
        self.send(ControlMessage::Shutdown);
    }

    /// Immediate shutdown; running tasks are cancelled and requeued
    pub fn stop(&self) {
        self.send(ControlMessage::Stop);
    }

    pub async fn stats(&self) -> WorkerStats {
        self.stats.lock().await.clone()
    }

    fn send(&self, message: ControlMessage) {
        if self.control.send(message).is_err() {
            debug!("Worker already stopped, dropping {:?}", message);
        }
    }
}

/// Everything a running task needs, shared across slots
struct Dispatch {
    store: Arc<dyn TaskStore>,
    handlers: HandlerTable,
    stats: Arc<Mutex<WorkerStats>>,
    worker_id: String,
    default_lease: Duration,
}

/// How an attempt ended before the store is told about it
enum Outcome {
    Finished(Result<TaskResult<()>, tokio::task::JoinError>),
    TimedOut(Duration),
    LeaseLost,
    Cancelled,
}

/// Worker for processing tasks from the queue
pub struct Worker {
    config: WorkerConfig,
    dispatch: Arc<Dispatch>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
}

impl Worker {
    /// Create a new worker. Middleware is composed into the handler chain here.
    pub fn new(config: WorkerConfig, store: Arc<dyn TaskStore>, registry: TaskHandlerRegistry) -> TaskResult<Self> {
        config.validate()?;
        let handlers = registry.compose();
        if handlers.is_empty() {
            warn!("Worker {} has no registered handlers", config.worker_id);
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let dispatch = Arc::new(Dispatch {
            store,
            handlers,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            worker_id: config.worker_id.clone(),
            default_lease: config.lease_duration,
        });

        Ok(Self {
            config,
            dispatch,
            control_tx,
            control_rx,
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            control: self.control_tx.clone(),
            stats: self.dispatch.stats.clone(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until shut down through a [`WorkerHandle`].
    ///
    /// Returns the store error if polling failed `max_store_errors` times in a row.
    pub async fn run(mut self) -> TaskResult<()> {
        info!(
            "Starting worker {} for queues {:?} with concurrency {}",
            self.config.worker_id, self.config.queues, self.config.concurrency
        );
        {
            let mut stats = self.dispatch.stats.lock().await;
            stats.started_at = Utc::now();
        }

        let background = CancellationToken::new();
        let mut loops = JoinSet::new();
        self.spawn_background_loops(&mut loops, &background);

        let slots = Arc::new(Semaphore::new(self.config.concurrency));
        let abort = CancellationToken::new();
        let mut inflight: JoinSet<()> = JoinSet::new();

        let min_wait = Duration::from_millis(self.config.polling_interval_ms);
        let max_wait = Duration::from_millis(self.config.max_polling_interval_ms);
        let mut idle_wait = min_wait;
        let mut paused = false;
        let mut store_errors = 0;

        let (result, graceful) = loop {
            let mut wait = idle_wait;

            if !paused && slots.available_permits() > 0 {
                match self.claim(slots.available_permits()).await {
                    Ok(claimed) => {
                        store_errors = 0;
                        if claimed.is_empty() {
                            idle_wait = (idle_wait * 2).min(max_wait);
                        } else {
                            idle_wait = min_wait;
                            wait = Duration::ZERO;
                            for task in claimed {
                                self.start_task(task, &slots, &abort, &mut inflight).await;
                            }
                        }
                    }
                    Err(e) => {
                        store_errors += 1;
                        error!(
                            "Worker {} failed to poll ({}/{}): {}",
                            self.config.worker_id, store_errors, self.config.max_store_errors, e
                        );
                        if store_errors >= self.config.max_store_errors {
                            break (Err(e), false);
                        }
                        idle_wait = (idle_wait * 2).min(max_wait);
                    }
                }
            } else {
                // paused, or every slot is busy
                wait = max_wait;
            }

            self.dispatch.stats.lock().await.active = inflight.len();

            tokio::select! {
                message = self.control_rx.recv() => match message {
                    Some(ControlMessage::Pause) => {
                        info!("Worker {} paused", self.config.worker_id);
                        paused = true;
                    }
                    Some(ControlMessage::Resume) => {
                        info!("Worker {} resumed", self.config.worker_id);
                        paused = false;
                        idle_wait = min_wait;
                    }
                    Some(ControlMessage::Shutdown) => break (Ok(()), true),
                    Some(ControlMessage::Stop) | None => break (Ok(()), false),
                },
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = joined {
                        error!("Task slot ended abnormally: {}", e);
                    }
                    idle_wait = min_wait;
                }
                _ = sleep(wait) => {}
            }
        };

        if graceful && !inflight.is_empty() {
            info!(
                "Worker {} waiting up to {:?} for {} running task(s)",
                self.config.worker_id,
                self.config.shutdown_timeout,
                inflight.len()
            );
            let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
                while inflight.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    "Worker {} shutdown timeout elapsed, cancelling {} task(s)",
                    self.config.worker_id,
                    inflight.len()
                );
            }
        }

        abort.cancel();
        while inflight.join_next().await.is_some() {}

        background.cancel();
        while loops.join_next().await.is_some() {}

        self.dispatch.stats.lock().await.active = 0;
        info!("Worker {} shut down complete", self.config.worker_id);
        result
    }

    /// Run until SIGINT or SIGTERM (graceful shutdown). SIGTSTP pauses the worker.
    pub async fn run_until_signal(self) -> TaskResult<()> {
        let handle = self.handle();
        let signals = tokio::spawn(async move {
            if let Err(e) = forward_signals(handle).await {
                error!("Failed to install signal handlers: {}", e);
            }
        });

        let result = self.run().await;
        signals.abort();
        result
    }

    /// Claim up to `free` tasks: one per queue first, then by weight
    async fn claim(&self, free: usize) -> TaskResult<Vec<ClaimedTask>> {
        let store = &self.dispatch.store;
        let worker_id = &self.config.worker_id;
        let lease = self.config.lease_duration;
        let mut claimed = Vec::new();

        if !self.config.strict_priority && self.config.queues.len() > 1 {
            let mut names: Vec<String> = self.config.queues.keys().cloned().collect();
            names.shuffle(&mut rand::thread_rng());
            for name in names {
                if claimed.len() >= free {
                    break;
                }
                claimed.extend(store.dequeue(&[name], 1, worker_id, lease).await?);
            }
        }

        while claimed.len() < free {
            let order = queue_order(&self.config.queues, self.config.strict_priority);
            let batch = if self.config.strict_priority { free - claimed.len() } else { 1 };
            let got = store.dequeue(&order, batch, worker_id, lease).await?;
            if got.is_empty() {
                break;
            }
            claimed.extend(got);
        }

        Ok(claimed)
    }

    async fn start_task(
        &self,
        claimed: ClaimedTask,
        slots: &Arc<Semaphore>,
        abort: &CancellationToken,
        inflight: &mut JoinSet<()>,
    ) {
        match slots.clone().try_acquire_owned() {
            Ok(permit) => {
                let dispatch = self.dispatch.clone();
                let abort = abort.clone();
                inflight.spawn(process_task(dispatch, claimed, abort, permit));
            }
            Err(_) => {
                warn!("No free slot for task {}, requeueing", claimed.message.id);
                if let Err(e) = self.dispatch.store.requeue(&claimed.lease).await {
                    error!("Failed to requeue task {}: {}", claimed.message.id, e);
                }
            }
        }
    }

    fn spawn_background_loops(&self, loops: &mut JoinSet<()>, stop: &CancellationToken) {
        let store = self.dispatch.store.clone();
        let token = stop.clone();
        let period = self.config.forward_interval;
        loops.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match store.forward_due().await {
                    Ok(0) => {}
                    Ok(moved) => debug!("Forwarded {} due task(s)", moved),
                    Err(e) => error!("Failed to forward due tasks: {}", e),
                }
            }
        });

        let store = self.dispatch.store.clone();
        let token = stop.clone();
        let period = self.config.reaper_interval;
        loops.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match store.reap_expired_leases().await {
                    Ok(0) => {}
                    Ok(reaped) => info!("Recovered {} task(s) with expired leases", reaped),
                    Err(e) => error!("Failed to reap expired leases: {}", e),
                }
            }
        });

        let stats = self.dispatch.stats.clone();
        let token = stop.clone();
        let period = self.config.heartbeat_interval;
        let worker_id = self.config.worker_id.clone();
        loops.spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let mut stats = stats.lock().await;
                stats.last_heartbeat = Some(Utc::now());
                debug!(
                    "Worker {} heartbeat: {} active, {} processed",
                    worker_id, stats.active, stats.processed
                );
            }
        });
    }
}

/// Queue walk order for one claim
fn queue_order(queues: &HashMap<String, u32>, strict_priority: bool) -> Vec<String> {
    if strict_priority || queues.len() == 1 {
        let mut names: Vec<(&String, &u32)> = queues.iter().collect();
        names.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        return names.into_iter().map(|(name, _)| name.clone()).collect();
    }

    // one ticket per unit of weight, shuffled, first occurrence wins
    let mut tickets: Vec<&String> = queues
        .iter()
        .flat_map(|(name, weight)| std::iter::repeat(name).take(*weight as usize))
        .collect();
    tickets.shuffle(&mut rand::thread_rng());

    let mut order: Vec<String> = Vec::with_capacity(queues.len());
    for name in tickets {
        if !order.contains(name) {
            order.push(name.clone());
        }
        if order.len() == queues.len() {
            break;
        }
    }
    order
}

/// Run one claimed task to an outcome and report it to the store
async fn process_task(
    dispatch: Arc<Dispatch>,
    claimed: ClaimedTask,
    abort: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let ClaimedTask { message, lease } = claimed;
    let task_id = message.id;
    let now = Utc::now();

    let Some(handler) = dispatch.handlers.get(&message.task_type) else {
        let err = TaskError::UnknownTaskType {
            task_type: message.task_type.clone(),
        };
        error!("Task {}: {}", task_id, err);
        archive(&dispatch, &lease, &err.to_string()).await;
        return;
    };

    if message.is_past_deadline(now) {
        warn!("Task {} missed its deadline before it started", task_id);
        archive(&dispatch, &lease, "deadline exceeded").await;
        return;
    }

    // The attempt ends at the earlier of timeout and deadline
    let timeout_at = message.timeout.and_then(|timeout| checked_offset(now, timeout));
    let stop_at = match (timeout_at, message.deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    let limit = stop_at.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO));

    let cancel = CancellationToken::new();
    let ctx = TaskContext::new(
        task_id,
        message.queue.clone(),
        message.retry_count,
        message.max_retry,
        stop_at,
        cancel.clone(),
    );
    let task = Task::from(&message);

    let lease_length = message.lease_duration(dispatch.default_lease);
    let lost = CancellationToken::new();
    let keeper_done = CancellationToken::new();
    let keeper = tokio::spawn(keep_lease(
        dispatch.store.clone(),
        lease.clone(),
        lease_length,
        lost.clone(),
        keeper_done.clone(),
    ));

    debug!("Task {} ({}) started on {}", task_id, message.task_type, dispatch.worker_id);
    let started = Instant::now();
    let mut running = tokio::spawn(async move { handler.handle(ctx, task).await });

    let timer = async {
        match limit {
            Some(limit) => sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        joined = &mut running => Outcome::Finished(joined),
        _ = timer => Outcome::TimedOut(limit.unwrap_or_default()),
        _ = lost.cancelled() => Outcome::LeaseLost,
        _ = abort.cancelled() => Outcome::Cancelled,
    };
    let elapsed = started.elapsed();

    if !matches!(outcome, Outcome::Finished(_)) {
        cancel.cancel();
        running.abort();
    }
    keeper_done.cancel();
    let _ = keeper.await;

    match outcome {
        Outcome::Finished(Ok(Ok(()))) => {
            dispatch.stats.lock().await.record_execution(elapsed);
            match dispatch.store.ack(&lease).await {
                Ok(()) => {
                    dispatch.stats.lock().await.succeeded += 1;
                    info!("Task {} completed successfully in {:?}", task_id, elapsed);
                }
                Err(e) => report_store_error(task_id, "ack", e),
            }
        }
        Outcome::Finished(Ok(Err(e))) if e.is_skip_retry() => {
            dispatch.stats.lock().await.record_execution(elapsed);
            warn!("Task {} asked to skip retries: {}", task_id, e);
            archive(&dispatch, &lease, &e.to_string()).await;
        }
        Outcome::Finished(Ok(Err(e))) => {
            dispatch.stats.lock().await.record_execution(elapsed);
            error!("Task {} failed: {}", task_id, e);
            fail(&dispatch, &lease, &e.to_string()).await;
        }
        Outcome::Finished(Err(join_error)) => {
            dispatch.stats.lock().await.record_execution(elapsed);
            let reason = if join_error.is_panic() {
                "task handler panicked".to_string()
            } else {
                format!("task handler aborted: {}", join_error)
            };
            error!("Task {}: {}", task_id, reason);
            fail(&dispatch, &lease, &reason).await;
        }
        Outcome::TimedOut(limit) => {
            dispatch.stats.lock().await.record_execution(elapsed);
            let err = TaskError::timeout(format!("task execution after {:?}", limit));
            error!("Task {} timed out after {:?}", task_id, limit);
            fail(&dispatch, &lease, &err.to_string()).await;
        }
        Outcome::LeaseLost => {
            // another worker may own the task now
            warn!("Task {} lost its lease, abandoning the attempt", task_id);
        }
        Outcome::Cancelled => match dispatch.store.requeue(&lease).await {
            Ok(()) => info!("Task {} cancelled by shutdown and requeued", task_id),
            Err(e) => report_store_error(task_id, "requeue", e),
        },
    }
}

async fn fail(dispatch: &Dispatch, lease: &Lease, reason: &str) {
    match dispatch.store.fail(lease, reason).await {
        Ok(state) => {
            let mut stats = dispatch.stats.lock().await;
            stats.failed += 1;
            if state == TaskState::Retry {
                stats.retried += 1;
                debug!("Task {} scheduled for retry", lease.task_id);
            } else {
                stats.archived += 1;
                warn!("Task {} archived after exhausting retries", lease.task_id);
            }
        }
        Err(e) => report_store_error(lease.task_id, "fail", e),
    }
}

async fn archive(dispatch: &Dispatch, lease: &Lease, reason: &str) {
    match dispatch.store.archive(lease, reason).await {
        Ok(()) => dispatch.stats.lock().await.archived += 1,
        Err(e) => report_store_error(lease.task_id, "archive", e),
    }
}

fn report_store_error(task_id: Uuid, operation: &str, e: TaskError) {
    if e.is_lease_expired() {
        warn!("Task {} lease expired before {}, outcome dropped", task_id, operation);
    } else {
        error!("Failed to {} task {}: {}", operation, task_id, e);
    }
}

/// Renew `lease` every third of its length until `done`; cancel `lost` once it cannot be kept
async fn keep_lease(
    store: Arc<dyn TaskStore>,
    mut lease: Lease,
    length: Duration,
    lost: CancellationToken,
    done: CancellationToken,
) {
    let period = (length / 3).max(Duration::from_millis(10));
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = sleep(period) => {}
        }
        match store.renew_lease(&lease, length).await {
            Ok(expires_at) => {
                lease.expires_at = expires_at;
                debug!("Renewed lease on task {} until {}", lease.task_id, expires_at);
            }
            Err(e) if e.is_recoverable() => {
                warn!("Failed to renew lease on task {}: {}", lease.task_id, e)
            }
            Err(e) => {
                // the lease cannot be kept, so it will lapse
                if !e.is_lease_expired() {
                    error!("Giving up the lease on task {}: {}", lease.task_id, e);
                }
                lost.cancel();
                break;
            }
        }
    }
}

#[cfg(unix)]
async fn forward_signals(handle: WorkerHandle) -> TaskResult<()> {
    use tokio::signal::unix::{signal, SignalKind};

    #[cfg(target_os = "linux")]
    const SIGTSTP: i32 = 20;
    #[cfg(not(target_os = "linux"))]
    const SIGTSTP: i32 = 18;

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut stop = signal(SignalKind::from_raw(SIGTSTP))?;

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("Received SIGINT, shutting down");
                handle.shutdown();
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down");
                handle.shutdown();
            }
            _ = stop.recv() => {
                info!("Received SIGTSTP, no longer claiming new tasks");
                handle.pause();
            }
        }
    }
}

#[cfg(not(unix))]
async fn forward_signals(handle: WorkerHandle) -> TaskResult<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");
    handle.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{EnqueueOptions, TaskClient};
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    fn queues() -> HashMap<String, u32> {
        HashMap::from([
            ("critical".to_string(), 6),
            ("default".to_string(), 3),
            ("low".to_string(), 1),
        ])
    }

    #[test]
    fn strict_order_follows_weights() {
        assert_eq!(queue_order(&queues(), true), vec!["critical", "default", "low"]);
    }

    #[test]
    fn weighted_order_lists_each_queue_once() {
        for _ in 0..50 {
            let order = queue_order(&queues(), false);
            assert_eq!(order.len(), 3);
            let unique: HashSet<&String> = order.iter().collect();
            assert_eq!(unique.len(), 3);
        }
    }

    #[test]
    fn weighted_order_favors_heavier_queues() {
        let mut first = HashMap::new();
        for _ in 0..2000 {
            let order = queue_order(&queues(), false);
            *first.entry(order[0].clone()).or_insert(0) += 1;
        }
        assert!(first["critical"] > first["default"]);
        assert!(first["default"] > first.get("low").copied().unwrap_or(0));
    }

    #[test]
    fn config_validation() {
        assert!(WorkerConfig::default().validate().is_ok());

        let zero_weight = WorkerConfig::default().with_queues([("default", 0)]);
        assert!(matches!(zero_weight.validate(), Err(TaskError::Config { .. })));

        let no_slots = WorkerConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(no_slots.validate().is_err());

        let no_queues = WorkerConfig::default().with_queues(Vec::<(String, u32)>::new());
        assert!(no_queues.validate().is_err());

        let endless_lease = WorkerConfig {
            lease_duration: Duration::MAX,
            ..Default::default()
        };
        assert!(matches!(endless_lease.validate(), Err(TaskError::Config { .. })));
    }

    #[tokio::test]
    async fn unknown_task_type_is_archived() {
        let store = Arc::new(MemoryStore::new());
        let client = TaskClient::from_store(store.clone());
        let info = client
            .enqueue(&Task::new("sms:send", Vec::new()), EnqueueOptions::new())
            .await
            .unwrap();

        let mut registry = TaskHandlerRegistry::new();
        registry.register_fn("email:deliver", |_, _| async { Ok(()) }).unwrap();
        let config = WorkerConfig {
            polling_interval_ms: 10,
            max_polling_interval_ms: 20,
            ..Default::default()
        };
        let worker = Worker::new(config, store.clone(), registry).unwrap();
        let handle = worker.handle();
        let running = tokio::spawn(worker.run());

        let mut state = TaskState::Pending;
        for _ in 0..100 {
            state = store.get_task(info.id).await.unwrap().unwrap().state;
            if state == TaskState::Archived {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown();
        running.await.unwrap().unwrap();

        assert_eq!(state, TaskState::Archived);
        let stored = store.get_task(info.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 0);
        assert!(stored.last_error.unwrap().contains("sms:send"));
        assert_eq!(handle.stats().await.archived, 1);
    }
}
