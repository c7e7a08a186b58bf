//! Task scheduler for periodic tasks
//!
//! Entries pair a schedule with a task template. The driver sleeps until the
//! earliest entry is due and enqueues a fresh envelope for every due entry.
//! Missed firings are not backfilled: the next run is always computed from
//! the moment an entry fired.

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{EnqueueOptions, TaskClient};
use crate::error::{TaskError, TaskResult};
use crate::task::{checked_offset, Task, TaskId};

/// Unique identifier for scheduler entries
pub type EntryId = Uuid;

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A parsed recurring rule
#[derive(Debug, Clone)]
pub enum ScheduleExpression {
    /// Five-field cron expression or descriptor, in UTC.
    ///
    /// Fires at the earliest time any of `schedules` matches.
    Cron {
        expression: String,
        schedules: Vec<CronSchedule>,
    },
    /// Fixed interval
    Every(Duration),
}

impl ScheduleExpression {
    /// Parse `min hour dom month dow`, an `@descriptor`, or `@every <duration>`
    pub fn parse(spec: &str) -> TaskResult<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(TaskError::validation("schedule must not be empty"));
        }

        if let Some(rest) = spec.strip_prefix("@every") {
            let rest = rest.trim();
            let interval = humantime::parse_duration(rest)
                .map_err(|e| TaskError::validation(format!("invalid interval {:?}: {}", rest, e)))?;
            if interval.is_zero() {
                return Err(TaskError::validation("interval must be greater than zero"));
            }
            return Ok(Self::Every(interval));
        }

        let expression = match spec {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other if other.starts_with('@') => {
                return Err(TaskError::validation(format!("unknown descriptor {:?}", other)));
            }
            other => other,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(TaskError::validation(format!(
                "cron expression {:?} must have 5 fields, found {}",
                expression,
                fields.len()
            )));
        }

        // The cron crate wants seconds and years, and numbers its weekdays from 1
        let (minute, hour, day_of_month, month) = (fields[0], fields[1], fields[2], fields[3]);
        let day_of_week = normalize_day_of_week(fields[4])?;

        // With both day fields restricted, a day matching either one fires.
        // The cron crate requires both, so each field gets its own schedule.
        let day_rules = if is_wildcard(day_of_month) || is_wildcard(fields[4]) {
            vec![(day_of_month, day_of_week.as_str())]
        } else {
            vec![(day_of_month, "*"), ("*", day_of_week.as_str())]
        };

        let schedules = day_rules
            .into_iter()
            .map(|(dom, dow)| {
                let cron_expr = format!("0 {} {} {} {} {} *", minute, hour, dom, month, dow);
                CronSchedule::from_str(&cron_expr)
                    .map_err(|e| TaskError::validation(format!("invalid cron expression {:?}: {}", spec, e)))
            })
            .collect::<TaskResult<Vec<_>>>()?;

        Ok(Self::Cron {
            expression: spec.to_string(),
            schedules,
        })
    }

    /// First firing strictly after `from`
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron { schedules, .. } => schedules
                .iter()
                .filter_map(|schedule| schedule.after(&from).next())
                .min(),
            Self::Every(interval) => checked_offset(from, *interval),
        }
    }
}

impl fmt::Display for ScheduleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron { expression, .. } => f.write_str(expression),
            Self::Every(interval) => write!(f, "@every {}", humantime::format_duration(*interval)),
        }
    }
}

/// A day field that places no restriction on its own
fn is_wildcard(field: &str) -> bool {
    matches!(field, "*" | "?" | "*/1")
}

/// Rewrite a standard day-of-week field (0-7, 0 and 7 are Sunday) as day names
fn normalize_day_of_week(field: &str) -> TaskResult<String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let invalid = || TaskError::validation(format!("invalid day-of-week field {:?}", field));
    let mut days = BTreeSet::new();

    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: usize = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (day_value(lo).ok_or_else(invalid)?, day_value(hi).ok_or_else(invalid)?)
        } else {
            let day = day_value(range).ok_or_else(invalid)?;
            // `n/step` runs to the end of the week
            (day, if step.is_some() { 7 } else { day })
        };
        if start > end {
            return Err(invalid());
        }

        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days.insert(day % 7);
        }
    }

    Ok(days
        .into_iter()
        .map(|day| DAY_NAMES[day as usize])
        .collect::<Vec<_>>()
        .join(","))
}

fn day_value(token: &str) -> Option<u32> {
    if let Ok(day) = token.parse::<u32>() {
        return (day <= 7).then_some(day);
    }
    DAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .map(|index| index as u32)
}

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long the driver sleeps when no entry is registered
    pub idle_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(60),
        }
    }
}

/// A registered entry and its run history
#[derive(Debug, Clone)]
pub struct ScheduledEntry {
    pub id: EntryId,
    pub schedule: ScheduleExpression,
    pub task: Task,
    pub options: EnqueueOptions,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    /// Task enqueued by the most recent successful firing
    pub last_task_id: Option<TaskId>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
}

impl ScheduledEntry {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run.map_or(false, |next| next <= now)
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_entries: usize,
    pub total_runs: u64,
    pub total_failures: u64,
    pub next_run: Option<DateTime<Utc>>,
}

/// Task scheduler for periodic tasks
#[derive(Clone)]
pub struct TaskScheduler {
    client: TaskClient,
    config: SchedulerConfig,
    entries: Arc<RwLock<HashMap<EntryId, ScheduledEntry>>>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
}

impl TaskScheduler {
    /// Create a new task scheduler
    pub fn new(client: TaskClient) -> Self {
        Self::with_config(client, SchedulerConfig::default())
    }

    pub fn with_config(client: TaskClient, config: SchedulerConfig) -> Self {
        Self {
            client,
            config,
            entries: Arc::new(RwLock::new(HashMap::new())),
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register `task` to be enqueued with `options` whenever `spec` fires
    pub async fn register(&self, spec: &str, task: Task, options: EnqueueOptions) -> TaskResult<EntryId> {
        let schedule = ScheduleExpression::parse(spec)?;
        let now = Utc::now();

        // A fixed instant would be reused by every firing
        if options.has_absolute_times() {
            return Err(TaskError::validation(
                "scheduler entries take process_in and timeout, not an absolute process_at or deadline",
            ));
        }
        // Surface bad options now rather than on every firing
        options.build_message(&task, now)?;

        let next_run = schedule
            .next_after(now)
            .ok_or_else(|| TaskError::validation(format!("schedule {:?} never fires", spec)))?;

        let entry = ScheduledEntry {
            id: EntryId::new_v4(),
            schedule,
            task,
            options,
            next_run: Some(next_run),
            last_run: None,
            last_task_id: None,
            last_error: None,
            run_count: 0,
            failure_count: 0,
            created_at: now,
        };
        let id = entry.id;

        info!(
            "Registered scheduler entry {} ({}): {:?}, next run at {}",
            id,
            entry.schedule,
            entry.task.task_type(),
            next_run
        );
        self.entries.write().await.insert(id, entry);
        self.wake.notify_one();
        Ok(id)
    }

    /// Stop future firings of an entry
    pub async fn deregister(&self, id: EntryId) -> TaskResult<()> {
        let removed = self.entries.write().await.remove(&id);
        match removed {
            Some(entry) => {
                info!("Deregistered scheduler entry {} ({})", id, entry.schedule);
                self.wake.notify_one();
                Ok(())
            }
            None => Err(TaskError::scheduler(format!("entry not found: {}", id))),
        }
    }

    pub async fn get_entry(&self, id: EntryId) -> Option<ScheduledEntry> {
        self.entries.read().await.get(&id).cloned()
    }

    /// All entries, soonest first
    pub async fn list_entries(&self) -> Vec<ScheduledEntry> {
        let mut entries: Vec<ScheduledEntry> = self.entries.read().await.values().cloned().collect();
        entries.sort_by_key(|entry| (entry.next_run, entry.created_at));
        entries
    }

    /// Run the driver loop until [`shutdown`](Self::shutdown) is called
    pub async fn run(&self) -> TaskResult<()> {
        info!("Starting task scheduler");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let now = Utc::now();
            let due: Vec<EntryId> = {
                let entries = self.entries.read().await;
                entries
                    .values()
                    .filter(|entry| entry.is_due(now))
                    .map(|entry| entry.id)
                    .collect()
            };
            for id in due {
                self.fire(id).await;
            }

            let wait = match self.earliest_next_run().await {
                Some(next) => (next - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                None => self.config.idle_interval,
            };

            tokio::select! {
                _ = sleep(wait) => {}
                _ = self.wake.notified() => debug!("Scheduler woken early"),
                _ = self.shutdown.cancelled() => break,
            }
        }

        info!("Task scheduler stopped");
        Ok(())
    }

    /// Enqueue a fresh envelope for one entry and advance its next run
    async fn fire(&self, id: EntryId) {
        let template = {
            let entries = self.entries.read().await;
            entries.get(&id).map(|entry| (entry.task.clone(), entry.options.clone()))
        };
        // Deregistered since the due scan
        let Some((task, options)) = template else {
            return;
        };

        let result = self.client.enqueue(&task, options).await;
        let fired_at = Utc::now();

        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };
        entry.last_run = Some(fired_at);
        entry.run_count += 1;
        entry.next_run = entry.schedule.next_after(fired_at);

        match result {
            Ok(info) => {
                debug!(
                    "Scheduler entry {} enqueued task {} to queue {}",
                    id, info.id, info.queue
                );
                entry.last_task_id = Some(info.id);
                entry.last_error = None;
            }
            Err(e @ TaskError::DuplicateTask { .. }) => {
                warn!("Scheduler entry {} skipped: {}", id, e);
                entry.failure_count += 1;
                entry.last_error = Some(e.to_string());
            }
            Err(e) => {
                error!("Scheduler entry {} failed to enqueue: {}", id, e);
                entry.failure_count += 1;
                entry.last_error = Some(e.to_string());
            }
        }
    }

    async fn earliest_next_run(&self) -> Option<DateTime<Utc>> {
        let entries = self.entries.read().await;
        entries.values().filter_map(|entry| entry.next_run).min()
    }

    /// Signal the driver loop to stop
    pub fn shutdown(&self) {
        info!("Shutting down task scheduler");
        self.shutdown.cancel();
        self.wake.notify_one();
    }

    pub async fn get_stats(&self) -> SchedulerStats {
        let entries = self.entries.read().await;
        SchedulerStats {
            total_entries: entries.len(),
            total_runs: entries.values().map(|entry| entry.run_count).sum(),
            total_failures: entries.values().map(|entry| entry.failure_count).sum(),
            next_run: entries.values().filter_map(|entry| entry.next_run).min(),
        }
    }
}
