//! Task store implementation with Redis backend
//!
//! Layout, per queue `q` under the configured prefix:
//! - `{prefix}:{q}:pending` list of ready task ids (LPUSH in, RPOP out)
//! - `{prefix}:{q}:scheduled`, `{prefix}:{q}:retry` sorted by due time (ms)
//! - `{prefix}:{q}:lease` active task ids sorted by lease expiry (ms)
//! - `{prefix}:{q}:archived`, `{prefix}:{q}:completed` sorted by finish time
//! - `{prefix}:t:{id}` hash with the JSON envelope, state and lease token
//!
//! Every mutation runs as a Lua script so it is atomic on the server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue, RedisError, Script, ScriptInvocation};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ClaimedTask, Lease, QueueStats, TaskStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{TaskError, TaskResult};
use crate::task::{checked_offset, RetryConfig, TaskId, TaskInfo, TaskMessage, TaskState};

const LEASE_EXPIRED_ERROR: &str = "lease expired";

/// Tasks forwarded per queue and per call, to keep scripts short
const FORWARD_BATCH: usize = 100;

const ENQUEUE_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
  return {"exists", ""}
end
if ARGV[5] ~= "" then
  local holder = redis.call("GET", ARGV[5])
  if holder then
    return {"duplicate", holder}
  end
  redis.call("SET", ARGV[5], ARGV[1])
end
redis.call("HSET", KEYS[1], "msg", ARGV[2], "state", ARGV[3], "lease_ms", ARGV[7])
if ARGV[3] == "scheduled" then
  redis.call("ZADD", KEYS[2], ARGV[6], ARGV[1])
else
  redis.call("LPUSH", KEYS[2], ARGV[1])
end
redis.call("SADD", KEYS[3], ARGV[4])
return {"ok", ""}
"#;

const DEQUEUE_SCRIPT: &str = r#"
local id = redis.call("RPOP", KEYS[1])
if not id then
  return false
end
local key = ARGV[1] .. id
local msg = redis.call("HGET", key, "msg")
if not msg then
  return {id, "", "0"}
end
local lease_ms = tonumber(redis.call("HGET", key, "lease_ms"))
if not lease_ms or lease_ms <= 0 then
  lease_ms = tonumber(ARGV[5])
end
local expires_at = tonumber(ARGV[2]) + lease_ms
redis.call("HSET", key, "state", "active", "token", ARGV[3], "worker", ARGV[4])
redis.call("ZADD", KEYS[2], expires_at, id)
return {id, msg, string.format("%.0f", expires_at)}
"#;

const FORWARD_SCRIPT: &str = r#"
local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[4]))
for _, id in ipairs(ids) do
  redis.call("LPUSH", KEYS[2], id)
  redis.call("ZREM", KEYS[1], id)
  redis.call("HSET", ARGV[2] .. id, "state", ARGV[3])
end
return #ids
"#;

// An empty token means the caller is the reaper: the lease must have lapsed.
const FINISH_SCRIPT: &str = r#"
local expires_at = redis.call("ZSCORE", KEYS[2], ARGV[1])
if not expires_at then
  return 0
end
if ARGV[2] == "" then
  if tonumber(expires_at) > tonumber(ARGV[3]) then
    return 0
  end
else
  if redis.call("HGET", KEYS[1], "token") ~= ARGV[2] then
    return 0
  end
  if tonumber(expires_at) <= tonumber(ARGV[3]) then
    return 0
  end
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("HSET", KEYS[1], "msg", ARGV[4], "state", ARGV[5])
redis.call("HDEL", KEYS[1], "token", "worker")
if ARGV[7] == "sorted" then
  redis.call("ZADD", KEYS[3], ARGV[6], ARGV[1])
elseif ARGV[7] == "front" then
  redis.call("RPUSH", KEYS[3], ARGV[1])
else
  redis.call("LPUSH", KEYS[3], ARGV[1])
end
if ARGV[8] ~= "" and redis.call("GET", ARGV[8]) == ARGV[1] then
  redis.call("DEL", ARGV[8])
end
local ttl = tonumber(ARGV[9])
if ttl > 0 then
  redis.call("EXPIRE", KEYS[1], ttl)
  redis.call("ZREMRANGEBYSCORE", KEYS[3], "-inf", tonumber(ARGV[3]) - ttl * 1000)
end
return 1
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call("HGET", KEYS[1], "token") ~= ARGV[2] then
  return 0
end
local expires_at = redis.call("ZSCORE", KEYS[2], ARGV[1])
if not expires_at or tonumber(expires_at) <= tonumber(ARGV[3]) then
  return 0
end
redis.call("ZADD", KEYS[2], ARGV[4], ARGV[1])
return 1
"#;

/// Configuration for the Redis store
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Prefix for every key the store writes
    pub key_prefix: String,
    /// Retries for a command that failed on connectivity
    pub max_connect_retries: u32,
    /// Delay before the first connectivity retry, doubled each time
    pub connect_retry_delay_ms: u64,
    /// Completed task TTL in seconds
    pub completed_ttl: u64,
    /// Archived task TTL in seconds
    pub archived_ttl: u64,
    /// Backoff between task retries
    pub retry_config: RetryConfig,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "dtq".to_string(),
            max_connect_retries: 5,
            connect_retry_delay_ms: 100,
            completed_ttl: 86400, // 24 hours
            archived_ttl: 604800, // 7 days
            retry_config: RetryConfig::default(),
        }
    }
}

impl RedisConfig {
    /// Defaults, with the URL taken from `DTQ_REDIS_URL` when set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("DTQ_REDIS_URL") {
            config.redis_url = url;
        }
        config
    }

    pub fn from_url<S: Into<String>>(url: S) -> Self {
        Self {
            redis_url: url.into(),
            ..Self::default()
        }
    }
}

struct Scripts {
    enqueue: Script,
    dequeue: Script,
    forward: Script,
    finish: Script,
    renew: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_SCRIPT),
            dequeue: Script::new(DEQUEUE_SCRIPT),
            forward: Script::new(FORWARD_SCRIPT),
            finish: Script::new(FINISH_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
        }
    }
}

/// Where a finished lease sends its task
enum Placement {
    Sorted(i64),
    Front,
    Back,
}

struct Transition<'a> {
    message: &'a TaskMessage,
    destination: String,
    placement: Placement,
    release_unique: bool,
    ttl_secs: u64,
}

/// Distributed task store with Redis backend
pub struct RedisStore {
    conn: ConnectionManager,
    config: RedisConfig,
    scripts: Scripts,
    clock: Arc<dyn Clock>,
}

impl RedisStore {
    /// Connect and verify the server answers
    pub async fn new(config: RedisConfig) -> TaskResult<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| TaskError::config(format!("invalid redis url: {}", e)))?;

        let mut attempt = 0;
        let mut conn = loop {
            match ConnectionManager::new(client.clone()).await {
                Ok(conn) => break conn,
                Err(e) if is_transient(&e) && attempt < config.max_connect_retries => {
                    attempt += 1;
                    let delay = retry_delay(config.connect_retry_delay_ms, attempt);
                    warn!("Redis connect attempt {} failed: {}; retrying in {:?}", attempt, e, delay);
                    sleep(delay).await;
                }
                Err(e) => return Err(TaskError::queue_operation("connect".to_string(), e.to_string())),
            }
        };

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("ping".to_string(), e.to_string()))?;

        info!("Connected to Redis at {}", config.redis_url);

        Ok(Self {
            conn,
            config,
            scripts: Scripts::new(),
            clock: Arc::new(SystemClock),
        })
    }

    /// Connect with default configuration
    pub async fn new_default() -> TaskResult<Self> {
        Self::new(RedisConfig::default()).await
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn task_key(&self, task_id: &TaskId) -> String {
        format!("{}:t:{}", self.config.key_prefix, task_id)
    }

    fn task_key_prefix(&self) -> String {
        format!("{}:t:", self.config.key_prefix)
    }

    fn queue_key(&self, queue: &str, lane: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, queue, lane)
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.config.key_prefix)
    }

    fn unique_key(&self, key: &str) -> String {
        format!("{}:unique:{}", self.config.key_prefix, key)
    }

    /// Invoke a script, retrying on connectivity errors
    async fn invoke<T: FromRedisValue>(
        &self,
        operation: &str,
        invocation: &ScriptInvocation<'_>,
    ) -> TaskResult<T> {
        let mut attempt = 0;
        loop {
            let mut conn = self.conn.clone();
            match invocation.invoke_async(&mut conn).await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.config.max_connect_retries => {
                    attempt += 1;
                    let delay = retry_delay(self.config.connect_retry_delay_ms, attempt);
                    warn!("Redis {} failed: {}; retry {} in {:?}", operation, e, attempt, delay);
                    sleep(delay).await;
                }
                Err(e) => return Err(TaskError::Redis(e)),
            }
        }
    }

    /// Run a plain command, retrying on connectivity errors
    async fn query<T: FromRedisValue>(&self, operation: &str, cmd: &redis::Cmd) -> TaskResult<T> {
        let mut attempt = 0;
        loop {
            let mut conn = self.conn.clone();
            match cmd.query_async(&mut conn).await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.config.max_connect_retries => {
                    attempt += 1;
                    let delay = retry_delay(self.config.connect_retry_delay_ms, attempt);
                    warn!("Redis {} failed: {}; retry {} in {:?}", operation, e, attempt, delay);
                    sleep(delay).await;
                }
                Err(e) => return Err(TaskError::Redis(e)),
            }
        }
    }

    async fn load(&self, task_id: &TaskId) -> TaskResult<Option<TaskMessage>> {
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(self.task_key(task_id)).arg("msg").arg("state");
        let (msg, state): (Option<String>, Option<String>) = self.query("get_task", &cmd).await?;

        match msg {
            Some(json) => {
                let mut message: TaskMessage = serde_json::from_str(&json)?;
                if let Some(state) = state.as_deref().and_then(TaskState::parse) {
                    message.state = state;
                }
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    async fn load_leased(&self, lease: &Lease) -> TaskResult<TaskMessage> {
        self.load(&lease.task_id)
            .await?
            .ok_or_else(|| TaskError::lease_expired(lease.task_id.to_string()))
    }

    /// Release a lease and move the task. `token` is `None` only for the reaper.
    async fn finish(
        &self,
        operation: &str,
        queue: &str,
        token: Option<&Uuid>,
        now: DateTime<Utc>,
        transition: Transition<'_>,
    ) -> TaskResult<bool> {
        let message = transition.message;
        let (placement, score) = match transition.placement {
            Placement::Sorted(score) => ("sorted", score),
            Placement::Front => ("front", 0),
            Placement::Back => ("back", 0),
        };
        let unique = match (&message.unique_key, transition.release_unique) {
            (Some(key), true) => self.unique_key(key),
            _ => String::new(),
        };

        let mut invocation = self.scripts.finish.prepare_invoke();
        invocation
            .key(self.task_key(&message.id))
            .key(self.queue_key(queue, "lease"))
            .key(transition.destination)
            .arg(message.id.to_string())
            .arg(token.map(|t| t.to_string()).unwrap_or_default())
            .arg(now.timestamp_millis())
            .arg(serde_json::to_string(message)?)
            .arg(message.state.as_str())
            .arg(score)
            .arg(placement)
            .arg(unique)
            .arg(transition.ttl_secs);

        let done: i64 = self.invoke(operation, &invocation).await?;
        Ok(done == 1)
    }

    async fn forward_queue(&self, queue: &str, now: DateTime<Utc>) -> TaskResult<u64> {
        let mut forwarded = 0;
        for (lane, state) in [("scheduled", TaskState::Pending), ("retry", TaskState::Retry)] {
            let mut invocation = self.scripts.forward.prepare_invoke();
            invocation
                .key(self.queue_key(queue, lane))
                .key(self.queue_key(queue, "pending"))
                .arg(now.timestamp_millis())
                .arg(self.task_key_prefix())
                .arg(state.as_str())
                .arg(FORWARD_BATCH);
            let moved: u64 = self.invoke("forward", &invocation).await?;
            forwarded += moved;
        }
        if forwarded > 0 {
            debug!("Forwarded {} due task(s) in queue {}", forwarded, queue);
        }
        Ok(forwarded)
    }

    async fn claim_one(
        &self,
        queue: &str,
        worker_id: &str,
        default_lease: Duration,
        now: DateTime<Utc>,
    ) -> TaskResult<Option<Option<ClaimedTask>>> {
        let token = Uuid::new_v4();
        let mut invocation = self.scripts.dequeue.prepare_invoke();
        invocation
            .key(self.queue_key(queue, "pending"))
            .key(self.queue_key(queue, "lease"))
            .arg(self.task_key_prefix())
            .arg(now.timestamp_millis())
            .arg(token.to_string())
            .arg(worker_id)
            .arg(millis(default_lease)?);

        let reply: Option<(String, String, String)> = self.invoke("dequeue", &invocation).await?;
        let Some((id, json, expires_at)) = reply else {
            return Ok(None);
        };
        if json.is_empty() {
            warn!("Dropped dangling task id {} from queue {}", id, queue);
            return Ok(Some(None));
        }

        let mut message: TaskMessage = serde_json::from_str(&json)?;
        message.state = TaskState::Active;
        message.worker_id = Some(worker_id.to_string());
        let expires_at = expires_at
            .parse::<i64>()
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| TaskError::queue_operation("dequeue".to_string(), format!("bad lease expiry {}", expires_at)))?;

        let lease = Lease {
            task_id: message.id,
            queue: queue.to_string(),
            token,
            worker_id: worker_id.to_string(),
            expires_at,
        };
        Ok(Some(Some(ClaimedTask { message, lease })))
    }
}

#[async_trait]
impl TaskStore for RedisStore {
    async fn enqueue(&self, mut message: TaskMessage) -> TaskResult<TaskInfo> {
        let now = self.clock.now();
        if message.timeout.is_some() {
            message.lease_expiry(message.process_at.max(now), Duration::ZERO)?;
        }
        message.state = if message.process_at > now {
            TaskState::Scheduled
        } else {
            TaskState::Pending
        };
        let lane = if message.state == TaskState::Scheduled {
            "scheduled"
        } else {
            "pending"
        };
        let lease_ms = message.timeout.map(millis).transpose()?.unwrap_or(0);
        let unique = message
            .unique_key
            .as_deref()
            .map(|key| self.unique_key(key))
            .unwrap_or_default();

        let mut invocation = self.scripts.enqueue.prepare_invoke();
        invocation
            .key(self.task_key(&message.id))
            .key(self.queue_key(&message.queue, lane))
            .key(self.queues_key())
            .arg(message.id.to_string())
            .arg(serde_json::to_string(&message)?)
            .arg(message.state.as_str())
            .arg(&message.queue)
            .arg(unique)
            .arg(message.process_at.timestamp_millis())
            .arg(lease_ms);

        let (status, holder): (String, String) = self.invoke("enqueue", &invocation).await?;
        match status.as_str() {
            "ok" => {
                debug!("Submitted task {} to queue {} as {}", message.id, message.queue, message.state);
                Ok(message.info())
            }
            "duplicate" => Err(TaskError::DuplicateTask {
                unique_key: message.unique_key.clone().unwrap_or_default(),
                task_id: holder,
            }),
            _ => Err(TaskError::queue_operation(
                "enqueue".to_string(),
                format!("task id {} already exists", message.id),
            )),
        }
    }

    async fn dequeue(
        &self,
        queues: &[String],
        count: usize,
        worker_id: &str,
        default_lease: Duration,
    ) -> TaskResult<Vec<ClaimedTask>> {
        let now = self.clock.now();
        if checked_offset(now, default_lease).is_none() {
            return Err(TaskError::validation(format!("lease of {:?} is out of range", default_lease)));
        }
        let mut claimed = Vec::new();

        for queue in queues {
            if claimed.len() >= count {
                break;
            }
            self.forward_queue(queue, now).await?;
            while claimed.len() < count {
                match self.claim_one(queue, worker_id, default_lease, now).await? {
                    Some(Some(task)) => claimed.push(task),
                    Some(None) => continue,
                    None => break,
                }
            }
        }

        if !claimed.is_empty() {
            debug!("Worker {} claimed {} task(s)", worker_id, claimed.len());
        }
        Ok(claimed)
    }

    async fn ack(&self, lease: &Lease) -> TaskResult<()> {
        let now = self.clock.now();
        let mut message = self.load_leased(lease).await?;
        message.mark_completed(now)?;

        let transition = Transition {
            message: &message,
            destination: self.queue_key(&lease.queue, "completed"),
            placement: Placement::Sorted(now.timestamp_millis()),
            release_unique: true,
            ttl_secs: self.config.completed_ttl,
        };
        if !self.finish("ack", &lease.queue, Some(&lease.token), now, transition).await? {
            return Err(TaskError::lease_expired(lease.task_id.to_string()));
        }

        debug!("Marked task {} as completed", lease.task_id);
        Ok(())
    }

    async fn fail(&self, lease: &Lease, error: &str) -> TaskResult<TaskState> {
        let now = self.clock.now();
        let mut message = self.load_leased(lease).await?;

        let transition = if message.can_retry() {
            let backoff = self.config.retry_config.delay_for(message.retry_count + 1);
            message.mark_retry(error, now, backoff)?;
            Transition {
                message: &message,
                destination: self.queue_key(&lease.queue, "retry"),
                placement: Placement::Sorted(message.process_at.timestamp_millis()),
                release_unique: false,
                ttl_secs: 0,
            }
        } else {
            message.mark_archived(error, now)?;
            Transition {
                message: &message,
                destination: self.queue_key(&lease.queue, "archived"),
                placement: Placement::Sorted(now.timestamp_millis()),
                release_unique: true,
                ttl_secs: self.config.archived_ttl,
            }
        };

        if !self.finish("fail", &lease.queue, Some(&lease.token), now, transition).await? {
            return Err(TaskError::lease_expired(lease.task_id.to_string()));
        }

        debug!("Task {} failed and moved to {}", lease.task_id, message.state);
        Ok(message.state)
    }

    async fn archive(&self, lease: &Lease, error: &str) -> TaskResult<()> {
        let now = self.clock.now();
        let mut message = self.load_leased(lease).await?;
        message.mark_archived(error, now)?;

        let transition = Transition {
            message: &message,
            destination: self.queue_key(&lease.queue, "archived"),
            placement: Placement::Sorted(now.timestamp_millis()),
            release_unique: true,
            ttl_secs: self.config.archived_ttl,
        };
        if !self.finish("archive", &lease.queue, Some(&lease.token), now, transition).await? {
            return Err(TaskError::lease_expired(lease.task_id.to_string()));
        }

        debug!("Archived task {}", lease.task_id);
        Ok(())
    }

    async fn requeue(&self, lease: &Lease) -> TaskResult<()> {
        let now = self.clock.now();
        let mut message = self.load_leased(lease).await?;
        message.mark_pending(now)?;

        let transition = Transition {
            message: &message,
            destination: self.queue_key(&lease.queue, "pending"),
            placement: Placement::Front,
            release_unique: false,
            ttl_secs: 0,
        };
        if !self.finish("requeue", &lease.queue, Some(&lease.token), now, transition).await? {
            return Err(TaskError::lease_expired(lease.task_id.to_string()));
        }

        debug!("Requeued task {}", lease.task_id);
        Ok(())
    }

    async fn renew_lease(&self, lease: &Lease, extend_by: Duration) -> TaskResult<DateTime<Utc>> {
        let now = self.clock.now();
        let expires_at = checked_offset(now, extend_by)
            .ok_or_else(|| TaskError::validation(format!("lease extension {:?} is out of range", extend_by)))?;

        let mut invocation = self.scripts.renew.prepare_invoke();
        invocation
            .key(self.task_key(&lease.task_id))
            .key(self.queue_key(&lease.queue, "lease"))
            .arg(lease.task_id.to_string())
            .arg(lease.token.to_string())
            .arg(now.timestamp_millis())
            .arg(expires_at.timestamp_millis());

        let renewed: i64 = self.invoke("renew_lease", &invocation).await?;
        if renewed != 1 {
            return Err(TaskError::lease_expired(lease.task_id.to_string()));
        }
        Ok(expires_at)
    }

    async fn forward_due(&self) -> TaskResult<u64> {
        let now = self.clock.now();
        let mut forwarded = 0;
        for queue in self.list_queues().await? {
            forwarded += self.forward_queue(&queue, now).await?;
        }
        Ok(forwarded)
    }

    async fn reap_expired_leases(&self) -> TaskResult<u64> {
        let now = self.clock.now();
        let mut reaped = 0;

        for queue in self.list_queues().await? {
            let mut cmd = redis::cmd("ZRANGEBYSCORE");
            cmd.arg(self.queue_key(&queue, "lease"))
                .arg("-inf")
                .arg(now.timestamp_millis());
            let expired: Vec<String> = self.query("reap", &cmd).await?;

            for id in expired {
                let Ok(task_id) = id.parse::<TaskId>() else {
                    continue;
                };
                let Some(mut message) = self.load(&task_id).await? else {
                    continue;
                };

                let transition = if message.can_retry() {
                    message.mark_retry(LEASE_EXPIRED_ERROR, now, Duration::ZERO)?;
                    Transition {
                        message: &message,
                        destination: self.queue_key(&queue, "pending"),
                        placement: Placement::Back,
                        release_unique: false,
                        ttl_secs: 0,
                    }
                } else {
                    message.mark_archived(LEASE_EXPIRED_ERROR, now)?;
                    Transition {
                        message: &message,
                        destination: self.queue_key(&queue, "archived"),
                        placement: Placement::Sorted(now.timestamp_millis()),
                        release_unique: true,
                        ttl_secs: self.config.archived_ttl,
                    }
                };

                if self.finish("reap", &queue, None, now, transition).await? {
                    warn!("Recovered task {} from an expired lease", task_id);
                    reaped += 1;
                }
            }
        }

        if reaped > 0 {
            info!("Reaped {} expired lease(s)", reaped);
        }
        Ok(reaped)
    }

    async fn get_task(&self, task_id: TaskId) -> TaskResult<Option<TaskMessage>> {
        self.load(&task_id).await
    }

    async fn queue_stats(&self, queue: &str) -> TaskResult<QueueStats> {
        let mut pipe = redis::pipe();
        pipe.cmd("LLEN")
            .arg(self.queue_key(queue, "pending"))
            .cmd("ZCARD")
            .arg(self.queue_key(queue, "scheduled"))
            .cmd("ZCARD")
            .arg(self.queue_key(queue, "lease"))
            .cmd("ZCARD")
            .arg(self.queue_key(queue, "retry"))
            .cmd("ZCARD")
            .arg(self.queue_key(queue, "archived"))
            .cmd("ZCARD")
            .arg(self.queue_key(queue, "completed"));

        let mut conn = self.conn.clone();
        let (pending, scheduled, active, retry, archived, completed): (u64, u64, u64, u64, u64, u64) = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("queue_stats".to_string(), e.to_string()))?;

        Ok(QueueStats {
            pending,
            scheduled,
            active,
            retry,
            archived,
            completed,
        })
    }

    async fn list_queues(&self) -> TaskResult<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(self.queues_key());
        let mut queues: Vec<String> = self.query("list_queues", &cmd).await?;
        queues.sort();
        Ok(queues)
    }
}

fn is_transient(error: &RedisError) -> bool {
    error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal() || error.is_timeout()
}

/// Lease lengths travel to the scripts as whole milliseconds
fn millis(duration: Duration) -> TaskResult<u64> {
    u64::try_from(duration.as_millis())
        .map_err(|_| TaskError::validation(format!("duration {:?} is out of range", duration)))
}

fn retry_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_retry_delay_doubles() {
        assert_eq!(retry_delay(100, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(100, 2), Duration::from_millis(200));
        assert_eq!(retry_delay(100, 4), Duration::from_millis(800));
    }

    #[test]
    fn lease_millis_reject_overflow() {
        assert_eq!(millis(Duration::from_secs(30)).unwrap(), 30_000);
        assert!(matches!(millis(Duration::MAX), Err(TaskError::Validation { .. })));
    }

    #[test]
    fn config_from_url_keeps_defaults() {
        let config = RedisConfig::from_url("redis://cache:6380/2");
        assert_eq!(config.redis_url, "redis://cache:6380/2");
        assert_eq!(config.key_prefix, "dtq");
        assert_eq!(config.completed_ttl, 86400);
    }
}
