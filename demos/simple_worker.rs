//! Simple worker example
//!
//! Processes `email:deliver` and `system:heartbeat` tasks from three weighted
//! queues with a logging middleware. SIGINT/SIGTERM shut the worker down
//! gracefully, SIGTSTP stops it from claiming new tasks.
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379 (or set DTQ_REDIS_URL)
//! 2. Run: cargo run --example simple_worker

use chrono::Utc;
use dtq::{
    LoggingMiddleware, RedisConfig, RedisStore, Task, TaskContext, TaskError, TaskHandlerRegistry, TaskResult,
    Worker, WorkerConfig,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, Level};

const TYPE_HEARTBEAT: &str = "system:heartbeat";
const TYPE_EMAIL_DELIVERY: &str = "email:deliver";

#[derive(Debug, Deserialize)]
struct HeartBeat {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct EmailDelivery {
    user_id: i64,
    message: String,
}

/// Decode a JSON payload; a malformed payload will never succeed, so it is not retried
fn decode<T: serde::de::DeserializeOwned>(task: &Task) -> TaskResult<T> {
    task.payload_json()
        .map_err(|e| TaskError::skip_retry(format!("json decode failed: {}", e)))
}

async fn handle_heartbeat(_ctx: TaskContext, task: Task) -> TaskResult<()> {
    let beat: HeartBeat = decode(&task)?;
    info!(
        "[Task Type: {}] HeartBeat: user_id={}, now is {}",
        task.task_type(),
        beat.user_id,
        Utc::now()
    );
    Ok(())
}

async fn handle_email_delivery(_ctx: TaskContext, task: Task) -> TaskResult<()> {
    let email: EmailDelivery = decode(&task)?;
    info!(
        "[Task Type: {}] Sending Email to User: user_id={}, message={}",
        task.task_type(),
        email.user_id,
        email.message
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let store = Arc::new(RedisStore::new(RedisConfig::from_env()).await?);

    let mut registry = TaskHandlerRegistry::new();
    registry.use_middleware(LoggingMiddleware);
    registry.register_fn(TYPE_EMAIL_DELIVERY, handle_email_delivery)?;
    registry.register_fn(TYPE_HEARTBEAT, handle_heartbeat)?;

    let config = WorkerConfig {
        concurrency: 20,
        ..WorkerConfig::default()
    }
    .with_queues([("critical", 6), ("default", 3), ("low", 1)]);

    let worker = Worker::new(config, store, registry)?;
    info!("worker {} ready", worker.worker_id());
    worker.run_until_signal().await?;
    Ok(())
}
