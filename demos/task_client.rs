//! Task client example
//!
//! Enqueues email delivery tasks:
//! 1. Immediately, to the `low` queue, three times three seconds apart
//! 2. Delayed by five seconds
//! 3. With retry, timeout and deadline options
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379 (or set DTQ_REDIS_URL)
//! 2. Make sure a worker is running (run simple_worker example)
//! 3. Run: cargo run --example task_client

use anyhow::Context;
use chrono::Utc;
use dtq::{EnqueueOptions, RedisConfig, Task, TaskClient};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, Level};

const TYPE_EMAIL_DELIVERY: &str = "email:deliver";

#[derive(Debug, Serialize, Deserialize)]
struct EmailDelivery {
    user_id: i64,
    message: String,
}

fn email_delivery_task(user_id: i64, message: &str) -> anyhow::Result<Task> {
    let payload = EmailDelivery {
        user_id,
        message: message.to_string(),
    };
    Task::from_json(TYPE_EMAIL_DELIVERY, &payload).context("could not create task")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let client = TaskClient::new(RedisConfig::from_env())
        .await
        .context("could not connect to redis")?;

    for _ in 0..3 {
        let task = email_delivery_task(42, "some:template:id")?;
        let info = client
            .enqueue(&task, EnqueueOptions::new().queue("low"))
            .await
            .context("could not enqueue task")?;
        info!("enqueued task: id={} queue={}", info.id, info.queue);
        tokio::time::sleep(Duration::from_secs(3)).await;
    }

    let task = email_delivery_task(1, "i'm delay 5 seconds message")?;
    let info = client
        .enqueue(&task, EnqueueOptions::new().process_in(Duration::from_secs(5)))
        .await?;
    info!("enqueued delayed task: id={} process_at={}", info.id, info.process_at);

    let task = email_delivery_task(1, "i'm a message with a deadline")?;
    let options = EnqueueOptions::new()
        .max_retry(3)
        .timeout(Duration::from_secs(10))
        .deadline(Utc::now() + chrono::Duration::seconds(20));
    let info = client.enqueue(&task, options).await?;
    info!("enqueued task: {:?}", info);

    let stats = client.queue_stats("low").await?;
    info!("queue low: {:?}", stats);
    Ok(())
}
