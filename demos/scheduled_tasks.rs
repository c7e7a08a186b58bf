//! Scheduled tasks example
//!
//! Registers two heartbeat entries and runs the scheduler until Ctrl-C:
//! - every minute on the `critical` queue (cron spec)
//! - every 60 seconds on the `default` queue (`@every`)
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379 (or set DTQ_REDIS_URL)
//! 2. Run: cargo run --example scheduled_tasks

use dtq::{EnqueueOptions, RedisConfig, Task, TaskClient, TaskScheduler};
use serde::Serialize;
use tracing::{info, Level};

const TYPE_HEARTBEAT: &str = "system:heartbeat";

#[derive(Debug, Serialize)]
struct HeartBeat {
    user_id: i64,
}

fn heartbeat_task(user_id: i64) -> dtq::TaskResult<Task> {
    Task::from_json(TYPE_HEARTBEAT, &HeartBeat { user_id })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let client = TaskClient::new(RedisConfig::from_env()).await?;
    let scheduler = TaskScheduler::new(client);

    // minute hour day-of-month month day-of-week
    let entry_id = scheduler
        .register("* * * * *", heartbeat_task(1)?, EnqueueOptions::new().queue("critical"))
        .await?;
    info!("registered an every minute entry: {}", entry_id);

    // cron resolution is a minute; @every goes down to seconds
    let entry_id = scheduler
        .register("@every 60s", heartbeat_task(2)?, EnqueueOptions::new().queue("default"))
        .await?;
    info!("registered an every 60s entry: {}", entry_id);

    let driver = scheduler.clone();
    let running = tokio::spawn(async move { driver.run().await });

    tokio::signal::ctrl_c().await?;
    scheduler.shutdown();
    running.await??;

    for entry in scheduler.list_entries().await {
        info!(
            "entry {} ({}): ran {} time(s), {} failure(s)",
            entry.id, entry.schedule, entry.run_count, entry.failure_count
        );
    }
    Ok(())
}
