use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;

use dagctl_core::queue::QueueStore;
use dagctl_core::scheduler::{NoRemoteWorkers, Scheduler, SchedulerConfig};
use dagctl_db::models::Priority;

use crate::enqueue_cmd::{data_dir, register_and_create_attempt};

/// `dagctl start`: like `enqueue`, but at High priority, followed by an
/// immediate scheduler tick rather than waiting for the next poll interval.
pub async fn run(pool: &PgPool, path: &str, run_id: Option<&str>, params: Option<&str>) -> Result<()> {
    let (dag_row, attempt) = register_and_create_attempt(pool, path, run_id, params).await?;

    QueueStore::new(pool)
        .enqueue(&dag_row.queue_name, &attempt.dag_name, &attempt.run_id, Priority::High, None)
        .await
        .context("failed to enqueue attempt")?;

    println!("Started {}/{} (attempt {})", attempt.dag_name, attempt.run_id, attempt.attempt_number);

    let scheduler = Scheduler::new(
        pool.clone(),
        Arc::new(NoRemoteWorkers),
        SchedulerConfig {
            tick_interval: Duration::from_secs(5),
            max_local_agents: 4,
            grace_period: Duration::from_secs(10),
            data_dir: data_dir(),
        },
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let semaphore = Arc::new(tokio::sync::Semaphore::new(4));
    scheduler.tick(&tx, &semaphore).await?;
    drop(tx);
    while rx.recv().await.is_some() {}

    Ok(())
}
