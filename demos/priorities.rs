use beehive::{BeeSpec, Hive, HiveConfig, JobRequest, MemoryStore, SubmitOptions, worker::handler};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::info;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    info!("Beehive priority example");
    let config = HiveConfig::default().with_poll_interval(Duration::from_millis(100));
    let hive = Hive::new(Arc::new(MemoryStore::new()), config)?;

    // queue everything before a bee exists so the ordering is visible
    let mut jobs = Vec::new();
    for (name, priority) in [("background", -5), ("normal", 0), ("urgent", 10), ("high", 5)] {
        let request = JobRequest::new("report")
            .arg(name)
            .options(SubmitOptions::new().with_priority(priority));
        let job = hive.submit(request).await?;
        info!("Queued {} with priority {} as {}", name, priority, job.jid());
        jobs.push(job);
    }
    info!("Queue size: {}", hive.queue_size("report").await?);

    hive.bee(
        "report",
        BeeSpec::new(handler(|job, _| async move {
            let name: String = job.arg(0)?;
            info!("Running {} job", name);
            sleep(Duration::from_millis(50)).await;
            Ok(json!(name))
        }))
        .with_concurrency(1),
    )
    .await?;

    for job in jobs {
        info!("Finished {}", job.result().await?);
    }

    hive.shutdown().await;
    Ok(())
}
