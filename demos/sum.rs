use beehive::{BeeSpec, Hive, HiveConfig, JobRequest, MemoryStore, WorkerError, worker::handler};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    info!("Beehive sum example");
    let hive = Hive::new(Arc::new(MemoryStore::new()), HiveConfig::default())?;

    hive.bee(
        "sum",
        BeeSpec::new(handler(|job, _| async move {
            let a: i64 = job.arg(0)?;
            let b: i64 = job.arg(1)?;
            if a < 0 || b < 0 {
                return Err(WorkerError::permanent("Argument must be positive"));
            }
            Ok(json!(a + b))
        }))
        .with_concurrency(4),
    )
    .await?;

    let job = hive.submit(JobRequest::new("sum").args([2, 3])).await?;
    info!("sum(2, 3) = {}", job.result().await?);

    // identical arguments: served from the first job without running the worker
    let again = hive.submit(JobRequest::new("sum").args([2, 3])).await?;
    info!("sum(2, 3) again = {}", again.result().await?);
    info!("History: {:?}", again.record().event_names());

    let invalid = hive.submit(JobRequest::new("sum").args([-1, 3])).await?;
    match invalid.result().await {
        Ok(value) => info!("Unexpected result {}", value),
        Err(e) => error!("sum(-1, 3) rejected: {}", e),
    }

    hive.shutdown().await;
    Ok(())
}
