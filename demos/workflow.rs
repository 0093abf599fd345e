use beehive::{
    BeeSpec, Hive, HiveConfig, JobRequest, MemoryStore, SubmitOptions, WorkerError,
    worker::handler,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    info!("Beehive workflow example");
    let config = HiveConfig::default()
        .with_poll_interval(Duration::from_millis(100))
        .with_sweep_interval(Duration::from_millis(200));
    let hive = Hive::new(Arc::new(MemoryStore::new()), config)?;

    // resizes one image, reporting progress; the first attempt of every
    // image fails to show retries
    hive.bee(
        "resize",
        BeeSpec::new(handler(|job, _| async move {
            let image: String = job.arg(0)?;
            if job.retries() == 0 {
                return Err(WorkerError::new("Storage busy").with_retry_delay(Duration::from_millis(200)));
            }
            for step in [25, 50, 75, 100] {
                sleep(Duration::from_millis(20)).await;
                job.progress(json!({ "image": image, "percent": step })).await?;
            }
            Ok(json!(format!("{}-small.png", image.trim_end_matches(".png"))))
        }))
        .with_concurrency(2),
    )
    .await?;

    // fans out one resize per image, then waits for all of them
    hive.bee(
        "album",
        BeeSpec::new(handler(|job, args| async move {
            let mut resized = Vec::new();
            for image in args {
                let child = job
                    .sub(
                        JobRequest::new("resize")
                            .arg(image)
                            .options(SubmitOptions::new().with_tags(["album-1"])),
                    )
                    .await?;
                resized.push(child);
            }
            let mut results = Vec::new();
            for child in resized {
                results.push(child.result().await?);
            }
            Ok(json!(results))
        })),
    )
    .await?;

    hive.bee(
        "publish",
        BeeSpec::new(handler(|job, _| async move {
            info!("Publishing after {:?}", job.options().dependencies);
            Ok(json!("published"))
        })),
    )
    .await?;

    let album = hive
        .submit(JobRequest::new("album").args(["a.png", "b.png", "c.png"]))
        .await?;
    let publish = hive
        .submit(JobRequest::new("publish").options(SubmitOptions::new().with_dependency(album.jid())))
        .await?;

    info!("Album: {}", album.result().await?);
    info!("Publish: {}", publish.result().await?);

    let tagged = hive.search(["album-1"]).await?;
    info!("Jobs tagged album-1: {}", tagged.len());

    // canceling a waiting job
    let doomed = hive
        .submit(JobRequest::new("publish").options(SubmitOptions::new().with_delay(Duration::from_secs(60))))
        .await?;
    doomed.cancel().await?;
    if let Err(e) = doomed.result().await {
        warn!("Delayed publish: {}", e);
    }

    hive.shutdown().await;
    Ok(())
}
