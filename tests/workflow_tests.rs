
use beehive::{
    BeeSpec, HistoryEvent, Jid, JobRequest, JobStatus, SubmitOptions, WorkerError,
    worker::handler,
};
use serde_json::{Value, json};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use test_utils::{setup_hive, sum_handler, wait_until};
use tokio::{sync::Notify, time::sleep};

/// Test that canceling a parent cancels its sub-jobs and refuses new ones
#[tokio::test]
async fn test_cancel_cascades_to_sub_jobs() {
    let hive = setup_hive();
    let child_jid = Arc::new(Mutex::new(None::<Jid>));
    let refused = Arc::new(Mutex::new(None::<bool>));
    let child_ready = Arc::new(Notify::new());
    let worker_done = Arc::new(Notify::new());

    let (slot, verdict, ready, done) = (
        child_jid.clone(),
        refused.clone(),
        child_ready.clone(),
        worker_done.clone(),
    );
    hive.bee(
        "parent",
        BeeSpec::new(handler(move |job, _| {
            let (slot, verdict, ready, done) =
                (slot.clone(), verdict.clone(), ready.clone(), done.clone());
            async move {
                // nobody serves "child": the sub-job waits until canceled
                let child = job.sub(JobRequest::new("child").arg(1)).await?;
                *slot.lock().unwrap() = Some(child.jid());
                ready.notify_one();

                let outcome = child.result().await;
                let again = job.sub(JobRequest::new("child").arg(2)).await;
                *verdict.lock().unwrap() = Some(again.err().is_some_and(|e| e.is_canceled()));
                done.notify_one();
                outcome.map_err(WorkerError::from)
            }
        })),
    )
    .await
    .unwrap();

    let parent = hive.submit(JobRequest::new("parent")).await.unwrap();
    child_ready.notified().await;
    let child = child_jid.lock().unwrap().unwrap();

    let child_handle = hive.job(child).await.unwrap();
    assert_eq!(child_handle.parent(), Some(parent.jid()));
    assert_eq!(child_handle.status(), JobStatus::Queued);

    parent.cancel().await.unwrap();
    assert!(parent.result().await.unwrap_err().is_canceled());
    assert!(child_handle.result().await.unwrap_err().is_canceled());

    worker_done.notified().await;
    assert_eq!(*refused.lock().unwrap(), Some(true));
    assert_eq!(hive.queue_size("child").await.unwrap(), 0);

    sleep(Duration::from_millis(50)).await;
    parent.update().await.unwrap();
    assert_eq!(parent.status(), JobStatus::Canceled);

    hive.shutdown().await;
}

/// Test that a parent can fan out sub-jobs and combine their results
#[tokio::test]
async fn test_sub_job_fan_out() {
    let hive = setup_hive();
    let calls = Arc::new(AtomicUsize::new(0));
    hive.bee("sum", BeeSpec::new(sum_handler(calls.clone())))
        .await
        .unwrap();
    hive.bee(
        "fanout",
        BeeSpec::new(handler(|job, _| async move {
            let mut children = Vec::new();
            for n in 1..=3 {
                children.push(job.sub(JobRequest::new("sum").args([n, n])).await?);
            }
            let mut total = 0;
            for child in children {
                total += child.result().await?.as_i64().unwrap_or_default();
            }
            Ok(json!(total))
        })),
    )
    .await
    .unwrap();

    let job = hive.submit(JobRequest::new("fanout")).await.unwrap();
    assert_eq!(job.result().await.unwrap(), json!(12));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    hive.shutdown().await;
}

/// Test that dependencies given by tag wait for every tagged job
#[tokio::test]
async fn test_dependencies_on_tags() {
    let hive = setup_hive();
    let finished = Arc::new(AtomicUsize::new(0));

    let counter = finished.clone();
    hive.bee(
        "batch",
        BeeSpec::new(handler(move |job, _| {
            let counter = counter.clone();
            async move {
                let n: u64 = job.arg(0)?;
                sleep(Duration::from_millis(20 * n)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(n))
            }
        })),
    )
    .await
    .unwrap();

    let seen = finished.clone();
    hive.bee(
        "aggregate",
        BeeSpec::new(handler(move |_, _| {
            let seen = seen.clone();
            async move { Ok(json!(seen.load(Ordering::SeqCst))) }
        })),
    )
    .await
    .unwrap();

    for n in 1..=3 {
        hive.submit(
            JobRequest::new("batch")
                .arg(n)
                .options(SubmitOptions::new().with_tags(["batch-7"])),
        )
        .await
        .unwrap();
    }

    let aggregate = hive
        .submit(
            JobRequest::new("aggregate")
                .options(SubmitOptions::new().with_dependencies_on_tags(["batch-7"])),
        )
        .await
        .unwrap();
    assert_eq!(aggregate.options().dependencies.len(), 3);
    assert_eq!(aggregate.result().await.unwrap(), json!(3));

    hive.shutdown().await;
}

/// Test that a failed or canceled dependency still releases its dependant
#[tokio::test]
async fn test_unsuccessful_dependencies_release_dependants() {
    let hive = setup_hive();
    let calls = Arc::new(AtomicUsize::new(0));
    hive.bee("sum", BeeSpec::new(sum_handler(calls.clone())))
        .await
        .unwrap();

    let failing = hive.submit(JobRequest::new("sum").args([-5, 1])).await.unwrap();
    let after_failure = hive
        .submit(
            JobRequest::new("sum")
                .args([1, 2])
                .options(SubmitOptions::new().with_dependency(failing.jid())),
        )
        .await
        .unwrap();
    assert!(failing.result().await.is_err());
    assert_eq!(after_failure.result().await.unwrap(), json!(3));

    // nobody serves "idle", so the dependency only ever gets canceled
    let never = hive.submit(JobRequest::new("idle")).await.unwrap();
    let after_cancel = hive
        .submit(
            JobRequest::new("sum")
                .args([2, 2])
                .options(SubmitOptions::new().with_dependency(never.jid())),
        )
        .await
        .unwrap();
    sleep(Duration::from_millis(60)).await;
    assert_eq!(after_cancel.status(), JobStatus::Delayed);

    hive.cancel(never.jid()).await.unwrap();
    assert_eq!(after_cancel.result().await.unwrap(), json!(4));

    hive.shutdown().await;
}

/// Test that options changed by the worker govern the retry decision
#[tokio::test]
async fn test_worker_adjusted_options() {
    let hive = setup_hive();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    hive.bee(
        "stubborn",
        BeeSpec::new(handler(move |job, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                job.update_options(|options| options.retries = 0);
                Err::<Value, _>(WorkerError::new("giving up"))
            }
        })),
    )
    .await
    .unwrap();

    let job = hive.submit(JobRequest::new("stubborn")).await.unwrap();
    assert_eq!(job.options().retries, 5);

    let err = job.result().await.unwrap_err();
    assert_eq!(err.to_string(), "No more retries");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(job.options().retries, 0);

    hive.shutdown().await;
}

/// Test that a worker error can carry its own retry delay
#[tokio::test]
async fn test_error_retry_delay_override() {
    let hive = setup_hive();
    hive.bee(
        "later",
        BeeSpec::new(handler(|job, _| async move {
            if job.retries() == 0 {
                return Err(WorkerError::new("not yet").with_retry_delay(Duration::from_millis(200)));
            }
            Ok(json!("now"))
        })),
    )
    .await
    .unwrap();

    let job = hive.submit(JobRequest::new("later")).await.unwrap();
    assert_eq!(job.result().await.unwrap(), json!("now"));

    let record = job.record();
    let exception = record.find_event("exception").unwrap();
    let retried = record
        .history
        .iter()
        .filter(|e| matches!(e.event, HistoryEvent::Popped { .. }))
        .nth(1)
        .unwrap();
    assert!(retried.timestamp - exception.timestamp >= 200);
    assert!(record.history.iter().any(|e| matches!(
        e.event,
        HistoryEvent::Delayed { till } if till - exception.timestamp == 200
    )));

    hive.shutdown().await;
}

/// Test that a job identical to a running one waits for and mirrors its outcome
#[tokio::test]
async fn test_duplicate_of_running_job() {
    let hive = setup_hive();
    let calls = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Notify::new());

    let (counter, signal) = (calls.clone(), started.clone());
    hive.bee(
        "slow-sum",
        BeeSpec::new(handler(move |job, _| {
            let (counter, signal) = (counter.clone(), signal.clone());
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                signal.notify_one();
                sleep(Duration::from_millis(100)).await;
                let a: i64 = job.arg(0)?;
                let b: i64 = job.arg(1)?;
                Ok(json!(a + b))
            }
        })),
    )
    .await
    .unwrap();

    let original = hive.submit(JobRequest::new("slow-sum").args([7, 8])).await.unwrap();
    started.notified().await;
    let duplicate = hive.submit(JobRequest::new("slow-sum").args([7, 8])).await.unwrap();

    assert_eq!(duplicate.result().await.unwrap(), json!(15));
    assert_eq!(original.result().await.unwrap(), json!(15));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(duplicate.duplicate_jid(), Some(original.jid()));

    hive.shutdown().await;
}

/// Test that finished jobs expire after their TTL and are deleted after another
#[tokio::test]
async fn test_results_expire_then_disappear() {
    let hive = setup_hive();
    let calls = Arc::new(AtomicUsize::new(0));
    hive.bee("sum", BeeSpec::new(sum_handler(calls.clone())))
        .await
        .unwrap();

    let ttl = Duration::from_millis(100);
    let job = hive
        .submit(
            JobRequest::new("sum")
                .args([3, 4])
                .options(SubmitOptions::new().with_ttl(ttl).with_tags(["short-lived"])),
        )
        .await
        .unwrap();
    assert_eq!(job.result().await.unwrap(), json!(7));
    let jid = job.jid();

    assert!(
        wait_until(Duration::from_secs(2), || {
            let hive = hive.clone();
            async move { hive.job(jid).await.is_err_and(|e| e.is_expired()) }
        })
        .await
    );
    assert!(hive.search(["short-lived"]).await.unwrap().is_empty());

    // the fingerprint is free again: an identical job runs
    let again = hive.submit(JobRequest::new("sum").args([3, 4])).await.unwrap();
    assert_eq!(again.result().await.unwrap(), json!(7));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(
        wait_until(Duration::from_secs(2), || {
            let hive = hive.clone();
            async move { hive.job(jid).await.is_err_and(|e| e.is_not_found()) }
        })
        .await
    );

    hive.shutdown().await;
}
