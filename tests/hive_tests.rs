
use beehive::{
    BeeSpec, Hive, HistoryEvent, JobRequest, JobStatus, StoreClient, SubmitOptions, WorkerError,
    worker::{handler, hash_fn},
};
use serde_json::{Value, json};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use test_utils::{setup_hive, setup_shared, sum_handler, test_config, wait_until};
use tokio::{sync::Notify, time::sleep};

/// Test the sum round trip and that an identical resubmission is served from the original
#[tokio::test]
async fn test_sum_round_trip_and_dedup() {
    let hive = setup_hive();
    let calls = Arc::new(AtomicUsize::new(0));
    hive.bee("sum", BeeSpec::new(sum_handler(calls.clone())))
        .await
        .unwrap();

    let first = hive.submit(JobRequest::new("sum").args([2, 3])).await.unwrap();
    assert_eq!(first.result().await.unwrap(), json!(5));
    assert_eq!(first.status(), JobStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = hive.submit(JobRequest::new("sum").args([2, 3])).await.unwrap();
    assert_eq!(second.result().await.unwrap(), json!(5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    second.update().await.unwrap();
    assert_eq!(second.duplicate_jid(), Some(first.jid()));
    assert!(second.record().find_event("duplicate").is_some());
    assert_ne!(second.jid(), first.jid());

    hive.shutdown().await;
}

/// Test that a permanent worker error fails the job at once with its own message
#[tokio::test]
async fn test_permanent_error_is_not_retried() {
    let hive = setup_hive();
    let calls = Arc::new(AtomicUsize::new(0));
    hive.bee("sum", BeeSpec::new(sum_handler(calls.clone())))
        .await
        .unwrap();

    let job = hive.submit(JobRequest::new("sum").args([-1, 3])).await.unwrap();
    let err = job.result().await.unwrap_err();
    assert_eq!(err.to_string(), "Argument must be positive");

    let failure = err.failure().unwrap();
    assert_eq!(failure.jid, job.jid());
    assert_eq!(failure.queue, "sum");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(job.status(), JobStatus::Failed);

    hive.shutdown().await;
}

/// Test that jobs run highest priority first and FIFO within a priority
#[tokio::test]
async fn test_priority_ordering() {
    let hive = setup_hive();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for (value, priority) in [(1, 1), (5, 5), (3, 3), (50, 5)] {
        let request = JobRequest::new("prio")
            .arg(value)
            .options(SubmitOptions::new().with_priority(priority));
        handles.push(hive.submit(request).await.unwrap());
    }
    assert_eq!(hive.queue_size("prio").await.unwrap(), 4);

    let seen = order.clone();
    hive.bee(
        "prio",
        BeeSpec::new(handler(move |job, _| {
            let seen = seen.clone();
            async move {
                let value: i64 = job.arg(0)?;
                seen.lock().unwrap().push(value);
                Ok(json!(value))
            }
        }))
        .with_concurrency(1)
        .without_hash(),
    )
    .await
    .unwrap();

    for handle in &handles {
        handle.result().await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![5, 50, 3, 1]);

    hive.shutdown().await;
}

/// Test that a transient failure is retried until retries are exhausted
#[tokio::test]
async fn test_retries_exhausted() {
    let hive = setup_hive();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    hive.bee(
        "flaky",
        BeeSpec::new(handler(move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(WorkerError::new("Bad job"))
            }
        })),
    )
    .await
    .unwrap();

    let job = hive
        .submit(
            JobRequest::new("flaky").options(
                SubmitOptions::new()
                    .with_retries(2)
                    .with_retry_delay(Duration::from_millis(30)),
            ),
        )
        .await
        .unwrap();

    let err = job.result().await.unwrap_err();
    assert_eq!(err.to_string(), "No more retries");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let history = &err.failure().unwrap().history;
    let exceptions = history
        .iter()
        .filter(|e| matches!(&e.event, HistoryEvent::Exception { message } if message == "Bad job"))
        .count();
    assert_eq!(exceptions, 3);
    assert_eq!(job.retries(), 2);

    hive.shutdown().await;
}

/// Test that a pending job canceled before any bee sees it never runs
#[tokio::test]
async fn test_cancel_pending_job() {
    let hive = setup_hive();
    let calls = Arc::new(AtomicUsize::new(0));

    let job = hive.submit(JobRequest::new("sum").args([1, 1])).await.unwrap();
    hive.cancel(job.jid()).await.unwrap();
    let err = job.result().await.unwrap_err();
    assert_eq!(err.to_string(), "Canceled");
    assert!(err.is_canceled());

    hive.bee("sum", BeeSpec::new(sum_handler(calls.clone())))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(hive.queue_size("sum").await.unwrap(), 0);

    let err = hive.job(job.jid()).await.unwrap_err();
    assert!(err.is_canceled());
    assert!(hive.cancel(beehive::Jid::new()).await.unwrap_err().is_not_found());

    hive.shutdown().await;
}

/// Test that canceling a running job settles its handle while the worker runs on
#[tokio::test]
async fn test_cancel_running_job() {
    let hive = setup_hive();
    let started = Arc::new(Notify::new());
    let finished = Arc::new(AtomicUsize::new(0));

    let (start_signal, done_count) = (started.clone(), finished.clone());
    hive.bee(
        "slow",
        BeeSpec::new(handler(move |_, _| {
            let (start_signal, done_count) = (start_signal.clone(), done_count.clone());
            async move {
                start_signal.notify_one();
                sleep(Duration::from_millis(150)).await;
                done_count.fetch_add(1, Ordering::SeqCst);
                Ok(json!("late"))
            }
        })),
    )
    .await
    .unwrap();

    let job = hive.submit(JobRequest::new("slow")).await.unwrap();
    started.notified().await;

    job.cancel().await.unwrap();
    let err = job.result().await.unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    assert!(wait_until(Duration::from_secs(2), || async { finished.load(Ordering::SeqCst) == 1 }).await);
    sleep(Duration::from_millis(50)).await;
    job.update().await.unwrap();
    assert_eq!(job.status(), JobStatus::Canceled);
    assert!(job.record().result.is_none());

    hive.shutdown().await;
}

/// Test that a dependant waits for its dependency and runs after it
#[tokio::test]
async fn test_dependency_gating() {
    let hive = setup_hive();
    let order = Arc::new(Mutex::new(Vec::new()));

    let seen = order.clone();
    hive.bee(
        "steps",
        BeeSpec::new(handler(move |job, _| {
            let seen = seen.clone();
            async move {
                let step: String = job.arg(0)?;
                if step == "first" {
                    sleep(Duration::from_millis(100)).await;
                }
                seen.lock().unwrap().push(step.clone());
                Ok(json!(step))
            }
        })),
    )
    .await
    .unwrap();

    let first = hive.submit(JobRequest::new("steps").arg("first")).await.unwrap();
    let second = hive
        .submit(
            JobRequest::new("steps")
                .arg("second")
                .options(SubmitOptions::new().with_dependency(first.jid())),
        )
        .await
        .unwrap();
    assert_eq!(second.status(), JobStatus::Delayed);
    assert!(second.record().find_event("dependancy_waiting").is_some());

    assert_eq!(second.result().await.unwrap(), json!("second"));
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

    // a dependency already finished does not gate
    let third = hive
        .submit(
            JobRequest::new("steps")
                .arg("third")
                .options(SubmitOptions::new().with_dependency(first.jid())),
        )
        .await
        .unwrap();
    assert!(third.record().find_event("dependancy_waiting").is_none());
    assert_eq!(third.result().await.unwrap(), json!("third"));

    hive.shutdown().await;
}

/// Test that a job leased by a dead bee is redelivered once its lease lapses
#[tokio::test]
async fn test_crash_recovery() {
    let (store, hive) = setup_shared();
    let calls = Arc::new(AtomicUsize::new(0));

    let job = hive.submit(JobRequest::new("sum").args([4, 4])).await.unwrap();

    let dead = StoreClient::new(store.clone(), "dead-hive", 16);
    let leased = dead
        .job_pop("sum", "dead-hive:sum", 1, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);

    hive.bee("sum", BeeSpec::new(sum_handler(calls.clone())))
        .await
        .unwrap();

    assert_eq!(job.result().await.unwrap(), json!(8));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    job.update().await.unwrap();
    assert_eq!(job.retries(), 1);
    let history = job.history();
    assert!(history.iter().any(|e| matches!(
        &e.event,
        HistoryEvent::Exception { message } if message == "Lease expired for worker dead-hive:sum"
    )));
    assert_eq!(job.record().count_events("popped"), 2);

    hive.shutdown().await;
}

/// Test tag search and tag replacement from a worker
#[tokio::test]
async fn test_tags_and_search() {
    let hive = setup_hive();

    let a = hive
        .submit(JobRequest::new("t").options(SubmitOptions::new().with_tags(["red", "big"])))
        .await
        .unwrap();
    let b = hive
        .submit(JobRequest::new("t").options(SubmitOptions::new().with_tags(["red"])))
        .await
        .unwrap();

    let mut red = hive.search(["red"]).await.unwrap();
    red.sort();
    assert_eq!(red, vec![a.jid(), b.jid()]);
    assert_eq!(hive.search(["red", "big"]).await.unwrap(), vec![a.jid()]);
    assert!(hive.search(["blue"]).await.unwrap().is_empty());

    hive.bee(
        "t",
        BeeSpec::new(handler(|job, _| async move {
            job.set_tags(["done"]).await?;
            Ok(Value::Null)
        }))
        .without_hash(),
    )
    .await
    .unwrap();

    a.result().await.unwrap();
    a.update().await.unwrap();
    assert_eq!(a.tags(), vec!["done".to_string()]);
    // the index is append-only
    assert!(hive.search(["big"]).await.unwrap().contains(&a.jid()));
    assert!(hive.search(["done"]).await.unwrap().contains(&a.jid()));

    hive.shutdown().await;
}

/// Test that progress notifications reach the handle in order
#[tokio::test]
async fn test_progress_notifications() {
    let hive = setup_hive();
    let job = hive.submit(JobRequest::new("progress")).await.unwrap();
    let mut stream = job.progress();

    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    let callback = job.on_progress(move |value| sink.lock().unwrap().push(value));

    hive.bee(
        "progress",
        BeeSpec::new(handler(|job, _| async move {
            job.progress(25).await?;
            job.progress(75).await?;
            Ok(json!("done"))
        })),
    )
    .await
    .unwrap();

    let mut values = Vec::new();
    while let Some(value) = stream.next().await {
        values.push(value);
    }
    assert_eq!(values, vec![json!(25), json!(75)]);
    assert_eq!(job.result().await.unwrap(), json!("done"));

    callback.await.unwrap();
    assert_eq!(*collected.lock().unwrap(), vec![json!(25), json!(75)]);

    hive.shutdown().await;
}

/// Test that the handle timeout bounds the wait but leaves the job alone
#[tokio::test]
async fn test_handle_timeout() {
    let hive = setup_hive();
    let job = hive
        .submit(
            JobRequest::new("nobody").options(SubmitOptions::new().with_timeout(Duration::from_millis(50))),
        )
        .await
        .unwrap();

    let err = job.result().await.unwrap_err();
    assert_eq!(err.to_string(), "Job handle timed out after 50 ms");
    assert_eq!(job.status(), JobStatus::Queued);
    assert_eq!(hive.queue_size("nobody").await.unwrap(), 1);

    hive.shutdown().await;
}

/// Test that a worker exceeding the bee timeout fails with a timeout message
#[tokio::test]
async fn test_worker_timeout() {
    let hive = setup_hive();
    hive.bee(
        "sleepy",
        BeeSpec::new(handler(|_, _| async {
            sleep(Duration::from_secs(1)).await;
            Ok(Value::Null)
        }))
        .with_timeout(Duration::from_millis(30)),
    )
    .await
    .unwrap();

    let job = hive
        .submit(JobRequest::new("sleepy").options(SubmitOptions::new().with_retries(0)))
        .await
        .unwrap();

    let err = job.result().await.unwrap_err();
    assert_eq!(err.to_string(), "No more retries");
    assert!(err.failure().unwrap().history.iter().any(|e| matches!(
        &e.event,
        HistoryEvent::Exception { message } if message == "Worker method timed out after 30 ms"
    )));

    hive.shutdown().await;
}

/// Test that an invalid custom hash fails the job without running the worker
#[tokio::test]
async fn test_invalid_hash_fails_permanently() {
    let hive = setup_hive();
    let calls = Arc::new(AtomicUsize::new(0));
    hive.bee(
        "sum",
        BeeSpec::new(sum_handler(calls.clone())).with_hash_fn(hash_fn(|_| async { Ok(json!("x")) })),
    )
    .await
    .unwrap();

    let job = hive.submit(JobRequest::new("sum").args([1, 2])).await.unwrap();
    let err = job.result().await.unwrap_err();
    assert_eq!(err.to_string(), "Hash string is too short: \"x\"");
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    hive.shutdown().await;
}

/// Test that a custom hash deduplicates jobs with different arguments
#[tokio::test]
async fn test_custom_hash_dedup() {
    let hive = setup_hive();
    let calls = Arc::new(AtomicUsize::new(0));
    hive.bee(
        "sum",
        BeeSpec::new(sum_handler(calls.clone()))
            .with_hash_fn(hash_fn(|_| async { Ok(json!("same-for-all")) })),
    )
    .await
    .unwrap();

    let first = hive.submit(JobRequest::new("sum").args([1, 2])).await.unwrap();
    assert_eq!(first.result().await.unwrap(), json!(3));

    let second = hive.submit(JobRequest::new("sum").args([10, 20])).await.unwrap();
    assert_eq!(second.result().await.unwrap(), json!(3));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    hive.shutdown().await;
}

/// Test that a bee never runs more jobs at once than its concurrency
#[tokio::test]
async fn test_concurrency_limit() {
    let hive = setup_hive();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (now, max) = (running.clone(), peak.clone());
    hive.bee(
        "pool",
        BeeSpec::new(handler(move |_, _| {
            let (now, max) = (now.clone(), max.clone());
            async move {
                let current = now.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(current, Ordering::SeqCst);
                sleep(Duration::from_millis(40)).await;
                now.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }))
        .with_concurrency(2)
        .without_hash(),
    )
    .await
    .unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        handles.push(hive.submit(JobRequest::new("pool")).await.unwrap());
    }
    for handle in handles {
        handle.result().await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    hive.shutdown().await;
}

/// Test that hives sharing a store cooperate: one submits, another executes
#[tokio::test]
async fn test_jobs_cross_hives() {
    let (store, producer) = setup_shared();
    let consumer = Hive::new(store.clone(), test_config()).unwrap();
    assert_ne!(producer.id(), consumer.id());

    let calls = Arc::new(AtomicUsize::new(0));
    consumer
        .bee("sum", BeeSpec::new(sum_handler(calls.clone())))
        .await
        .unwrap();

    let job = producer.submit(JobRequest::new("sum").args([20, 22])).await.unwrap();
    assert_eq!(job.result().await.unwrap(), json!(42));

    let popped_by = job.record();
    let popped = popped_by
        .history
        .iter()
        .find_map(|e| match &e.event {
            HistoryEvent::Popped { worker } => Some(worker.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(popped, format!("{}:sum", consumer.id()));

    let lookup = consumer.job(job.jid()).await.unwrap();
    assert_eq!(lookup.result().await.unwrap(), json!(42));

    producer.shutdown().await;
    consumer.shutdown().await;
}

/// Test delayed submission and queue size accounting
#[tokio::test]
async fn test_delayed_job_and_queue_size() {
    let hive = setup_hive();
    let calls = Arc::new(AtomicUsize::new(0));

    let delayed = hive
        .submit(
            JobRequest::new("sum")
                .args([1, 1])
                .options(SubmitOptions::new().with_delay(Duration::from_millis(150))),
        )
        .await
        .unwrap();
    assert_eq!(delayed.status(), JobStatus::Delayed);
    assert_eq!(hive.queue_size("sum").await.unwrap(), 1);
    assert_eq!(delayed.rank().await.unwrap(), None);

    hive.bee("sum", BeeSpec::new(sum_handler(calls.clone())))
        .await
        .unwrap();
    sleep(Duration::from_millis(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert_eq!(delayed.result().await.unwrap(), json!(2));
    assert_eq!(hive.queue_size("sum").await.unwrap(), 0);

    hive.shutdown().await;
}
