//! Per-queue worker runtime.
//!
//! A [`Bee`] runs three tasks: the pull loop, which leases as many jobs as it
//! has free slots and executes each one on its own task; the heartbeat, which
//! keeps its leases alive; and the expiry sweep, which recovers jobs whose
//! lease lapsed and walks finished jobs through their TTL.
//!
//! Each leased job goes through `hash → execute → done | failed`. The hash
//! step may turn the job into a duplicate of a live job with the same
//! fingerprint, in which case the worker is never invoked.

use crate::{
    Result,
    client::StoreClient,
    config::HiveConfig,
    dispatcher::Dispatcher,
    engine::{Dedup, Transition},
    events::QueueEvent,
    job::{JobHash, JobOptions, JobRecord},
    retry::WorkerError,
    worker::{Handler, HashFn, WorkerJob},
};
use chrono::DateTime;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{
        Notify,
        broadcast::{self, error::RecvError},
        mpsc,
    },
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

/// How a bee fingerprints jobs for deduplication.
#[derive(Clone, Default)]
pub enum HashMode {
    /// SHA-256 of the JSON-encoded argument list.
    #[default]
    Default,
    /// Every job runs.
    Disabled,
    /// A user function of the arguments. It must return a number or a string
    /// of at least two characters.
    Custom(HashFn),
}

impl fmt::Debug for HashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashMode::Default => f.write_str("Default"),
            HashMode::Disabled => f.write_str("Disabled"),
            HashMode::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Registration parameters of a bee.
#[derive(Clone)]
pub struct BeeSpec {
    pub concurrency: Option<usize>,
    pub hash: HashMode,
    pub timeout: Option<Duration>,
    pub handler: Handler,
}

impl BeeSpec {
    pub fn new(handler: Handler) -> Self {
        Self {
            concurrency: None,
            hash: HashMode::Default,
            timeout: None,
            handler,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_hash(mut self, hash: HashMode) -> Self {
        self.hash = hash;
        self
    }

    pub fn with_hash_fn(self, hash: HashFn) -> Self {
        self.with_hash(HashMode::Custom(hash))
    }

    pub fn without_hash(self) -> Self {
        self.with_hash(HashMode::Disabled)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct Bee {
    id: String,
    queue: String,
    concurrency: Option<usize>,
    hash: HashMode,
    timeout: Duration,
    handler: Handler,
    config: HiveConfig,
    client: StoreClient,
    dispatcher: Dispatcher,
    in_use: AtomicUsize,
    slot_freed: Notify,
    shutdown_tx: Mutex<Vec<mpsc::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Bee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bee")
            .field("id", &self.id)
            .field("concurrency", &self.concurrency)
            .field("hash", &self.hash)
            .field("timeout", &self.timeout)
            .field("in_use", &self.in_use())
            .finish()
    }
}

impl Bee {
    pub(crate) fn new(
        hive_id: &str,
        queue: &str,
        spec: BeeSpec,
        config: &HiveConfig,
        dispatcher: Dispatcher,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: format!("{}:{}", hive_id, queue),
            queue: queue.to_string(),
            concurrency: spec.concurrency.or(config.bee_defaults.concurrency),
            hash: spec.hash,
            timeout: spec.timeout.unwrap_or(config.bee_defaults.timeout),
            handler: spec.handler,
            config: config.clone(),
            client: dispatcher.client().clone(),
            dispatcher,
            in_use: AtomicUsize::new(0),
            slot_freed: Notify::new(),
            shutdown_tx: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// `<hive id>:<queue>`; also the worker id its leases are held under.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Jobs currently leased by this bee.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Subscribe to the queue and spawn the pull loop, heartbeat and sweep.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<()> {
        self.client.queue_subscribe(&self.queue).await?;
        let events = self.client.events();

        let (pull_tx, pull_rx) = mpsc::channel(1);
        let (beat_tx, beat_rx) = mpsc::channel(1);
        let (sweep_tx, sweep_rx) = mpsc::channel(1);

        let tasks = vec![
            tokio::spawn(Arc::clone(self).run(events, pull_rx)),
            tokio::spawn(Arc::clone(self).heartbeat_loop(beat_rx)),
            tokio::spawn(Arc::clone(self).sweep_loop(sweep_rx)),
        ];

        *self.shutdown_tx.lock().unwrap_or_else(PoisonError::into_inner) =
            vec![pull_tx, beat_tx, sweep_tx];
        *self.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks;
        Ok(())
    }

    /// Stop pulling, heartbeating and sweeping. Jobs already executing run
    /// to completion and still commit their outcome.
    pub async fn shutdown(&self) {
        info!("Shutting down bee {}", self.id);
        let senders =
            std::mem::take(&mut *self.shutdown_tx.lock().unwrap_or_else(PoisonError::into_inner));
        for tx in &senders {
            if tx.send(()).await.is_err() {
                warn!("Failed to send shutdown signal to bee {}", self.id);
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                error!("Bee {} task failed: {}", self.id, e);
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<QueueEvent>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!("Bee started for queue: {}", self.queue);

        loop {
            let full = match self.pull().await {
                Ok(full) => full,
                Err(e) => {
                    error!("Error popping jobs from queue {}: {}", self.queue, e);
                    false
                }
            };

            if full {
                // more may be waiting: pull again unless asked to stop
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = self.slot_freed.notified() => {}
                _ = wait_for_new(&self.queue, &mut events) => {}
                _ = sleep(self.config.poll_interval) => {}
            }
        }

        info!("Bee shutting down for queue: {}", self.queue);
    }

    /// Lease up to the number of free slots. Returns true when every slot
    /// asked for was filled.
    async fn pull(self: &Arc<Self>) -> Result<bool> {
        let available = match self.concurrency {
            Some(limit) => limit.saturating_sub(self.in_use()),
            None => self.config.fetch_batch,
        };
        if available == 0 {
            return Ok(false);
        }

        // reserve before popping so concurrent completions can't overbook
        self.in_use.fetch_add(available, Ordering::SeqCst);
        let jobs = match self
            .client
            .job_pop(&self.queue, &self.id, available, self.config.lease_duration)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                self.in_use.fetch_sub(available, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.in_use
            .fetch_sub(available - jobs.len(), Ordering::SeqCst);

        if !jobs.is_empty() {
            debug!("Bee {} leased {} jobs", self.id, jobs.len());
        }
        let full = jobs.len() == available;

        for job in jobs {
            let bee = Arc::clone(self);
            tokio::spawn(async move {
                let jid = job.jid;
                if let Err(e) = bee.process(job).await {
                    error!("Error processing job {}: {}", jid, e);
                }
                bee.in_use.fetch_sub(1, Ordering::SeqCst);
                bee.slot_freed.notify_one();
            });
        }
        Ok(full)
    }

    async fn process(&self, record: JobRecord) -> Result<()> {
        let jid = record.jid;

        if record.hash.is_none() {
            match self.fingerprint(&record.data).await {
                Ok(Some(hash)) => match self.client.job_hash(&record, hash, &self.id).await? {
                    Dedup::Owner => {}
                    Dedup::Duplicate { original } => {
                        info!("Job {} is a duplicate of {}", jid, original);
                        return Ok(());
                    }
                    Dedup::Skipped => {
                        debug!("Job {} is no longer leased by {}, skipping", jid, self.id);
                        return Ok(());
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!("Hashing job {} failed: {}", jid, e);
                    let options = record.options.clone();
                    return self.fail(&record, e, options).await;
                }
            }
        }

        debug!("Processing job: {}", jid);
        let job = WorkerJob::new(record.clone(), self.dispatcher.clone());
        let outcome = self.invoke(job.clone(), record.data.clone()).await;
        let options = job.options();

        match outcome {
            Ok(result) => self.complete(&record, result, options).await,
            Err(e) => self.fail(&record, e, options).await,
        }
    }

    /// Dedup fingerprint of a job's arguments, `None` with hashing disabled.
    async fn fingerprint(&self, args: &[Value]) -> std::result::Result<Option<JobHash>, WorkerError> {
        match &self.hash {
            HashMode::Disabled => Ok(None),
            HashMode::Default => {
                let encoded = serde_json::to_string(args)?;
                let digest = hex::encode(Sha256::digest(encoded.as_bytes()));
                Ok(Some(JobHash::Text(digest)))
            }
            HashMode::Custom(hash) => {
                let value = tokio::time::timeout(self.timeout, hash(args.to_vec()))
                    .await
                    .map_err(|_| {
                        WorkerError::new(format!(
                            "Hash method timed out after {} ms",
                            self.timeout.as_millis()
                        ))
                    })??;
                JobHash::try_from_value(&value)
                    .map(Some)
                    .map_err(WorkerError::permanent)
            }
        }
    }

    /// Run the handler on its own task. A timeout stops the wait, not the
    /// task; its late outcome is dropped.
    async fn invoke(&self, job: WorkerJob, args: Vec<Value>) -> std::result::Result<Value, WorkerError> {
        let jid = job.jid();
        let task = tokio::spawn((self.handler)(job, args));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!("Worker for job {} panicked: {}", jid, e);
                Err(WorkerError::new(format!("Worker method panicked: {}", e)))
            }
            Err(_) => {
                warn!("Job {} timed out after {:?}", jid, self.timeout);
                Err(WorkerError::new(format!(
                    "Worker method timed out after {} ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }

    async fn complete(&self, record: &JobRecord, result: Value, options: JobOptions) -> Result<()> {
        let transition = self
            .client
            .job_done(record, &self.id, result, options)
            .await?;
        self.report(record, transition);
        Ok(())
    }

    async fn fail(&self, record: &JobRecord, error: WorkerError, options: JobOptions) -> Result<()> {
        let exception = error.into_exception(&options);
        let transition = self
            .client
            .job_failed(record, &self.id, exception, options)
            .await?;
        self.report(record, transition);
        Ok(())
    }

    fn report(&self, record: &JobRecord, transition: Transition) {
        let jid = record.jid;
        match transition {
            Transition::Committed(job) => match job.failed_reason.as_deref() {
                Some(reason) => warn!("Job {} failed: {}", jid, reason),
                None => debug!("Job {} completed successfully", jid),
            },
            Transition::Retrying { till } => match DateTime::from_timestamp_millis(till) {
                Some(at) => info!("Retrying job {} at {}", jid, at),
                None => info!("Retrying job {}", jid),
            },
            Transition::Canceled => info!("Job {} was canceled while running", jid),
            Transition::Stale => warn!("Lease on job {} was lost, outcome discarded", jid),
            Transition::NotFound => warn!("Job {} disappeared before it could be committed", jid),
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => {
                    let lease = self.config.lease_duration;
                    match self.client.bee_heartbeat(&self.queue, &self.id, lease, lease).await {
                        Ok(refreshed) if refreshed > 0 => {
                            debug!("Bee {} refreshed {} leases", self.id, refreshed);
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Heartbeat failed for bee {}: {}", self.id, e),
                    }
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => match self.client.bee_expired(&self.queue).await {
                    Ok(report) if !report.is_empty() => info!(
                        "Sweep of queue {}: {} requeued, {} failed, {} expired, {} deleted",
                        self.queue,
                        report.requeued.len(),
                        report.failed.len(),
                        report.expired.len(),
                        report.deleted.len()
                    ),
                    Ok(_) => {}
                    Err(e) => error!("Expiry sweep failed for queue {}: {}", self.queue, e),
                },
            }
        }
    }
}

/// Resolves on a "new job" notification for `queue`, or after missed events.
async fn wait_for_new(queue: &str, events: &mut broadcast::Receiver<QueueEvent>) {
    loop {
        match events.recv().await {
            Ok(QueueEvent::New { queue: q, .. }) if q == queue => return,
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => return,
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
