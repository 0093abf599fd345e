//! Client-side view of a submitted job.
//!
//! A [`JobHandle`] owns a snapshot of the job record and a single-assignment
//! outcome. A listener task follows the queue events for the job and settles
//! the outcome on the first terminal event; [`JobHandle::result`] waits for it.

use crate::{
    BeehiveError, Result,
    client::StoreClient,
    error::JobFailure,
    events::QueueEvent,
    job::{HistoryEntry, Jid, JobOptions, JobRecord, JobStatus, Outcome},
};
use serde_json::Value;
use std::{
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, Weak},
    time::Duration,
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch,
    },
    task::JoinHandle,
};
use tracing::{debug, warn};

const PROGRESS_CAPACITY: usize = 64;

struct HandleInner {
    client: StoreClient,
    jid: Jid,
    canceled_ttl: Duration,
    snapshot: RwLock<JobRecord>,
    outcome: watch::Sender<Option<Outcome>>,
    progress: broadcast::Sender<Value>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let listener = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(listener) = listener.take() {
            listener.abort();
        }
    }
}

impl HandleInner {
    fn snapshot(&self) -> RwLockReadGuard<'_, JobRecord> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn replace(&self, record: JobRecord) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = record;
    }

    fn set_status(&self, status: JobStatus) {
        self.snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .status = status;
    }

    /// Assign the outcome unless one is already set. Returns true once settled.
    fn settle(&self, outcome: Outcome) -> bool {
        self.outcome.send_if_modified(|current| {
            if current.is_none() {
                debug!("Job {} settled: {:?}", self.jid, outcome);
                *current = Some(outcome);
                true
            } else {
                false
            }
        });
        true
    }

    fn is_settled(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Apply one queue event. Returns true when the handle is settled.
    fn apply(&self, event: QueueEvent) -> bool {
        let jid = event.jid();
        let original = self.snapshot().duplicate_jid();

        if jid != self.jid {
            // an original only contributes its progress; its outcome is
            // mirrored onto this job and published under our own jid
            if let QueueEvent::Progress { progress, .. } = event {
                if Some(jid) == original {
                    let _ = self.progress.send(progress);
                }
            }
            return false;
        }

        match event {
            QueueEvent::New { .. } => false,
            QueueEvent::Progress { progress, .. } => {
                let _ = self.progress.send(progress);
                false
            }
            QueueEvent::Completed { job, .. } | QueueEvent::Failed { job, .. } => {
                let outcome = job.outcome();
                self.replace(*job);
                outcome.is_some_and(|outcome| self.settle(outcome))
            }
            QueueEvent::Duplicate { job, .. } => {
                let outcome = job.outcome();
                self.replace(*job);
                outcome.is_some_and(|outcome| self.settle(outcome))
            }
            QueueEvent::Canceled { .. } => {
                self.set_status(JobStatus::Canceled);
                self.settle(Outcome::Canceled)
            }
        }
    }

    /// Re-read the record; settles when the store already holds an outcome.
    async fn reload(&self) -> Result<bool> {
        match self.client.job_record(self.jid).await? {
            Some(record) => {
                let outcome = record.outcome();
                self.replace(record);
                Ok(outcome.is_some_and(|outcome| self.settle(outcome)))
            }
            None => Ok(self.settle(Outcome::Expired)),
        }
    }
}

async fn listen(inner: Weak<HandleInner>, mut events: broadcast::Receiver<QueueEvent>) {
    loop {
        let received = events.recv().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.is_settled() {
            break;
        }
        let settled = match received {
            Ok(event) => inner.apply(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    "Handle for job {} missed {} events, reloading",
                    inner.jid, skipped
                );
                match inner.reload().await {
                    Ok(settled) => settled,
                    Err(e) => {
                        warn!("Failed to reload job {}: {}", inner.jid, e);
                        false
                    }
                }
            }
            Err(RecvError::Closed) => break,
        };
        if settled {
            break;
        }
    }
}

/// Handle on a submitted job, cheap to clone.
///
/// ```rust,no_run
/// # async fn demo(hive: beehive::Hive) -> beehive::Result<()> {
/// use beehive::JobRequest;
/// use serde_json::json;
///
/// let job = hive.submit(JobRequest::new("sum").args([json!(2), json!(3)])).await?;
/// let mut progress = job.progress();
/// tokio::spawn(async move {
///     while let Some(value) = progress.next().await {
///         println!("progress: {}", value);
///     }
/// });
/// assert_eq!(job.result().await?, json!(5));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("jid", &self.inner.jid)
            .field("status", &self.status())
            .finish()
    }
}

impl JobHandle {
    /// Bind a handle to `record`. `events` must have been subscribed before
    /// the record was read so no transition can slip between the two.
    pub(crate) fn attach(
        client: StoreClient,
        record: JobRecord,
        events: broadcast::Receiver<QueueEvent>,
        canceled_ttl: Duration,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        let settled = record.outcome();

        let inner = Arc::new(HandleInner {
            client,
            jid: record.jid,
            canceled_ttl,
            snapshot: RwLock::new(record),
            outcome,
            progress,
            listener: Mutex::new(None),
        });

        match settled {
            Some(outcome) => {
                inner.settle(outcome);
            }
            None => {
                let listener = tokio::spawn(listen(Arc::downgrade(&inner), events));
                *inner
                    .listener
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(listener);
            }
        }

        Self { inner }
    }

    pub fn jid(&self) -> Jid {
        self.inner.jid
    }

    pub fn queue(&self) -> String {
        self.inner.snapshot().queue.clone()
    }

    pub fn status(&self) -> JobStatus {
        self.inner.snapshot().status
    }

    pub fn tags(&self) -> Vec<String> {
        self.inner.snapshot().tags.clone()
    }

    pub fn options(&self) -> JobOptions {
        self.inner.snapshot().options.clone()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.snapshot().history.clone()
    }

    pub fn data(&self) -> Vec<Value> {
        self.inner.snapshot().data.clone()
    }

    pub fn retries(&self) -> u32 {
        self.inner.snapshot().retries
    }

    pub fn parent(&self) -> Option<Jid> {
        self.inner.snapshot().parent
    }

    /// The original this job duplicates, once deduplicated.
    pub fn duplicate_jid(&self) -> Option<Jid> {
        self.inner.snapshot().duplicate_jid()
    }

    /// Full copy of the last known record.
    pub fn record(&self) -> JobRecord {
        self.inner.snapshot().clone()
    }

    /// The settled outcome, without waiting.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.outcome.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.inner.is_settled()
    }

    /// Wait for the job's outcome.
    ///
    /// Resolves with the worker's result, or rejects with the failure
    /// message ("No more retries", a permanent error message, "Canceled")
    /// carrying the job's jid, queue and history. Bounded by
    /// `options.timeout` when set; the job itself is unaffected.
    pub async fn result(&self) -> Result<Value> {
        let mut outcome_rx = self.inner.outcome.subscribe();
        let wait = async move {
            outcome_rx
                .wait_for(Option::is_some)
                .await
                .map(|settled| (*settled).clone())
        };

        let settled = match self.options().timeout_duration() {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                BeehiveError::Timeout {
                    message: format!("Job handle timed out after {} ms", limit.as_millis()),
                }
            })?,
            None => wait.await,
        };

        let outcome = settled
            .ok()
            .flatten()
            .ok_or_else(|| BeehiveError::store("Job handle closed before settling"))?;

        match outcome {
            Outcome::Completed(value) => Ok(value),
            Outcome::Failed(message) => Err(self.rejection(message, false).await),
            Outcome::Canceled => Err(self.rejection("Canceled".to_string(), true).await),
            Outcome::Expired => Err(BeehiveError::Expired { jid: self.jid() }),
        }
    }

    async fn rejection(&self, message: String, canceled: bool) -> BeehiveError {
        // best effort: the snapshot may predate the final history entries
        if let Err(e) = self.update().await {
            debug!("Could not refresh job {}: {}", self.jid(), e);
        }
        let record = self.inner.snapshot();
        BeehiveError::JobFailed(Box::new(JobFailure {
            message,
            jid: record.jid,
            queue: record.queue.clone(),
            history: record.history.clone(),
            canceled,
        }))
    }

    /// Progress notifications published by the worker, ending once the job
    /// settles.
    pub fn progress(&self) -> ProgressStream {
        ProgressStream {
            progress: self.inner.progress.subscribe(),
            outcome: self.inner.outcome.subscribe(),
        }
    }

    /// Invoke `callback` for every progress notification.
    pub fn on_progress<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(Value) + Send + 'static,
    {
        let mut stream = self.progress();
        tokio::spawn(async move {
            while let Some(value) = stream.next().await {
                callback(value);
            }
        })
    }

    /// Cancel the job. The handle rejects with "Canceled" once the store
    /// confirms.
    pub async fn cancel(&self) -> Result<()> {
        self.inner
            .client
            .job_cancel(self.jid(), self.inner.canceled_ttl)
            .await?;
        if let Err(e) = self.update().await {
            debug!("Could not refresh canceled job {}: {}", self.jid(), e);
        }
        self.inner.set_status(JobStatus::Canceled);
        self.inner.settle(Outcome::Canceled);
        Ok(())
    }

    /// Re-read the record from the store.
    pub async fn update(&self) -> Result<()> {
        let record = self
            .inner
            .client
            .job_record(self.jid())
            .await?
            .ok_or_else(|| BeehiveError::JobNotFound {
                jid: self.jid().to_string(),
            })?;
        // only a settled record may settle the handle; a stale snapshot must not
        if let Some(outcome) = record.outcome() {
            self.inner.settle(outcome);
        }
        self.inner.replace(record);
        Ok(())
    }

    /// Position in the ready queue, `None` unless the job is waiting there.
    pub async fn rank(&self) -> Result<Option<usize>> {
        let queue = self.queue();
        self.inner.client.job_rank(&queue, self.jid()).await
    }
}

/// Stream of progress values for one job.
pub struct ProgressStream {
    progress: broadcast::Receiver<Value>,
    outcome: watch::Receiver<Option<Outcome>>,
}

impl ProgressStream {
    /// The next progress value, or `None` once the job has settled and every
    /// buffered value was delivered.
    pub async fn next(&mut self) -> Option<Value> {
        loop {
            tokio::select! {
                biased;
                received = self.progress.recv() => match received {
                    Ok(value) => return Some(value),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                },
                _ = self.outcome.wait_for(Option::is_some) => return None,
            }
        }
    }
}
