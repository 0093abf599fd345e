use crate::{
    BeehiveError, Result,
    dispatcher::{Dispatcher, JobRequest},
    handle::JobHandle,
    job::{Jid, JobOptions, JobRecord, JobStatus},
    retry::WorkerError,
};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

/// User code executed for every job of a queue.
pub type Handler = Arc<
    dyn Fn(WorkerJob, Vec<Value>) -> BoxFuture<'static, std::result::Result<Value, WorkerError>>
        + Send
        + Sync,
>;

/// Dedup fingerprint computed from a job's arguments.
pub type HashFn =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, std::result::Result<Value, WorkerError>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
///
/// ```rust
/// use beehive::{WorkerError, worker::handler};
/// use serde_json::json;
///
/// let sum = handler(|job, args| async move {
///     let a: i64 = job.arg(0)?;
///     let b: i64 = job.arg(1)?;
///     if a < 0 || b < 0 {
///         return Err(WorkerError::permanent("Argument must be positive"));
///     }
///     let _ = args;
///     Ok(json!(a + b))
/// });
/// # let _ = sum;
/// ```
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(WorkerJob, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, WorkerError>> + Send + 'static,
{
    Arc::new(move |job, args| Box::pin(f(job, args)))
}

/// Wrap an async closure as a [`HashFn`].
pub fn hash_fn<F, Fut>(f: F) -> HashFn
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, WorkerError>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// Worker-side view of a leased job.
///
/// Options changed through [`WorkerJob::update_options`] are committed with
/// the job's outcome, so a worker can e.g. extend its own retries.
#[derive(Clone)]
pub struct WorkerJob {
    record: Arc<JobRecord>,
    options: Arc<Mutex<JobOptions>>,
    dispatcher: Dispatcher,
}

impl WorkerJob {
    pub(crate) fn new(record: JobRecord, dispatcher: Dispatcher) -> Self {
        let options = record.options.clone();
        Self {
            record: Arc::new(record),
            options: Arc::new(Mutex::new(options)),
            dispatcher,
        }
    }

    pub fn jid(&self) -> Jid {
        self.record.jid
    }

    pub fn queue(&self) -> &str {
        &self.record.queue
    }

    pub fn data(&self) -> &[Value] {
        &self.record.data
    }

    /// Deserialize argument `index`. A missing or mistyped argument is a
    /// permanent failure.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, WorkerError> {
        let value = self.record.data.get(index).cloned().ok_or_else(|| {
            WorkerError::permanent(format!("Missing job argument {}", index))
        })?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn tags(&self) -> &[String] {
        &self.record.tags
    }

    pub fn retries(&self) -> u32 {
        self.record.retries
    }

    /// The record as popped.
    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn options(&self) -> JobOptions {
        self.options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_options<F>(&self, update: F)
    where
        F: FnOnce(&mut JobOptions),
    {
        update(&mut self.options.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Publish a progress notification to every handle of this job.
    pub async fn progress(&self, progress: impl Into<Value>) -> Result<()> {
        self.dispatcher
            .client()
            .job_progress(&self.record.queue, self.record.jid, progress.into())
            .await
    }

    pub async fn set_tags<I, S>(&self, tags: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags = tags.into_iter().map(Into::into).collect();
        self.dispatcher
            .client()
            .job_set_tags(self.record.jid, tags)
            .await
    }

    /// Submit a child job. Canceling this job cancels the child too.
    pub async fn sub(&self, mut request: JobRequest) -> Result<JobHandle> {
        request.options.parent = Some(self.record.jid);
        self.dispatcher.submit(request).await
    }

    /// Whether the job was canceled while running. Cancellation of a running
    /// job is cooperative: long workers should poll this.
    pub async fn is_canceled(&self) -> Result<bool> {
        match self.dispatcher.client().job_record(self.record.jid).await? {
            Some(record) => Ok(record.status == JobStatus::Canceled),
            None => Err(BeehiveError::JobNotFound {
                jid: self.record.jid.to_string(),
            }),
        }
    }
}
