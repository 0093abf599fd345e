//! Typed client of the coordination store.
//!
//! [`StoreClient`] is the only way a hive talks to its store. It stamps every
//! script with the hive id and the store's clock, unwraps replies into typed
//! results, and maintains one subscription per queue channel whose events are
//! fanned out to an in-process broadcast bus shared by bees and job handles.

use crate::{
    BeehiveError, Result,
    engine::{Dedup, NewJob, Reply, Script, ScriptContext, SweepReport, Transition, keys},
    events::{QueueEvent, queue_channel},
    job::{Jid, JobHash, JobOptions, JobRecord, JobStatus},
    retry::Exception,
    store::CoordinationStore,
};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

struct ClientInner {
    store: Arc<dyn CoordinationStore>,
    hive_id: String,
    bus: broadcast::Sender<QueueEvent>,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, forwarder) in subscriptions.drain() {
            forwarder.abort();
        }
    }
}

#[derive(Clone)]
pub struct StoreClient {
    inner: Arc<ClientInner>,
}

impl StoreClient {
    pub fn new(store: Arc<dyn CoordinationStore>, hive_id: impl Into<String>, capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(ClientInner {
                store,
                hive_id: hive_id.into(),
                bus,
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn hive_id(&self) -> &str {
        &self.inner.hive_id
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.inner.store
    }

    /// Receive every event of every queue this client is subscribed to.
    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.bus.subscribe()
    }

    /// Forward the events of `queue` to the bus. Idempotent.
    pub async fn queue_subscribe(&self, queue: &str) -> Result<()> {
        if self.is_subscribed(queue) {
            return Ok(());
        }

        let mut messages = self.inner.store.subscribe(&queue_channel(queue)).await?;
        let bus = self.inner.bus.clone();
        let channel = queue.to_string();

        let mut subscriptions = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscriptions.contains_key(queue) {
            // lost a race with a concurrent subscriber
            return Ok(());
        }

        debug!("Subscribing to queue {}", queue);
        let forwarder = tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(message) => match QueueEvent::decode(&message) {
                        Ok(event) => {
                            // no receivers is fine
                            let _ = bus.send(event);
                        }
                        Err(e) => warn!("Dropping malformed event on queue {}: {}", channel, e),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Queue {} subscription lagged by {} events", channel, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        subscriptions.insert(queue.to_string(), forwarder);
        Ok(())
    }

    fn is_subscribed(&self, queue: &str) -> bool {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(queue)
    }

    /// Stop forwarding every queue.
    pub fn unsubscribe_all(&self) {
        let mut subscriptions = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, forwarder) in subscriptions.drain() {
            forwarder.abort();
        }
    }

    async fn call(&self, script: Script) -> Result<Reply> {
        let name = script.name();
        let now = self.inner.store.time().await?;
        let ctx = ScriptContext::new(self.inner.hive_id.clone(), now);
        self.inner.store.eval(ctx, script).await.map_err(|e| {
            error!("Script {} failed: {}", name, e);
            e
        })
    }

    /// Submit a job. Fails with `Canceled` when its parent was canceled.
    pub async fn job_put(&self, job: NewJob) -> Result<JobRecord> {
        self.queue_subscribe(&job.queue).await?;
        let jid = job.jid;
        match self.call(Script::Put(job)).await? {
            Reply::Put(Some(record)) => Ok(*record),
            Reply::Put(None) => Err(BeehiveError::Canceled { jid }),
            other => Err(unexpected("job/put", &other)),
        }
    }

    pub async fn job_pop(
        &self,
        queue: &str,
        worker: &str,
        max: usize,
        lease: Duration,
    ) -> Result<Vec<JobRecord>> {
        let script = Script::Pop {
            queue: queue.to_string(),
            worker: worker.to_string(),
            max,
            lease_ms: lease.as_millis() as u64,
        };
        match self.call(script).await? {
            Reply::Pop(jobs) => Ok(jobs),
            other => Err(unexpected("job/pop", &other)),
        }
    }

    pub async fn job_done(
        &self,
        job: &JobRecord,
        worker: &str,
        result: Value,
        options: JobOptions,
    ) -> Result<Transition> {
        let script = Script::Done {
            queue: job.queue.clone(),
            jid: job.jid,
            worker: worker.to_string(),
            lease: job.lease,
            result,
            options,
        };
        match self.call(script).await? {
            Reply::Done(transition) => Ok(transition),
            other => Err(unexpected("job/done", &other)),
        }
    }

    pub async fn job_failed(
        &self,
        job: &JobRecord,
        worker: &str,
        exception: Exception,
        options: JobOptions,
    ) -> Result<Transition> {
        let script = Script::Failed {
            queue: job.queue.clone(),
            jid: job.jid,
            worker: worker.to_string(),
            lease: job.lease,
            exception,
            options,
        };
        match self.call(script).await? {
            Reply::Failed(transition) => Ok(transition),
            other => Err(unexpected("job/failed", &other)),
        }
    }

    /// The record as stored, whatever its status; `None` once deleted.
    pub async fn job_record(&self, jid: Jid) -> Result<Option<JobRecord>> {
        match self.call(Script::Load { jid }).await? {
            Reply::Load(record) => Ok(record.map(|r| *r)),
            other => Err(unexpected("job/load", &other)),
        }
    }

    /// Load a job that can still produce or report an outcome.
    ///
    /// Fails with "Not found" once deleted, "Expired" past its TTL and
    /// "Canceled" when it (or the original it duplicates) was canceled.
    pub async fn job_load(&self, jid: Jid) -> Result<JobRecord> {
        let record = self
            .job_record(jid)
            .await?
            .ok_or_else(|| BeehiveError::JobNotFound {
                jid: jid.to_string(),
            })?;

        let original = record.duplicate.as_ref().map(|d| d.status);
        if record.status == JobStatus::Expired || original == Some(JobStatus::Expired) {
            return Err(BeehiveError::Expired { jid });
        }
        if record.status == JobStatus::Canceled || original == Some(JobStatus::Canceled) {
            return Err(BeehiveError::Canceled { jid });
        }
        Ok(record)
    }

    pub async fn job_hash(&self, job: &JobRecord, hash: JobHash, worker: &str) -> Result<Dedup> {
        let script = Script::Hash {
            queue: job.queue.clone(),
            jid: job.jid,
            hash,
            worker: worker.to_string(),
            lease: job.lease,
        };
        match self.call(script).await? {
            Reply::Hash(dedup) => Ok(dedup),
            other => Err(unexpected("job/hash", &other)),
        }
    }

    pub async fn job_set_tags(&self, jid: Jid, tags: Vec<String>) -> Result<()> {
        match self.call(Script::SetTags { jid, tags }).await? {
            Reply::SetTags(true) => Ok(()),
            Reply::SetTags(false) => Err(BeehiveError::JobNotFound {
                jid: jid.to_string(),
            }),
            other => Err(unexpected("job/tags", &other)),
        }
    }

    pub async fn job_cancel(&self, jid: Jid, grace: Duration) -> Result<()> {
        let script = Script::Cancel {
            jid,
            grace_ms: grace.as_millis() as u64,
        };
        match self.call(script).await? {
            Reply::Cancel(true) => Ok(()),
            Reply::Cancel(false) => Err(BeehiveError::JobNotFound {
                jid: jid.to_string(),
            }),
            other => Err(unexpected("job/cancel", &other)),
        }
    }

    /// Announce worker progress to every handle of the job.
    pub async fn job_progress(&self, queue: &str, jid: Jid, progress: Value) -> Result<()> {
        let event = QueueEvent::Progress {
            queue: queue.to_string(),
            jid,
            progress,
        };
        self.inner
            .store
            .publish(&queue_channel(queue), event.encode()?)
            .await?;
        Ok(())
    }

    /// Position of a ready job in its queue, `None` unless it is waiting there.
    pub async fn job_rank(&self, queue: &str, jid: Jid) -> Result<Option<usize>> {
        self.inner
            .store
            .zrank(&keys::ready(queue), &jid.to_string())
            .await
    }

    pub async fn bee_heartbeat(
        &self,
        queue: &str,
        worker: &str,
        lease: Duration,
        ttl: Duration,
    ) -> Result<usize> {
        let script = Script::Heartbeat {
            queue: queue.to_string(),
            worker: worker.to_string(),
            lease_ms: lease.as_millis() as u64,
            ttl_ms: ttl.as_millis() as u64,
        };
        match self.call(script).await? {
            Reply::Heartbeat(refreshed) => Ok(refreshed),
            other => Err(unexpected("bee/heartbeat", &other)),
        }
    }

    pub async fn bee_expired(&self, queue: &str) -> Result<SweepReport> {
        let script = Script::Expired {
            queue: queue.to_string(),
        };
        match self.call(script).await? {
            Reply::Expired(report) => Ok(report),
            other => Err(unexpected("bee/expired", &other)),
        }
    }

    /// Jobs tagged with every one of `tags`.
    pub async fn search(&self, tags: &[String]) -> Result<Vec<Jid>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = tags.iter().map(|tag| keys::tag(tag)).collect();
        let members = self.inner.store.sinter(&keys).await?;
        Ok(members
            .iter()
            .filter_map(|member| member.parse().ok())
            .collect())
    }

    /// Ready plus delayed jobs of a queue.
    pub async fn queue_size(&self, queue: &str) -> Result<usize> {
        let script = Script::Size {
            queue: queue.to_string(),
        };
        match self.call(script).await? {
            Reply::Size(size) => Ok(size),
            other => Err(unexpected("queue/size", &other)),
        }
    }
}

fn unexpected(script: &str, reply: &Reply) -> BeehiveError {
    BeehiveError::store(format!("Unexpected reply to {}: {:?}", script, reply))
}
