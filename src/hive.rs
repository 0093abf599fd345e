use crate::{
    BeehiveError, Result,
    bee::{Bee, BeeSpec},
    client::StoreClient,
    config::HiveConfig,
    dispatcher::{Dispatcher, JobRequest},
    handle::JobHandle,
    job::Jid,
    store::CoordinationStore,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

struct HiveInner {
    id: String,
    config: HiveConfig,
    dispatcher: Dispatcher,
    swarm: Mutex<HashMap<String, Arc<Bee>>>,
}

/// One process's membership in the cluster: submits jobs and hosts bees.
///
/// Every hive sharing a store sees the same queues; a job submitted on one
/// hive may run on a bee of any other.
///
/// ```rust,no_run
/// use beehive::{BeeSpec, Hive, HiveConfig, JobRequest, MemoryStore, WorkerError, worker::handler};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn demo() -> beehive::Result<()> {
/// let hive = Hive::new(Arc::new(MemoryStore::new()), HiveConfig::default())?;
///
/// hive.bee("sum", BeeSpec::new(handler(|job, _| async move {
///     let a: i64 = job.arg(0)?;
///     let b: i64 = job.arg(1)?;
///     Ok::<_, WorkerError>(json!(a + b))
/// })))
/// .await?;
///
/// let job = hive.submit(JobRequest::new("sum").args([2, 3])).await?;
/// assert_eq!(job.result().await?, json!(5));
/// hive.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Hive {
    inner: Arc<HiveInner>,
}

impl Hive {
    pub fn new(store: Arc<dyn CoordinationStore>, config: HiveConfig) -> Result<Self> {
        config.validate()?;
        let id = hive_id();
        let client = StoreClient::new(store, id.clone(), config.channel_capacity);
        let dispatcher = Dispatcher::new(
            client,
            config.job_defaults.to_options(),
            config.canceled_ttl,
        );
        info!("Hive {} joined", id);

        Ok(Self {
            inner: Arc::new(HiveInner {
                id,
                config,
                dispatcher,
                swarm: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// `hostname:pid:uuid`
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &HiveConfig {
        &self.inner.config
    }

    /// Register a bee for `queue` and start it. A queue has at most one bee
    /// per hive: registering again returns the running bee unchanged.
    pub async fn bee(&self, queue: impl Into<String>, spec: BeeSpec) -> Result<Arc<Bee>> {
        let queue = queue.into();
        if queue.is_empty() {
            return Err(BeehiveError::Validation {
                message: "Queue name must not be empty".to_string(),
            });
        }
        if spec.concurrency == Some(0) {
            return Err(BeehiveError::Validation {
                message: "Bee concurrency must be at least 1".to_string(),
            });
        }

        let mut swarm = self.inner.swarm.lock().await;
        if let Some(bee) = swarm.get(&queue) {
            return Ok(Arc::clone(bee));
        }

        let bee = Bee::new(
            &self.inner.id,
            &queue,
            spec,
            &self.inner.config,
            self.inner.dispatcher.clone(),
        );
        bee.start().await?;
        info!("Registered bee {}", bee.id());
        swarm.insert(queue, Arc::clone(&bee));
        Ok(bee)
    }

    pub async fn get_bee(&self, queue: &str) -> Option<Arc<Bee>> {
        self.inner.swarm.lock().await.get(queue).cloned()
    }

    pub async fn submit(&self, request: JobRequest) -> Result<JobHandle> {
        self.inner.dispatcher.submit(request).await
    }

    pub async fn job(&self, jid: Jid) -> Result<JobHandle> {
        self.inner.dispatcher.job(jid).await
    }

    /// Jobs carrying every one of `tags`.
    pub async fn search<I, S>(&self, tags: I) -> Result<Vec<Jid>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        self.inner.dispatcher.search(&tags).await
    }

    pub async fn cancel(&self, jid: Jid) -> Result<()> {
        self.inner.dispatcher.cancel(jid).await
    }

    /// Ready plus delayed jobs of `queue`.
    pub async fn queue_size(&self, queue: &str) -> Result<usize> {
        self.inner.dispatcher.queue_size(queue).await
    }

    /// Stop every bee and drop the queue subscriptions.
    pub async fn shutdown(&self) {
        info!("Shutting down hive {}", self.inner.id);
        let bees: Vec<Arc<Bee>> = self
            .inner
            .swarm
            .lock()
            .await
            .drain()
            .map(|(_, bee)| bee)
            .collect();
        for bee in bees {
            bee.shutdown().await;
        }
        self.inner.dispatcher.client().unsubscribe_all();
    }
}

fn hive_id() -> String {
    format!("{}:{}:{}", hostname(), std::process::id(), Uuid::new_v4())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
