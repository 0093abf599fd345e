//! Job submission: option merging, tag-based dependencies and handle creation.

use crate::{
    BeehiveError, Result,
    client::StoreClient,
    engine::NewJob,
    handle::JobHandle,
    job::{Jid, JobOptions},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Per-submission options, merged over the hive's defaults.
///
/// Durations are milliseconds on the wire. Unknown keys are rejected:
///
/// ```rust
/// use beehive::SubmitOptions;
/// use serde_json::json;
///
/// let options = SubmitOptions::from_value(json!({"priority": 3, "retryDelay": 1000})).unwrap();
/// assert_eq!(options.priority, Some(3));
///
/// assert!(SubmitOptions::from_value(json!({"preferredHostname": "x"})).is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubmitOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<Jid>>,
    /// Resolved into jids at submit time: every job carrying all of these tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies_on_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progressive_delay: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Jid>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from a JSON object.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| BeehiveError::Validation {
            message: format!("Invalid job options: {}", e),
        })
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_dependency(mut self, jid: Jid) -> Self {
        self.dependencies.get_or_insert_with(Vec::new).push(jid);
        self
    }

    pub fn with_dependencies(mut self, jids: impl IntoIterator<Item = Jid>) -> Self {
        self.dependencies
            .get_or_insert_with(Vec::new)
            .extend(jids);
        self
    }

    pub fn with_dependencies_on_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies_on_tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_progressive_delay(mut self, progressive: bool) -> Self {
        self.progressive_delay = Some(progressive);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_parent(mut self, parent: Jid) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Effective options: every field set here wins over `defaults`.
    pub fn merge(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            priority: self.priority.unwrap_or(defaults.priority),
            delay: self.delay.unwrap_or(defaults.delay),
            dependencies: self
                .dependencies
                .clone()
                .unwrap_or_else(|| defaults.dependencies.clone()),
            retries: self.retries.unwrap_or(defaults.retries),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            progressive_delay: self.progressive_delay.unwrap_or(defaults.progressive_delay),
            ttl: self.ttl.unwrap_or(defaults.ttl),
            timeout: self.timeout.or(defaults.timeout),
        }
    }
}

/// A job about to be submitted: queue, arguments and options.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub queue: String,
    pub args: Vec<Value>,
    pub options: SubmitOptions,
}

impl JobRequest {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            args: Vec::new(),
            options: SubmitOptions::default(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn options(mut self, options: SubmitOptions) -> Self {
        self.options = options;
        self
    }
}

/// Builds job records and hands them to the engine.
#[derive(Clone)]
pub struct Dispatcher {
    client: StoreClient,
    defaults: JobOptions,
    canceled_ttl: Duration,
}

impl Dispatcher {
    pub fn new(client: StoreClient, defaults: JobOptions, canceled_ttl: Duration) -> Self {
        Self {
            client,
            defaults,
            canceled_ttl,
        }
    }

    pub(crate) fn client(&self) -> &StoreClient {
        &self.client
    }

    pub fn defaults(&self) -> &JobOptions {
        &self.defaults
    }

    /// Submit a job and return a handle on it.
    ///
    /// Fails with "Canceled" when the parent job was canceled.
    pub async fn submit(&self, request: JobRequest) -> Result<JobHandle> {
        let JobRequest {
            queue,
            args,
            options: submitted,
        } = request;
        if queue.is_empty() {
            return Err(BeehiveError::Validation {
                message: "Queue name must not be empty".to_string(),
            });
        }

        // subscribe before the put so no transition of the new job is missed
        self.client.queue_subscribe(&queue).await?;
        let events = self.client.events();

        let mut options = submitted.merge(&self.defaults);
        if let Some(tags) = submitted.dependencies_on_tags.as_deref() {
            if !tags.is_empty() {
                let tagged = self.client.search(tags).await?;
                debug!("Tags {:?} resolved to {} dependencies", tags, tagged.len());
                options.dependencies.extend(tagged);
            }
        }
        let mut seen = std::collections::HashSet::new();
        options.dependencies.retain(|jid| seen.insert(*jid));

        let jid = Jid::new();
        debug!("Submitting job {} to queue {}", jid, queue);
        let record = self
            .client
            .job_put(NewJob {
                jid,
                queue,
                data: args,
                options,
                tags: submitted.tags.unwrap_or_default(),
                parent: submitted.parent,
            })
            .await?;

        Ok(JobHandle::attach(
            self.client.clone(),
            record,
            events,
            self.canceled_ttl,
        ))
    }

    /// A handle on an existing job.
    ///
    /// Fails with "Not found", "Expired" or "Canceled" per the job's state.
    pub async fn job(&self, jid: Jid) -> Result<JobHandle> {
        let record = self.client.job_load(jid).await?;
        self.client.queue_subscribe(&record.queue).await?;
        let events = self.client.events();

        // re-read after subscribing: the job may have moved on meanwhile
        let record = self
            .client
            .job_record(jid)
            .await?
            .ok_or_else(|| BeehiveError::JobNotFound {
                jid: jid.to_string(),
            })?;

        Ok(JobHandle::attach(
            self.client.clone(),
            record,
            events,
            self.canceled_ttl,
        ))
    }

    pub async fn search(&self, tags: &[String]) -> Result<Vec<Jid>> {
        self.client.search(tags).await
    }

    pub async fn cancel(&self, jid: Jid) -> Result<()> {
        self.client.job_cancel(jid, self.canceled_ttl).await
    }

    pub async fn queue_size(&self, queue: &str) -> Result<usize> {
        self.client.queue_size(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{job::JobStatus, store::MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    fn dispatcher() -> Dispatcher {
        let client = StoreClient::new(Arc::new(MemoryStore::new()), "host:1:dispatch", 64);
        Dispatcher::new(client, JobOptions::default(), Duration::from_secs(60))
    }

    #[test]
    fn test_merge_over_defaults() {
        let defaults = JobOptions::default();
        let merged = SubmitOptions::new()
            .with_priority(5)
            .with_retry_delay(Duration::from_secs(3))
            .with_timeout(Duration::from_millis(250))
            .merge(&defaults);

        assert_eq!(merged.priority, 5);
        assert_eq!(merged.retry_delay, 3000);
        assert_eq!(merged.timeout, Some(250));
        assert_eq!(merged.retries, 5);
        assert_eq!(merged.ttl, 30 * 60 * 1000);
        assert_eq!(merged.delay, 0);
        assert!(merged.dependencies.is_empty());
    }

    #[test]
    fn test_unknown_option_keys_are_rejected() {
        let err = SubmitOptions::from_value(json!({"priority": 1, "bogus": true})).unwrap_err();
        assert!(matches!(err, BeehiveError::Validation { .. }));

        let options = SubmitOptions::from_value(json!({
            "dependenciesOnTags": ["batch-7"],
            "progressiveDelay": true,
            "tags": ["a", "a"]
        }))
        .unwrap();
        assert_eq!(options.dependencies_on_tags, Some(vec!["batch-7".to_string()]));
        assert_eq!(options.progressive_delay, Some(true));
        assert_eq!(options.tags, Some(vec!["a".to_string(), "a".to_string()]));
    }

    #[tokio::test]
    async fn test_submit_and_lookup() {
        let dispatcher = dispatcher();
        let handle = dispatcher
            .submit(
                JobRequest::new("sum")
                    .args([2, 3])
                    .options(SubmitOptions::new().with_tags(["math"])),
            )
            .await
            .unwrap();

        assert_eq!(handle.status(), JobStatus::Queued);
        assert_eq!(handle.data(), vec![json!(2), json!(3)]);
        assert_eq!(handle.tags(), vec!["math".to_string()]);
        assert_eq!(dispatcher.queue_size("sum").await.unwrap(), 1);
        assert_eq!(
            dispatcher.search(&["math".to_string()]).await.unwrap(),
            vec![handle.jid()]
        );

        let again = dispatcher.job(handle.jid()).await.unwrap();
        assert_eq!(again.jid(), handle.jid());
        assert!(dispatcher.job(Jid::new()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_dependencies_on_tags_resolve_at_submit_time() {
        let dispatcher = dispatcher();
        let first = dispatcher
            .submit(JobRequest::new("q").options(SubmitOptions::new().with_tags(["batch"])))
            .await
            .unwrap();
        let second = dispatcher
            .submit(JobRequest::new("q").options(SubmitOptions::new().with_tags(["batch"])))
            .await
            .unwrap();

        let gated = dispatcher
            .submit(
                JobRequest::new("q").options(
                    SubmitOptions::new()
                        .with_dependency(first.jid())
                        .with_dependencies_on_tags(["batch"]),
                ),
            )
            .await
            .unwrap();

        let mut deps = gated.options().dependencies;
        deps.sort();
        assert_eq!(deps, vec![first.jid(), second.jid()]);
        assert_eq!(gated.status(), JobStatus::Delayed);
        assert!(gated.record().find_event("dependancy_waiting").is_some());
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_queue_and_canceled_parent() {
        let dispatcher = dispatcher();
        let err = dispatcher.submit(JobRequest::new("")).await.unwrap_err();
        assert!(matches!(err, BeehiveError::Validation { .. }));

        let parent = dispatcher.submit(JobRequest::new("q")).await.unwrap();
        dispatcher.cancel(parent.jid()).await.unwrap();
        let err = dispatcher
            .submit(JobRequest::new("q").options(SubmitOptions::new().with_parent(parent.jid())))
            .await
            .unwrap_err();
        assert!(err.is_canceled());
    }
}
