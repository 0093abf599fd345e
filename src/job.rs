//! Job data model: identifiers, options, status, history and the persisted record.
//!
//! A [`JobRecord`] is the full view of a job as stored by the scheduler engine:
//! identity (jid, queue, parent), payload (`data`), options, the mutable status
//! block and an append-only [`HistoryEntry`] log. Records travel between the
//! engine, the store client, bees and job handles unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr, time::Duration};
use uuid::Uuid;

/// Globally unique, time-ordered job identifier.
///
/// Jids are UUIDv7 values, so ordering two jids orders them by creation time
/// and the creation timestamp can be read back with [`Jid::created_at`].
///
/// # Examples
///
/// ```rust
/// use beehive::Jid;
///
/// let first = Jid::new();
/// let second = Jid::new();
/// assert!(first < second);
/// assert!(first.created_at().is_some());
///
/// let parsed: Jid = first.to_string().parse().unwrap();
/// assert_eq!(parsed, first);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(Uuid);

impl Jid {
    pub fn new() -> Self {
        Jid(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Creation time encoded in the identifier.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let (secs, nanos) = self.0.get_timestamp()?.to_unix();
        DateTime::from_timestamp(secs as i64, nanos)
    }
}

impl Default for Jid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for Jid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Jid)
    }
}

impl From<Uuid> for Jid {
    fn from(uuid: Uuid) -> Self {
        Jid(uuid)
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Delayed,
    Running,
    Completed,
    Failed,
    Canceled,
    Expired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Delayed => "delayed",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Expired => "expired",
        }
    }

    /// Completed, failed or canceled: the job will not be executed again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Queued, delayed or running.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Delayed | JobStatus::Running
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "delayed" => Ok(JobStatus::Delayed),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            "expired" => Ok(JobStatus::Expired),
            other => Err(format!("Unknown job status: {}", other)),
        }
    }
}

/// Effective scheduling options of a job, as stored with the record.
///
/// All durations are milliseconds so records stay portable across hives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct JobOptions {
    /// Higher values are served first.
    pub priority: i64,
    /// Milliseconds before the job becomes ready.
    pub delay: u64,
    /// Jobs that must reach a terminal state before this one is ready.
    pub dependencies: Vec<Jid>,
    /// Maximum number of retries after the first attempt.
    pub retries: u32,
    /// Base backoff in milliseconds.
    pub retry_delay: u64,
    /// Grow the backoff with the attempt number instead of keeping it fixed.
    pub progressive_delay: bool,
    /// Milliseconds a terminal result is retained.
    pub ttl: u64,
    /// Milliseconds a handle waits for the result before giving up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: 0,
            dependencies: Vec::new(),
            retries: 5,
            retry_delay: 30 * 1000,
            progressive_delay: false,
            ttl: 30 * 60 * 1000,
            timeout: None,
        }
    }
}

impl JobOptions {
    pub fn ttl_duration(&self) -> Duration {
        Duration::from_millis(self.ttl)
    }

    pub fn retry_delay_duration(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }
}

/// Dedup fingerprint of a job: a number or a string of at least two characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobHash {
    Number(serde_json::Number),
    Text(String),
}

impl JobHash {
    /// Validate the output of a hash function.
    pub fn try_from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) if s.chars().count() < 2 => {
                Err(format!("Hash string is too short: \"{}\"", s))
            }
            Value::String(s) => Ok(JobHash::Text(s.clone())),
            Value::Number(n) => Ok(JobHash::Number(n.clone())),
            other => Err(format!(
                "Hash can only be a number or string and not {}",
                json_type_name(other)
            )),
        }
    }

    /// Key fragment used in the dedup index. Numbers and strings never collide.
    pub fn fingerprint(&self) -> String {
        match self {
            JobHash::Number(n) => format!("n:{}", n),
            JobHash::Text(s) => format!("s:{}", s),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) | Value::Object(_) => "object",
    }
}

/// A single lifecycle event in a job's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
    Submitted,
    Queued,
    Popped { worker: String },
    Exception { message: String },
    Delayed { till: i64 },
    DependancyWaiting { dependencies: Vec<Jid> },
    Duplicate { duplicate_jid: Jid },
    Completed,
    Failed { message: String },
    Canceled,
    Tagged { tags: Vec<String> },
}

impl HistoryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HistoryEvent::Submitted => "submitted",
            HistoryEvent::Queued => "queued",
            HistoryEvent::Popped { .. } => "popped",
            HistoryEvent::Exception { .. } => "exception",
            HistoryEvent::Delayed { .. } => "delayed",
            HistoryEvent::DependancyWaiting { .. } => "dependancy_waiting",
            HistoryEvent::Duplicate { .. } => "duplicate",
            HistoryEvent::Completed => "completed",
            HistoryEvent::Failed { .. } => "failed",
            HistoryEvent::Canceled => "canceled",
            HistoryEvent::Tagged { .. } => "tagged",
        }
    }
}

/// Timestamped history entry, stamped with the hive that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Milliseconds since the Unix epoch, store time.
    pub timestamp: i64,
    pub hive: String,
    #[serde(flatten)]
    pub event: HistoryEvent,
}

impl HistoryEntry {
    pub fn at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// State of the original job a duplicate mirrors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateInfo {
    pub jid: Jid,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
}

/// Terminal outcome of a job as seen by a handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Value),
    Failed(String),
    Canceled,
    Expired,
}

/// Full job record as returned by the engine in a single atomic read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub jid: Jid,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Jid>,
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default)]
    pub options: JobOptions,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<JobHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub submitted_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Token of the latest lease; bumped on every pop and required to commit.
    #[serde(default)]
    pub lease: u64,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<DuplicateInfo>,
}

impl JobRecord {
    /// The outcome a handle should settle with, if the job (or the original it
    /// duplicates) has reached one.
    pub fn outcome(&self) -> Option<Outcome> {
        if let Some(original) = &self.duplicate {
            // A canceled duplicate reports cancellation regardless of the original.
            if self.status == JobStatus::Canceled {
                return Some(Outcome::Canceled);
            }
            return outcome_of(
                original.status,
                original.result.as_ref(),
                original.failed_reason.as_deref(),
            );
        }
        outcome_of(
            self.status,
            self.result.as_ref(),
            self.failed_reason.as_deref(),
        )
    }

    pub fn duplicate_jid(&self) -> Option<Jid> {
        self.duplicate.as_ref().map(|d| d.jid)
    }

    /// Names of the history events in order.
    pub fn event_names(&self) -> Vec<&'static str> {
        self.history.iter().map(|entry| entry.event.name()).collect()
    }

    pub fn count_events(&self, name: &str) -> usize {
        self.history
            .iter()
            .filter(|entry| entry.event.name() == name)
            .count()
    }

    pub fn find_event(&self, name: &str) -> Option<&HistoryEntry> {
        self.history.iter().find(|entry| entry.event.name() == name)
    }
}

pub(crate) fn outcome_of(
    status: JobStatus,
    result: Option<&Value>,
    failed_reason: Option<&str>,
) -> Option<Outcome> {
    match status {
        JobStatus::Completed => Some(Outcome::Completed(result.cloned().unwrap_or(Value::Null))),
        JobStatus::Failed => Some(Outcome::Failed(
            failed_reason.unwrap_or("Unknown error").to_string(),
        )),
        JobStatus::Canceled => Some(Outcome::Canceled),
        JobStatus::Expired => Some(Outcome::Expired),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_jids_are_time_ordered() {
        let jids: Vec<Jid> = (0..50).map(|_| Jid::new()).collect();
        let mut sorted = jids.clone();
        sorted.sort();
        assert_eq!(jids, sorted);

        let created = jids[0].created_at().unwrap();
        let drift = (Utc::now() - created).num_seconds().abs();
        assert!(drift < 5);
    }

    #[test]
    fn test_jid_string_round_trip_is_lexicographically_ordered() {
        let a = Jid::new();
        let b = Jid::new();
        assert!(a.to_string() < b.to_string());
        assert_eq!(a.to_string().parse::<Jid>().unwrap(), a);
        assert!("not-a-jid".parse::<Jid>().is_err());
    }

    #[test]
    fn test_status_helpers() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Expired.is_terminal());
        assert!(JobStatus::Running.is_pending());
        assert_eq!("delayed".parse::<JobStatus>().unwrap(), JobStatus::Delayed);
        assert_eq!(JobStatus::Queued.to_string(), "queued");
        assert_eq!(serde_json::to_value(JobStatus::Canceled).unwrap(), json!("canceled"));
    }

    #[test]
    fn test_default_options() {
        let options = JobOptions::default();
        assert_eq!(options.priority, 0);
        assert_eq!(options.delay, 0);
        assert_eq!(options.retries, 5);
        assert_eq!(options.retry_delay, 30_000);
        assert!(!options.progressive_delay);
        assert_eq!(options.ttl_duration(), Duration::from_secs(30 * 60));
        assert!(options.dependencies.is_empty());
    }

    #[test]
    fn test_options_use_camel_case_and_reject_unknown_keys() {
        let options: JobOptions =
            serde_json::from_value(json!({"retryDelay": 1000, "progressiveDelay": true}))
                .unwrap();
        assert_eq!(options.retry_delay, 1000);
        assert!(options.progressive_delay);
        assert_eq!(options.retries, 5);

        let err = serde_json::from_value::<JobOptions>(json!({"preferredHostname": "x"}));
        assert!(err.is_err());
    }

    #[test]
    fn test_hash_validation() {
        assert_eq!(
            JobHash::try_from_value(&json!("ab")).unwrap(),
            JobHash::Text("ab".to_string())
        );
        assert!(matches!(
            JobHash::try_from_value(&json!(42)).unwrap(),
            JobHash::Number(_)
        ));
        assert_eq!(
            JobHash::try_from_value(&json!("")).unwrap_err(),
            "Hash string is too short: \"\""
        );
        assert_eq!(
            JobHash::try_from_value(&Value::Null).unwrap_err(),
            "Hash can only be a number or string and not null"
        );
        assert_eq!(
            JobHash::try_from_value(&json!({"a": 1})).unwrap_err(),
            "Hash can only be a number or string and not object"
        );
        assert_ne!(
            JobHash::try_from_value(&json!(12)).unwrap().fingerprint(),
            JobHash::try_from_value(&json!("12")).unwrap().fingerprint()
        );
    }

    #[test]
    fn test_history_entry_serialization_is_flat() {
        let entry = HistoryEntry {
            timestamp: 1_700_000_000_000,
            hive: "host:1:abc".to_string(),
            event: HistoryEvent::Delayed { till: 1_700_000_003_000 },
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["event"], "delayed");
        assert_eq!(value["till"], 1_700_000_003_000i64);
        assert_eq!(value["hive"], "host:1:abc");

        let back: HistoryEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);

        let waiting = serde_json::to_value(HistoryEntry {
            timestamp: 1,
            hive: "h".into(),
            event: HistoryEvent::DependancyWaiting { dependencies: vec![] },
        })
        .unwrap();
        assert_eq!(waiting["event"], "dependancy_waiting");
    }

    #[test]
    fn test_duplicate_outcome_mirrors_original() {
        let mut record = JobRecord {
            jid: Jid::new(),
            queue: "q".into(),
            parent: None,
            data: vec![json!(1)],
            options: JobOptions::default(),
            tags: vec![],
            status: JobStatus::Running,
            hash: None,
            result: None,
            failed_reason: None,
            retries: 0,
            submitted_at: 0,
            worker: None,
            lease: 0,
            history: vec![],
            duplicate: None,
        };
        assert_eq!(record.outcome(), None);

        record.duplicate = Some(DuplicateInfo {
            jid: Jid::new(),
            status: JobStatus::Failed,
            result: None,
            failed_reason: Some("Argument must be positive".into()),
        });
        assert_eq!(
            record.outcome(),
            Some(Outcome::Failed("Argument must be positive".into()))
        );

        record.status = JobStatus::Canceled;
        assert_eq!(record.outcome(), Some(Outcome::Canceled));
    }
}
