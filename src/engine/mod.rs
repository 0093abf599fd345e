//! The scheduler engine: atomic scripts over the shared indexes.
//!
//! Every state transition of a job is one [`Script`], executed by the
//! coordination store as a single atomic unit against a [`Keyspace`]. A script
//! receives the caller's [`ScriptContext`] (hive identity and store time) and
//! answers with a [`Reply`]. Nothing outside these scripts mutates scheduling
//! state, which is what keeps ready, delayed, lease, dedup, dependency and tag
//! indexes consistent across any number of hives.
//!
//! | Script | Effect |
//! |---|---|
//! | `Put` | record a new job, queue it, delay it or park it on its dependencies |
//! | `Pop` | promote due delayed jobs, then lease up to `max` ready jobs to a worker |
//! | `Done` | commit a result under the lease token the job was popped with |
//! | `Failed` | schedule a retry or fail the job for good |
//! | `Hash` | claim a dedup fingerprint or turn the job into a duplicate |
//! | `Cancel` | cancel a job, its duplicates and its children |
//! | `SetTags` | replace the visible tags, extending the tag index |
//! | `Load` | read the full record |
//! | `Heartbeat` | refresh a worker's liveness and leases |
//! | `Expired` | requeue lapsed leases, expire and purge old records |
//! | `Size` | count the ready and delayed jobs of a queue |

use crate::{
    Result,
    job::{Jid, JobHash, JobOptions, JobRecord},
    retry::Exception,
    store::Keyspace,
};
use serde_json::Value;

mod cancel;
mod complete;
mod dedup;
mod deps;
pub(crate) mod keys;
mod maintenance;
mod pop;
mod record;
mod submit;
mod tags;


/// Caller identity and clock reading a script runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptContext {
    /// Hive id stamped on every history entry the script writes.
    pub hive_id: String,
    /// Store time in milliseconds since the Unix epoch.
    pub now: i64,
}

impl ScriptContext {
    pub fn new(hive_id: impl Into<String>, now: i64) -> Self {
        Self {
            hive_id: hive_id.into(),
            now,
        }
    }
}

/// A job as handed to `Put`, with its options already merged and its
/// dependencies resolved to jids.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub jid: Jid,
    pub queue: String,
    pub data: Vec<Value>,
    pub options: JobOptions,
    pub tags: Vec<String>,
    pub parent: Option<Jid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    Put(NewJob),
    Pop {
        queue: String,
        worker: String,
        max: usize,
        lease_ms: u64,
    },
    Done {
        queue: String,
        jid: Jid,
        worker: String,
        /// Lease token handed out by the `Pop` that delivered the job.
        lease: u64,
        result: Value,
        options: JobOptions,
    },
    Failed {
        queue: String,
        jid: Jid,
        worker: String,
        lease: u64,
        exception: Exception,
        options: JobOptions,
    },
    Load {
        jid: Jid,
    },
    Hash {
        queue: String,
        jid: Jid,
        hash: JobHash,
        worker: String,
        lease: u64,
    },
    SetTags {
        jid: Jid,
        tags: Vec<String>,
    },
    Cancel {
        jid: Jid,
        grace_ms: u64,
    },
    Heartbeat {
        queue: String,
        worker: String,
        lease_ms: u64,
        ttl_ms: u64,
    },
    Expired {
        queue: String,
    },
    /// Ready plus delayed jobs of a queue, counted in one pass.
    Size {
        queue: String,
    },
}

impl Script {
    pub fn name(&self) -> &'static str {
        match self {
            Script::Put(_) => "job/put",
            Script::Pop { .. } => "job/pop",
            Script::Done { .. } => "job/done",
            Script::Failed { .. } => "job/failed",
            Script::Load { .. } => "job/load",
            Script::Hash { .. } => "job/hash",
            Script::SetTags { .. } => "job/tags",
            Script::Cancel { .. } => "job/cancel",
            Script::Heartbeat { .. } => "bee/heartbeat",
            Script::Expired { .. } => "bee/expired",
            Script::Size { .. } => "queue/size",
        }
    }
}

/// Result of committing a job's outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The job reached its terminal state.
    Committed(Box<JobRecord>),
    /// The failure was recorded and the job will run again at `till`.
    Retrying { till: i64 },
    /// The job was canceled while running; the lease is released, nothing is published.
    Canceled,
    /// The caller no longer holds the lease.
    Stale,
    NotFound,
}

/// Result of claiming a dedup fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub enum Dedup {
    /// The job owns the fingerprint and should run.
    Owner,
    /// The job duplicates `original` and will mirror its outcome.
    Duplicate { original: Jid },
    /// The job is no longer leased by the caller (canceled, lapsed or gone).
    Skipped,
}

/// What an expiry sweep did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Jobs whose lease lapsed and that went back to the ready set.
    pub requeued: Vec<Jid>,
    /// Jobs whose lease lapsed with no retries left.
    pub failed: Vec<Jid>,
    /// Terminal jobs past their TTL, now reported as expired.
    pub expired: Vec<Jid>,
    /// Records deleted for good.
    pub deleted: Vec<Jid>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty()
            && self.failed.is_empty()
            && self.expired.is_empty()
            && self.deleted.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `None` when the parent was canceled and the job was refused.
    Put(Option<Box<JobRecord>>),
    Pop(Vec<JobRecord>),
    Done(Transition),
    Failed(Transition),
    Load(Option<Box<JobRecord>>),
    Hash(Dedup),
    /// `false` when the job does not exist.
    SetTags(bool),
    /// `false` when the job does not exist.
    Cancel(bool),
    /// Number of leases refreshed.
    Heartbeat(usize),
    Expired(SweepReport),
    Size(usize),
}

/// Run `script` against `keyspace`.
///
/// The caller guarantees exclusive access to the keyspace for the duration
/// of the call.
pub fn execute<K>(keyspace: &mut K, ctx: &ScriptContext, script: Script) -> Result<Reply>
where
    K: Keyspace + ?Sized,
{
    match script {
        Script::Put(job) => submit::put(keyspace, ctx, job).map(|r| Reply::Put(r.map(Box::new))),
        Script::Pop {
            queue,
            worker,
            max,
            lease_ms,
        } => pop::pop(keyspace, ctx, &queue, &worker, max, lease_ms).map(Reply::Pop),
        Script::Done {
            queue,
            jid,
            worker,
            lease,
            result,
            options,
        } => complete::done(keyspace, ctx, &queue, jid, &worker, lease, result, options)
            .map(Reply::Done),
        Script::Failed {
            queue,
            jid,
            worker,
            lease,
            exception,
            options,
        } => complete::failed(keyspace, ctx, &queue, jid, &worker, lease, exception, options)
            .map(Reply::Failed),
        Script::Load { jid } => {
            record::read(keyspace, jid).map(|r| Reply::Load(r.map(Box::new)))
        }
        Script::Hash {
            queue,
            jid,
            hash,
            worker,
            lease,
        } => dedup::hash(keyspace, ctx, &queue, jid, &hash, &worker, lease).map(Reply::Hash),
        Script::SetTags { jid, tags } => tags::set_tags(keyspace, ctx, jid, tags).map(Reply::SetTags),
        Script::Cancel { jid, grace_ms } => {
            cancel::cancel(keyspace, ctx, jid, grace_ms).map(Reply::Cancel)
        }
        Script::Heartbeat {
            queue,
            worker,
            lease_ms,
            ttl_ms,
        } => Ok(Reply::Heartbeat(maintenance::heartbeat(
            keyspace, ctx, &queue, &worker, lease_ms, ttl_ms,
        ))),
        Script::Expired { queue } => maintenance::expired(keyspace, ctx, &queue).map(Reply::Expired),
        Script::Size { queue } => Ok(Reply::Size(pop::size(keyspace, &queue))),
    }
}
