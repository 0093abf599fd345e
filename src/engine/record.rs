//! Reading and writing job records, plus the index moves every script shares.
//!
//! A record is a hash at [`keys::job`] with one field per attribute (complex
//! values JSON-encoded) and a list at [`keys::history`] with one JSON entry
//! per lifecycle event.

use super::{NewJob, ScriptContext, keys};
use crate::{
    BeehiveError, Result,
    events::{QueueEvent, queue_channel},
    job::{DuplicateInfo, HistoryEntry, HistoryEvent, Jid, JobHash, JobOptions, JobRecord, JobStatus},
    store::Keyspace,
};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;

const JID: &str = "jid";
const QUEUE: &str = "queue";
const PARENT: &str = "parent";
const DATA: &str = "data";
const OPTIONS: &str = "options";
const TAGS: &str = "tags";
const STATUS: &str = "status";
const HASH: &str = "hash";
const RESULT: &str = "result";
const FAILED_REASON: &str = "failedReason";
const RETRIES: &str = "retries";
const SUBMITTED_AT: &str = "submittedAt";
const WORKER: &str = "worker";
const LEASE: &str = "lease";
const DUPLICATE: &str = "duplicate";

fn corrupt(jid: Jid, detail: impl std::fmt::Display) -> BeehiveError {
    BeehiveError::store(format!("Corrupt record {}: {}", jid, detail))
}

fn decode<T: DeserializeOwned>(jid: Jid, field: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| corrupt(jid, format!("{}: {}", field, e)))
}

fn set_json<K, T>(ks: &mut K, jid: Jid, field: &str, value: &T) -> Result<()>
where
    K: Keyspace + ?Sized,
    T: Serialize + ?Sized,
{
    ks.hset(&keys::job(jid), field, serde_json::to_string(value)?);
    Ok(())
}

/// Write the identity, payload and option blocks of a new job.
pub(super) fn create<K: Keyspace + ?Sized>(ks: &mut K, ctx: &ScriptContext, job: &NewJob) -> Result<()> {
    let key = keys::job(job.jid);
    ks.hset(&key, JID, job.jid.to_string());
    ks.hset(&key, QUEUE, job.queue.clone());
    if let Some(parent) = job.parent {
        ks.hset(&key, PARENT, parent.to_string());
    }
    set_json(ks, job.jid, DATA, &job.data)?;
    set_json(ks, job.jid, OPTIONS, &job.options)?;
    set_json(ks, job.jid, TAGS, &job.tags)?;
    ks.hset(&key, RETRIES, "0".to_string());
    ks.hset(&key, SUBMITTED_AT, ctx.now.to_string());
    set_status(ks, job.jid, JobStatus::Queued);
    Ok(())
}

pub(super) fn exists<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid) -> bool {
    ks.exists(&keys::job(jid))
}

/// Status of a job, `None` once the record is gone.
pub(super) fn status<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid) -> Result<Option<JobStatus>> {
    ks.hget(&keys::job(jid), STATUS)
        .map(|raw| raw.parse().map_err(|e| corrupt(jid, e)))
        .transpose()
}

pub(super) fn set_status<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid, status: JobStatus) {
    ks.hset(&keys::job(jid), STATUS, status.as_str().to_string());
}

pub(super) fn queue<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid) -> Option<String> {
    ks.hget(&keys::job(jid), QUEUE)
}

pub(super) fn options<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid) -> Result<JobOptions> {
    match ks.hget(&keys::job(jid), OPTIONS) {
        Some(raw) => decode(jid, OPTIONS, &raw),
        None => Ok(JobOptions::default()),
    }
}

pub(super) fn set_options<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid, options: &JobOptions) -> Result<()> {
    set_json(ks, jid, OPTIONS, options)
}

pub(super) fn retries<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid) -> Result<u32> {
    match ks.hget(&keys::job(jid), RETRIES) {
        Some(raw) => raw.parse().map_err(|e| corrupt(jid, e)),
        None => Ok(0),
    }
}

pub(super) fn set_retries<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid, retries: u32) {
    ks.hset(&keys::job(jid), RETRIES, retries.to_string());
}

pub(super) fn submitted_at<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid) -> Result<i64> {
    match ks.hget(&keys::job(jid), SUBMITTED_AT) {
        Some(raw) => raw.parse().map_err(|e| corrupt(jid, e)),
        None => Ok(0),
    }
}

pub(super) fn set_tags<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid, tags: &[String]) -> Result<()> {
    set_json(ks, jid, TAGS, tags)
}

pub(super) fn hash<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid) -> Result<Option<JobHash>> {
    ks.hget(&keys::job(jid), HASH)
        .map(|raw| decode(jid, HASH, &raw))
        .transpose()
}

pub(super) fn set_hash<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid, hash: &JobHash) -> Result<()> {
    set_json(ks, jid, HASH, hash)
}

pub(super) fn worker<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid) -> Option<String> {
    ks.hget(&keys::job(jid), WORKER)
}

/// Token of the most recent lease on `jid`, 0 before its first pop.
pub(super) fn lease<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid) -> Result<u64> {
    match ks.hget(&keys::job(jid), LEASE) {
        Some(raw) => raw.parse().map_err(|e| corrupt(jid, e)),
        None => Ok(0),
    }
}

pub(super) fn set_result<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid, result: &serde_json::Value) -> Result<()> {
    set_json(ks, jid, RESULT, result)
}

pub(super) fn set_failed_reason<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid, reason: &str) {
    ks.hset(&keys::job(jid), FAILED_REASON, reason.to_string());
}

pub(super) fn set_duplicate_of<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid, original: Jid) {
    ks.hset(&keys::job(jid), DUPLICATE, original.to_string());
}

/// Copy the terminal block of `from` onto `to`.
pub(super) fn copy_outcome<K: Keyspace + ?Sized>(ks: &mut K, from: Jid, to: Jid) {
    let source = keys::job(from);
    let target = keys::job(to);
    for field in [STATUS, RESULT, FAILED_REASON] {
        match ks.hget(&source, field) {
            Some(value) => ks.hset(&target, field, value),
            None => {
                ks.hdel(&target, field);
            }
        }
    }
}

pub(super) fn push_history<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    jid: Jid,
    event: HistoryEvent,
) -> Result<()> {
    let entry = HistoryEntry {
        timestamp: ctx.now,
        hive: ctx.hive_id.clone(),
        event,
    };
    ks.rpush(&keys::history(jid), serde_json::to_string(&entry)?);
    Ok(())
}

/// Read the full record in one go, `None` once it is gone.
pub(super) fn read<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid) -> Result<Option<JobRecord>> {
    let fields = ks.hgetall(&keys::job(jid));
    if fields.is_empty() {
        return Ok(None);
    }

    let history = ks
        .lrange(&keys::history(jid))
        .iter()
        .map(|raw| decode(jid, "history", raw))
        .collect::<Result<Vec<HistoryEntry>>>()?;

    let duplicate = match fields.get(DUPLICATE) {
        Some(raw) => {
            let original: Jid = raw.parse().map_err(|e| corrupt(jid, e))?;
            Some(duplicate_info(ks, original)?)
        }
        None => None,
    };

    Ok(Some(from_fields(jid, &fields, history, duplicate)?))
}

fn duplicate_info<K: Keyspace + ?Sized>(ks: &mut K, original: Jid) -> Result<DuplicateInfo> {
    let fields = ks.hgetall(&keys::job(original));
    let status = match fields.get(STATUS) {
        Some(raw) => raw.parse().map_err(|e| corrupt(original, e))?,
        // an original that is already gone has expired
        None => JobStatus::Expired,
    };
    Ok(DuplicateInfo {
        jid: original,
        status,
        result: fields
            .get(RESULT)
            .map(|raw| decode(original, RESULT, raw))
            .transpose()?,
        failed_reason: fields.get(FAILED_REASON).cloned(),
    })
}

fn from_fields(
    jid: Jid,
    fields: &HashMap<String, String>,
    history: Vec<HistoryEntry>,
    duplicate: Option<DuplicateInfo>,
) -> Result<JobRecord> {
    let field = |name: &str| fields.get(name).map(String::as_str);

    Ok(JobRecord {
        jid,
        queue: field(QUEUE).unwrap_or_default().to_string(),
        parent: field(PARENT)
            .map(|raw| raw.parse().map_err(|e| corrupt(jid, e)))
            .transpose()?,
        data: field(DATA)
            .map(|raw| decode(jid, DATA, raw))
            .transpose()?
            .unwrap_or_default(),
        options: field(OPTIONS)
            .map(|raw| decode(jid, OPTIONS, raw))
            .transpose()?
            .unwrap_or_default(),
        tags: field(TAGS)
            .map(|raw| decode(jid, TAGS, raw))
            .transpose()?
            .unwrap_or_default(),
        status: field(STATUS)
            .ok_or_else(|| corrupt(jid, "missing status"))?
            .parse()
            .map_err(|e| corrupt(jid, e))?,
        hash: field(HASH).map(|raw| decode(jid, HASH, raw)).transpose()?,
        result: field(RESULT).map(|raw| decode(jid, RESULT, raw)).transpose()?,
        failed_reason: field(FAILED_REASON).map(str::to_string),
        retries: field(RETRIES)
            .map(|raw| raw.parse().map_err(|e| corrupt(jid, e)))
            .transpose()?
            .unwrap_or_default(),
        submitted_at: field(SUBMITTED_AT)
            .map(|raw| raw.parse().map_err(|e| corrupt(jid, e)))
            .transpose()?
            .unwrap_or_default(),
        worker: field(WORKER).map(str::to_string),
        lease: field(LEASE)
            .map(|raw| raw.parse().map_err(|e| corrupt(jid, e)))
            .transpose()?
            .unwrap_or_default(),
        history,
        duplicate,
    })
}

/// Read a record that the calling script just wrote.
pub(super) fn reread<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid) -> Result<JobRecord> {
    read(ks, jid)?.ok_or_else(|| corrupt(jid, "record vanished mid-script"))
}

pub(super) fn publish<K: Keyspace + ?Sized>(ks: &mut K, event: &QueueEvent) -> Result<()> {
    ks.publish(&queue_channel(event.queue()), event.encode()?);
    Ok(())
}

/// Put a job into the ready set and announce it.
pub(super) fn make_ready<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
    jid: Jid,
    priority: i64,
) -> Result<()> {
    let member = jid.to_string();
    ks.zrem(&keys::delayed(queue), &member);
    ks.zadd(&keys::ready(queue), keys::ready_score(priority), &member);
    set_status(ks, jid, JobStatus::Queued);
    push_history(ks, ctx, jid, HistoryEvent::Queued)?;
    publish(
        ks,
        &QueueEvent::New {
            queue: queue.to_string(),
            jid,
        },
    )
}

/// Park a job in the delayed set until `till`.
pub(super) fn make_delayed<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
    jid: Jid,
    till: i64,
) -> Result<()> {
    let member = jid.to_string();
    ks.zrem(&keys::ready(queue), &member);
    ks.zadd(&keys::delayed(queue), till as f64, &member);
    set_status(ks, jid, JobStatus::Delayed);
    push_history(ks, ctx, jid, HistoryEvent::Delayed { till })
}

/// Drop whatever lease is held on `jid`.
pub(super) fn release_lease<K: Keyspace + ?Sized>(ks: &mut K, queue: &str, jid: Jid) {
    let member = jid.to_string();
    ks.zrem(&keys::locks(queue), &member);
    if let Some(worker) = worker(ks, jid) {
        ks.srem(&keys::worker(&worker), &member);
    }
    ks.hdel(&keys::job(jid), WORKER);
}

/// Lease `jid` to `worker` until `until` under a fresh token.
///
/// Every pop bumps the token, so an attempt whose lease lapsed cannot commit
/// even when the same worker gets the job back.
pub(super) fn take_lease<K: Keyspace + ?Sized>(
    ks: &mut K,
    queue: &str,
    jid: Jid,
    worker: &str,
    until: i64,
) -> Result<u64> {
    let token = lease(ks, jid)?.saturating_add(1);
    let member = jid.to_string();
    ks.zadd(&keys::locks(queue), until as f64, &member);
    ks.sadd(&keys::worker(worker), &member);
    let key = keys::job(jid);
    ks.hset(&key, WORKER, worker.to_string());
    ks.hset(&key, LEASE, token.to_string());
    Ok(token)
}

/// True when `worker` holds the lease `token` on `jid` and it has not lapsed.
pub(super) fn holds_lease<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
    jid: Jid,
    worker: &str,
    token: u64,
) -> Result<bool> {
    let live = ks
        .zscore(&keys::locks(queue), &jid.to_string())
        .is_some_and(|until| until >= ctx.now as f64);
    Ok(live && self::worker(ks, jid).as_deref() == Some(worker) && lease(ks, jid)? == token)
}

/// Release the dedup fingerprint if `jid` still owns it.
pub(super) fn release_fingerprint<K: Keyspace + ?Sized>(ks: &mut K, queue: &str, jid: Jid) -> Result<()> {
    if let Some(hash) = hash(ks, jid)? {
        let key = keys::hash(queue, &hash.fingerprint());
        if ks.get(&key).as_deref() == Some(jid.to_string().as_str()) {
            ks.del(&key);
        }
    }
    Ok(())
}

/// Schedule the next expiry step of `jid` at `step_at` and let every key of
/// the job lapse on its own at `keep_until`, should no sweep get to it first.
pub(super) fn schedule_expiry<K: Keyspace + ?Sized>(
    ks: &mut K,
    queue: &str,
    jid: Jid,
    step_at: i64,
    keep_until: i64,
) {
    ks.zadd(&keys::expires(queue), step_at as f64, &jid.to_string());
    for key in job_keys(jid) {
        ks.pexpire_at(&key, keep_until);
    }
}

fn job_keys(jid: Jid) -> [String; 6] {
    [
        keys::job(jid),
        keys::history(jid),
        keys::duplicates(jid),
        keys::children(jid),
        keys::dependants(jid),
        keys::waiting(jid),
    ]
}

/// Remove every key of a job.
pub(super) fn delete<K: Keyspace + ?Sized>(ks: &mut K, queue: &str, jid: Jid) {
    release_lease(ks, queue, jid);
    let member = jid.to_string();
    for key in [keys::ready(queue), keys::delayed(queue), keys::expires(queue)] {
        ks.zrem(&key, &member);
    }
    for key in job_keys(jid) {
        ks.del(&key);
    }
}
