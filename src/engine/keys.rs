//! Key layout of the shared namespace.
//!
//! Prefixes encode the value type: `h` hash, `l` list, `s` set, `ss` sorted
//! set, `str` string.

use crate::job::Jid;

/// Full record of a job.
pub fn job(jid: Jid) -> String {
    format!("bee:h:jobs:{}", jid)
}

/// Append-only history of a job.
pub fn history(jid: Jid) -> String {
    format!("bee:l:history:{}", jid)
}

/// Ready jobs, scored by negated priority so the lowest score pops first.
pub fn ready(queue: &str) -> String {
    format!("bee:ss:queue:{}", queue)
}

/// Delayed, retry-pending and dependency-waiting jobs, scored by ready time.
pub fn delayed(queue: &str) -> String {
    format!("bee:ss:delayed:{}", queue)
}

/// Leased jobs, scored by lease expiry.
pub fn locks(queue: &str) -> String {
    format!("bee:ss:locks:{}", queue)
}

/// Terminal and canceled jobs, scored by the time their next expiry step is due.
pub fn expires(queue: &str) -> String {
    format!("bee:ss:expires:{}", queue)
}

/// Jobs currently leased by a worker.
pub fn worker(worker: &str) -> String {
    format!("bee:s:worker:{}", worker)
}

pub fn heartbeat(worker: &str) -> String {
    format!("bee:str:heartbeat:{}", worker)
}

/// Owner of a dedup fingerprint within a queue.
pub fn hash(queue: &str, fingerprint: &str) -> String {
    format!("bee:str:hash:{}:{}", queue, fingerprint)
}

pub fn duplicates(jid: Jid) -> String {
    format!("bee:s:duplicates:{}", jid)
}

pub fn children(jid: Jid) -> String {
    format!("bee:s:children:{}", jid)
}

/// Jobs waiting on `jid`.
pub fn dependants(jid: Jid) -> String {
    format!("bee:s:dependants:{}", jid)
}

/// Unresolved dependencies of `jid`; its cardinality is the remaining count.
pub fn waiting(jid: Jid) -> String {
    format!("bee:s:waiting:{}", jid)
}

pub fn tag(tag: &str) -> String {
    format!("bee:s:tags:{}", tag)
}

/// Score of a ready job: higher priority sorts first.
pub fn ready_score(priority: i64) -> f64 {
    // 0.0 - x keeps priority 0 at +0.0
    0.0 - priority as f64
}
