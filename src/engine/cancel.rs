use super::{ScriptContext, deps, keys, record};
use crate::{
    Result,
    events::QueueEvent,
    job::{HistoryEvent, Jid, JobStatus},
    store::Keyspace,
};
use std::collections::HashSet;
use tracing::debug;

/// Cancel `jid` and everything that hangs off it.
///
/// - pending jobs leave every index at once;
/// - running jobs are only marked, their worker finds out when it reports;
/// - terminal jobs keep their record for the grace period and take the
///   dependants still waiting on them along.
///
/// In every case the fingerprint is released and pending duplicates and
/// children are canceled too. Returns `false` when the job does not exist.
pub(super) fn cancel<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    jid: Jid,
    grace_ms: u64,
) -> Result<bool> {
    if record::status(ks, jid)?.is_none() {
        return Ok(false);
    }

    let mut pending = vec![jid];
    let mut seen = HashSet::new();
    while let Some(next) = pending.pop() {
        if seen.insert(next) {
            cancel_one(ks, ctx, next, grace_ms, &mut pending)?;
        }
    }
    Ok(true)
}

fn cancel_one<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    jid: Jid,
    grace_ms: u64,
    cascade: &mut Vec<Jid>,
) -> Result<()> {
    let Some(status) = record::status(ks, jid)? else {
        return Ok(());
    };
    if matches!(status, JobStatus::Canceled | JobStatus::Expired) {
        return Ok(());
    }
    let Some(queue) = record::queue(ks, jid) else {
        return Ok(());
    };
    let member = jid.to_string();

    match status {
        JobStatus::Queued | JobStatus::Delayed => {
            ks.zrem(&keys::ready(&queue), &member);
            ks.zrem(&keys::delayed(&queue), &member);
            deps::detach(ks, jid);
        }
        JobStatus::Completed | JobStatus::Failed => {
            cascade.extend(deps::waiting_on(ks, jid));
        }
        // running jobs keep their lease until the worker reports back
        _ => {}
    }

    debug!("Canceling job {} ({})", jid, status);
    record::set_status(ks, jid, JobStatus::Canceled);
    record::push_history(ks, ctx, jid, HistoryEvent::Canceled)?;

    let until = ctx.now.saturating_add(grace_ms as i64);
    record::schedule_expiry(ks, &queue, jid, until, until.saturating_add(grace_ms as i64));
    record::release_fingerprint(ks, &queue, jid)?;

    for key in [keys::duplicates(jid), keys::children(jid)] {
        for raw in ks.smembers(&key) {
            let Ok(related) = raw.parse::<Jid>() else {
                continue;
            };
            if record::status(ks, related)?.is_some_and(|s| s.is_pending()) {
                cascade.push(related);
            }
        }
    }

    if status.is_pending() {
        deps::resolve(ks, ctx, jid)?;
    }

    record::publish(
        ks,
        &QueueEvent::Canceled {
            queue: queue.clone(),
            jid,
        },
    )
}
