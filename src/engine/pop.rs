use super::{ScriptContext, keys, record};
use crate::{
    Result,
    job::{HistoryEvent, Jid, JobRecord, JobStatus},
    store::Keyspace,
};

/// Lease up to `max` ready jobs of `queue` to `worker`.
///
/// Delayed jobs that are due move to the ready set first, so a retry or a
/// delayed job competes on priority with everything already queued.
pub(super) fn pop<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
    worker: &str,
    max: usize,
    lease_ms: u64,
) -> Result<Vec<JobRecord>> {
    promote_due(ks, ctx, queue)?;

    if max == 0 {
        return Ok(Vec::new());
    }

    let ready = keys::ready(queue);
    let lease_until = ctx.now.saturating_add(lease_ms as i64);
    let mut popped = Vec::new();

    for member in ks.zrange(&ready, max) {
        ks.zrem(&ready, &member);
        let Ok(jid) = member.parse::<Jid>() else {
            continue;
        };
        if !record::exists(ks, jid) {
            continue;
        }
        record::take_lease(ks, queue, jid, worker, lease_until)?;
        record::set_status(ks, jid, JobStatus::Running);
        record::push_history(
            ks,
            ctx,
            jid,
            HistoryEvent::Popped {
                worker: worker.to_string(),
            },
        )?;
        popped.push(record::reread(ks, jid)?);
    }

    Ok(popped)
}

/// Jobs of `queue` still waiting to run: ready, delayed or parked on dependencies.
pub(super) fn size<K: Keyspace + ?Sized>(ks: &mut K, queue: &str) -> usize {
    ks.zcard(&keys::ready(queue)) + ks.zcard(&keys::delayed(queue))
}

fn promote_due<K: Keyspace + ?Sized>(ks: &mut K, ctx: &ScriptContext, queue: &str) -> Result<()> {
    let due = ks.zrange_by_score(&keys::delayed(queue), f64::NEG_INFINITY, ctx.now as f64, None);
    for (member, _) in due {
        let Ok(jid) = member.parse::<Jid>() else {
            ks.zrem(&keys::delayed(queue), &member);
            continue;
        };
        if !record::exists(ks, jid) {
            ks.zrem(&keys::delayed(queue), &member);
            continue;
        }
        let priority = record::options(ks, jid)?.priority;
        record::make_ready(ks, ctx, queue, jid, priority)?;
    }
    Ok(())
}
