use super::{Dedup, ScriptContext, complete, keys, record};
use crate::{
    Result,
    events::QueueEvent,
    job::{HistoryEvent, Jid, JobHash, JobStatus},
    store::Keyspace,
};
use tracing::debug;

/// Claim the fingerprint of `hash` within `queue` for `jid`.
///
/// When another live job already owns it, `jid` becomes its duplicate: the
/// lease is released, the link recorded, and the job settles with the
/// original's outcome now (original already terminal) or when the original
/// finishes.
pub(super) fn hash<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
    jid: Jid,
    hash: &JobHash,
    worker: &str,
    token: u64,
) -> Result<Dedup> {
    match record::status(ks, jid)? {
        Some(JobStatus::Running) if record::holds_lease(ks, ctx, queue, jid, worker, token)? => {}
        Some(JobStatus::Canceled) => {
            // the worker stops here, so nothing would ever report back
            record::release_lease(ks, queue, jid);
            return Ok(Dedup::Skipped);
        }
        _ => return Ok(Dedup::Skipped),
    }

    if record::hash(ks, jid)?.is_none() {
        record::set_hash(ks, jid, hash)?;
    }

    let key = keys::hash(queue, &hash.fingerprint());
    let owner = ks
        .get(&key)
        .and_then(|raw| raw.parse::<Jid>().ok())
        .filter(|owner| *owner != jid);

    if let Some(original) = owner {
        let live = record::status(ks, original)?
            .is_some_and(|status| status != JobStatus::Canceled && status != JobStatus::Expired);
        if live {
            become_duplicate(ks, ctx, queue, jid, original)?;
            return Ok(Dedup::Duplicate { original });
        }
    }

    ks.set(&key, jid.to_string());
    Ok(Dedup::Owner)
}

fn become_duplicate<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
    jid: Jid,
    original: Jid,
) -> Result<()> {
    debug!("Job {} duplicates {}", jid, original);

    record::release_lease(ks, queue, jid);
    record::set_duplicate_of(ks, jid, original);
    ks.sadd(&keys::duplicates(original), &jid.to_string());
    record::push_history(
        ks,
        ctx,
        jid,
        HistoryEvent::Duplicate {
            duplicate_jid: original,
        },
    )?;

    let job = record::reread(ks, jid)?;
    record::publish(
        ks,
        &QueueEvent::Duplicate {
            queue: queue.to_string(),
            jid,
            original,
            job: Box::new(job),
        },
    )?;

    let original_status = record::status(ks, original)?;
    if original_status.is_some_and(|status| status.is_terminal()) {
        complete::mirror(ks, ctx, jid, original)?;
    }
    Ok(())
}
