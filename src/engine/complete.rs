//! Committing outcomes: `done`, `failed` and the terminal tail they share
//! with dedup mirroring and lease recovery.

use super::{ScriptContext, Transition, deps, keys, record};
use crate::{
    Result,
    events::QueueEvent,
    job::{HistoryEvent, Jid, JobOptions, JobRecord, JobStatus},
    retry::{Exception, retry_delay_ms},
    store::Keyspace,
};
use serde_json::Value;
use tracing::debug;

enum Lease {
    Held,
    Canceled,
    Stale,
    NotFound,
}

fn check_lease<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
    jid: Jid,
    worker: &str,
    token: u64,
) -> Result<Lease> {
    Ok(match record::status(ks, jid)? {
        None => Lease::NotFound,
        Some(JobStatus::Canceled) => {
            record::release_lease(ks, queue, jid);
            Lease::Canceled
        }
        Some(JobStatus::Running) if record::holds_lease(ks, ctx, queue, jid, worker, token)? => {
            Lease::Held
        }
        Some(_) => Lease::Stale,
    })
}

/// Short-circuit for every lease state but `Held`.
fn settle_early(lease: Lease, jid: Jid, worker: &str) -> Option<Transition> {
    match lease {
        Lease::Held => None,
        Lease::Canceled => Some(Transition::Canceled),
        Lease::NotFound => Some(Transition::NotFound),
        Lease::Stale => {
            debug!("Rejecting stale commit of job {} by {}", jid, worker);
            Some(Transition::Stale)
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub(super) fn done<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
    jid: Jid,
    worker: &str,
    token: u64,
    result: Value,
    options: JobOptions,
) -> Result<Transition> {
    let lease = check_lease(ks, ctx, queue, jid, worker, token)?;
    if let Some(transition) = settle_early(lease, jid, worker) {
        return Ok(transition);
    }

    record::release_lease(ks, queue, jid);
    record::set_options(ks, jid, &options)?;
    record::set_result(ks, jid, &result)?;
    record::set_status(ks, jid, JobStatus::Completed);
    record::push_history(ks, ctx, jid, HistoryEvent::Completed)?;

    finish(ks, ctx, queue, jid, &options).map(|r| Transition::Committed(Box::new(r)))
}

#[allow(clippy::too_many_arguments)]
pub(super) fn failed<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
    jid: Jid,
    worker: &str,
    token: u64,
    exception: Exception,
    options: JobOptions,
) -> Result<Transition> {
    let lease = check_lease(ks, ctx, queue, jid, worker, token)?;
    if let Some(transition) = settle_early(lease, jid, worker) {
        return Ok(transition);
    }

    record::release_lease(ks, queue, jid);
    record::set_options(ks, jid, &options)?;
    record::push_history(
        ks,
        ctx,
        jid,
        HistoryEvent::Exception {
            message: exception.message.clone(),
        },
    )?;

    let retries = record::retries(ks, jid)?;
    if exception.retry && retries < options.retries {
        let attempt = retries + 1;
        record::set_retries(ks, jid, attempt);
        let delay = retry_delay_ms(exception.retry_delay, exception.progressive_delay, attempt);
        let till = ctx.now.saturating_add(delay as i64);
        record::make_delayed(ks, ctx, queue, jid, till)?;
        return Ok(Transition::Retrying { till });
    }

    let reason = if exception.retry {
        "No more retries".to_string()
    } else {
        exception.message
    };
    fail(ks, ctx, queue, jid, &options, &reason).map(|r| Transition::Committed(Box::new(r)))
}

/// Mark a job failed for good.
pub(super) fn fail<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
    jid: Jid,
    options: &JobOptions,
    reason: &str,
) -> Result<JobRecord> {
    record::set_failed_reason(ks, jid, reason);
    record::set_status(ks, jid, JobStatus::Failed);
    record::push_history(
        ks,
        ctx,
        jid,
        HistoryEvent::Failed {
            message: reason.to_string(),
        },
    )?;
    finish(ks, ctx, queue, jid, options)
}

/// Tail of every completed or failed transition: start the TTL, release
/// dependants, announce the outcome and settle duplicates.
pub(super) fn finish<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
    jid: Jid,
    options: &JobOptions,
) -> Result<JobRecord> {
    let ttl = options.ttl as i64;
    record::schedule_expiry(
        ks,
        queue,
        jid,
        ctx.now.saturating_add(ttl),
        ctx.now.saturating_add(ttl.saturating_mul(2)),
    );
    deps::resolve(ks, ctx, jid)?;

    let job = record::reread(ks, jid)?;
    let event = match job.status {
        JobStatus::Completed => QueueEvent::Completed {
            queue: queue.to_string(),
            jid,
            job: Box::new(job.clone()),
        },
        _ => QueueEvent::Failed {
            queue: queue.to_string(),
            jid,
            job: Box::new(job.clone()),
        },
    };
    record::publish(ks, &event)?;

    for raw in ks.smembers(&keys::duplicates(jid)) {
        if let Ok(duplicate) = raw.parse::<Jid>() {
            mirror(ks, ctx, duplicate, jid)?;
        }
    }
    Ok(job)
}

/// Settle `duplicate` with the terminal outcome of `original`.
pub(super) fn mirror<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    duplicate: Jid,
    original: Jid,
) -> Result<()> {
    let settled = record::status(ks, duplicate)?
        .is_none_or(|status| status.is_terminal() || status == JobStatus::Expired);
    if settled {
        return Ok(());
    }
    let Some(queue) = record::queue(ks, duplicate) else {
        return Ok(());
    };

    record::copy_outcome(ks, original, duplicate);
    let copied = record::reread(ks, duplicate)?;
    let event = match copied.status {
        JobStatus::Completed => HistoryEvent::Completed,
        _ => HistoryEvent::Failed {
            message: copied.failed_reason.unwrap_or_default(),
        },
    };
    record::push_history(ks, ctx, duplicate, event)?;

    finish(ks, ctx, &queue, duplicate, &copied.options).map(|_| ())
}
