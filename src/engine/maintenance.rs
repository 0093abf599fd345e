//! Background duties of bees: heartbeats and expiry sweeps.

use super::{ScriptContext, SweepReport, complete, deps, keys, record};
use crate::{
    Result,
    job::{HistoryEvent, Jid, JobStatus},
    store::Keyspace,
};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Refresh the liveness key of `worker` and extend every lease it holds.
pub(super) fn heartbeat<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
    worker: &str,
    lease_ms: u64,
    ttl_ms: u64,
) -> usize {
    let beat = keys::heartbeat(worker);
    ks.set(&beat, ctx.now.to_string());
    ks.pexpire_at(&beat, ctx.now.saturating_add(ttl_ms as i64));

    let locks = keys::locks(queue);
    let until = ctx.now.saturating_add(lease_ms as i64) as f64;
    let mut refreshed = 0;
    for member in ks.smembers(&keys::worker(worker)) {
        if ks.zscore(&locks, &member).is_some() {
            ks.zadd(&locks, until, &member);
            refreshed += 1;
        }
    }
    refreshed
}

/// Recover lapsed leases and walk terminal jobs through their expiry steps.
pub(super) fn expired<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    recover_leases(ks, ctx, queue, &mut report)?;
    expire_records(ks, ctx, queue, &mut report)?;
    Ok(report)
}

/// A lapsed lease means the worker died: the attempt counts against the
/// job's retries and the job goes straight back to the ready set.
fn recover_leases<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
    report: &mut SweepReport,
) -> Result<()> {
    let locks = keys::locks(queue);
    // strictly before now: a lease is still valid at its expiry instant
    let lapsed = ks.zrange_by_score(&locks, f64::NEG_INFINITY, (ctx.now - 1) as f64, None);

    for (member, _) in lapsed {
        let Ok(jid) = member.parse::<Jid>() else {
            ks.zrem(&locks, &member);
            continue;
        };
        let worker = record::worker(ks, jid).unwrap_or_default();
        record::release_lease(ks, queue, jid);

        if record::status(ks, jid)? != Some(JobStatus::Running) {
            continue;
        }

        warn!("Lease on job {} expired for worker {}", jid, worker);
        record::push_history(
            ks,
            ctx,
            jid,
            HistoryEvent::Exception {
                message: format!("Lease expired for worker {}", worker),
            },
        )?;

        let options = record::options(ks, jid)?;
        let retries = record::retries(ks, jid)?;
        if retries < options.retries {
            record::set_retries(ks, jid, retries + 1);
            record::make_ready(ks, ctx, queue, jid, options.priority)?;
            report.requeued.push(jid);
        } else {
            complete::fail(ks, ctx, queue, jid, &options, "No more retries")?;
            report.failed.push(jid);
        }
    }
    Ok(())
}

/// First TTL lapse: the job turns `expired`, gives up its fingerprint and
/// leaves the tag index. Second lapse (or the grace period of a canceled
/// job): the record is deleted.
fn expire_records<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    queue: &str,
    report: &mut SweepReport,
) -> Result<()> {
    let expires = keys::expires(queue);
    let due = ks.zrange_by_score(&expires, f64::NEG_INFINITY, ctx.now as f64, None);

    for (member, _) in due {
        ks.zrem(&expires, &member);
        let Ok(jid) = member.parse::<Jid>() else {
            continue;
        };

        match record::status(ks, jid)? {
            Some(JobStatus::Completed | JobStatus::Failed) => {
                debug!("Job {} expired", jid);
                record::set_status(ks, jid, JobStatus::Expired);
                record::release_fingerprint(ks, queue, jid)?;
                drop_from_tag_index(ks, jid)?;
                deps::resolve(ks, ctx, jid)?;

                let ttl = record::options(ks, jid)?.ttl as i64;
                let until = ctx.now.saturating_add(ttl);
                record::schedule_expiry(ks, queue, jid, until, until.saturating_add(ttl));
                report.expired.push(jid);
            }
            Some(JobStatus::Canceled | JobStatus::Expired) => {
                debug!("Deleting job {}", jid);
                drop_from_tag_index(ks, jid)?;
                record::delete(ks, queue, jid);
                report.deleted.push(jid);
            }
            // gone already, or back in flight
            _ => {}
        }
    }
    Ok(())
}

/// Remove `jid` from every tag it was ever indexed under.
fn drop_from_tag_index<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid) -> Result<()> {
    let Some(job) = record::read(ks, jid)? else {
        return Ok(());
    };
    let mut tags: HashSet<String> = job.tags.into_iter().collect();
    for entry in job.history {
        if let HistoryEvent::Tagged { tags: applied } = entry.event {
            tags.extend(applied);
        }
    }

    let member = jid.to_string();
    for tag in tags {
        ks.srem(&keys::tag(&tag), &member);
    }
    Ok(())
}
