use super::{NewJob, ScriptContext, deps, keys, record};
use crate::{
    Result,
    job::{HistoryEvent, JobRecord, JobStatus},
    store::Keyspace,
};
use tracing::debug;

/// Record a new job and route it to the ready set, the delayed set, or the
/// dependency-waiting state.
///
/// Returns `None` without writing anything when the job's parent has been
/// canceled.
pub(super) fn put<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    job: NewJob,
) -> Result<Option<JobRecord>> {
    let jid = job.jid;
    let member = jid.to_string();

    if let Some(parent) = job.parent {
        if record::status(ks, parent)? == Some(JobStatus::Canceled) {
            debug!("Refusing job {}: parent {} was canceled", jid, parent);
            return Ok(None);
        }
        ks.sadd(&keys::children(parent), &member);
    }

    record::create(ks, ctx, &job)?;
    record::push_history(ks, ctx, jid, HistoryEvent::Submitted)?;
    for tag in &job.tags {
        ks.sadd(&keys::tag(tag), &member);
    }

    let unresolved = deps::register(ks, jid, &job.options.dependencies)?;
    if !unresolved.is_empty() {
        ks.zadd(&keys::delayed(&job.queue), f64::INFINITY, &member);
        record::set_status(ks, jid, JobStatus::Delayed);
        record::push_history(
            ks,
            ctx,
            jid,
            HistoryEvent::DependancyWaiting {
                dependencies: unresolved,
            },
        )?;
    } else if job.options.delay > 0 {
        let till = ctx.now.saturating_add(job.options.delay as i64);
        record::make_delayed(ks, ctx, &job.queue, jid, till)?;
    } else {
        record::make_ready(ks, ctx, &job.queue, jid, job.options.priority)?;
    }

    record::reread(ks, jid).map(Some)
}
