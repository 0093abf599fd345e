//! Dependency gating.
//!
//! A job B depending on A is parked in the delayed set with an infinite score
//! while `bee:s:waiting:<B>` is non-empty. Every terminal event of A removes A
//! from that set; removal is idempotent, so repeated delivery of the same
//! event never releases B twice.

use super::{ScriptContext, keys, record};
use crate::{
    Result,
    job::{Jid, JobStatus},
    store::Keyspace,
};
use tracing::trace;

/// Link `jid` to its dependencies and return those not yet terminal.
///
/// Dependencies that are terminal, expired or already deleted count as
/// resolved.
pub(super) fn register<K: Keyspace + ?Sized>(
    ks: &mut K,
    jid: Jid,
    dependencies: &[Jid],
) -> Result<Vec<Jid>> {
    let mut unresolved = Vec::new();
    for &dependency in dependencies {
        if dependency == jid {
            continue;
        }
        let pending = record::status(ks, dependency)?.is_some_and(|status| status.is_pending());
        if pending && ks.sadd(&keys::waiting(jid), &dependency.to_string()) {
            ks.sadd(&keys::dependants(dependency), &jid.to_string());
            unresolved.push(dependency);
        }
    }
    Ok(unresolved)
}

/// Record that `jid` reached a terminal state, releasing dependants with
/// nothing left to wait on.
pub(super) fn resolve<K: Keyspace + ?Sized>(ks: &mut K, ctx: &ScriptContext, jid: Jid) -> Result<()> {
    let member = jid.to_string();
    for raw in ks.smembers(&keys::dependants(jid)) {
        let Ok(dependant) = raw.parse::<Jid>() else {
            continue;
        };
        let waiting = keys::waiting(dependant);
        ks.srem(&waiting, &member);
        if ks.scard(&waiting) == 0 {
            release(ks, ctx, dependant)?;
        }
    }
    ks.del(&keys::dependants(jid));
    Ok(())
}

/// Move a job whose dependencies are all resolved out of the waiting state.
fn release<K: Keyspace + ?Sized>(ks: &mut K, ctx: &ScriptContext, jid: Jid) -> Result<()> {
    if record::status(ks, jid)? != Some(JobStatus::Delayed) {
        return Ok(());
    }
    let Some(queue) = record::queue(ks, jid) else {
        return Ok(());
    };
    let parked = ks
        .zscore(&keys::delayed(&queue), &jid.to_string())
        .is_some_and(f64::is_infinite);
    if !parked {
        return Ok(());
    }

    let options = record::options(ks, jid)?;
    let ready_at = record::submitted_at(ks, jid)?.saturating_add(options.delay as i64);
    trace!("Dependencies of job {} resolved", jid);
    if ready_at <= ctx.now {
        record::make_ready(ks, ctx, &queue, jid, options.priority)
    } else {
        record::make_delayed(ks, ctx, &queue, jid, ready_at)
    }
}

/// Dependants of `jid` still waiting on it.
pub(super) fn waiting_on<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid) -> Vec<Jid> {
    let member = jid.to_string();
    ks.smembers(&keys::dependants(jid))
        .into_iter()
        .filter_map(|raw| raw.parse::<Jid>().ok())
        .filter(|dependant| ks.sismember(&keys::waiting(*dependant), &member))
        .collect()
}

/// Unlink `jid` from everything it waits on.
pub(super) fn detach<K: Keyspace + ?Sized>(ks: &mut K, jid: Jid) {
    let member = jid.to_string();
    for dependency in ks.smembers(&keys::waiting(jid)) {
        if let Ok(dependency) = dependency.parse::<Jid>() {
            ks.srem(&keys::dependants(dependency), &member);
        }
    }
    ks.del(&keys::waiting(jid));
}
