use super::{ScriptContext, keys, record};
use crate::{
    Result,
    job::{HistoryEvent, Jid},
    store::Keyspace,
};

/// Replace the visible tags of `jid`.
///
/// The tag index only grows: the job stays findable under tags it no longer
/// shows, and the `tagged` history entry keeps the provenance.
pub(super) fn set_tags<K: Keyspace + ?Sized>(
    ks: &mut K,
    ctx: &ScriptContext,
    jid: Jid,
    tags: Vec<String>,
) -> Result<bool> {
    if !record::exists(ks, jid) {
        return Ok(false);
    }

    let member = jid.to_string();
    for tag in &tags {
        ks.sadd(&keys::tag(tag), &member);
    }
    record::set_tags(ks, jid, &tags)?;
    record::push_history(ks, ctx, jid, HistoryEvent::Tagged { tags })?;
    Ok(true)
}
