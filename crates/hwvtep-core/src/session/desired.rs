// ── Desired-configuration push ──
//
// Plans the device writes that bring one entity in line with its desired
// configuration. Plans are recomputed from the current cache and config
// every time, so a deferred job that runs late still does the right thing.

use tracing::{debug, warn};

use super::ConnectionSession;
use crate::cache::DeviceCache;
use crate::error::CoreError;
use crate::model::{DesiredEntity, EntityKind, ModelKey, RowOp, TransactCommand};
use crate::queue::{Dependency, Job, WaitQueue};

/// Kinds whose device rows are deleted on first sync when the controller
/// has no desired configuration for them.
const STALE_CANDIDATES: &[EntityKind] = &[EntityKind::RemoteUcastMac];

#[derive(Debug, PartialEq)]
pub(super) enum PushPlan {
    Ready(TransactCommand),
    Blocked(Vec<Dependency>),
    Nothing,
}

/// Create or update `key`. Shared resources it references are created in
/// the same transaction when the device lacks them and reused when
/// confirmed; anything in transit or unconfirmed is waited on.
pub(super) fn plan_upsert(
    cache: &DeviceCache,
    kind: EntityKind,
    key: &ModelKey,
    entity: &DesiredEntity,
) -> PushPlan {
    // An insert of this row is already on its way.
    if cache
        .get(kind, key)
        .is_some_and(|r| r.is_in_transit() && r.device_id().is_none())
    {
        return PushPlan::Blocked(vec![Dependency::settled(kind, key.clone())]);
    }

    let mut ops = Vec::new();
    let mut waiting = Vec::new();
    for reference in &entity.references {
        if cache.is_available(reference.kind, &reference.key) {
            continue;
        }
        let in_transit = cache.is_in_transit(reference.kind, &reference.key);
        let created = (!in_transit)
            .then(|| DesiredEntity::shared_resource(reference.kind, &reference.key))
            .flatten();

        match created {
            Some(resource) => ops.push(RowOp::upsert(
                reference.kind,
                reference.key.clone(),
                resource.payload,
                resource.references,
            )),
            None if in_transit && reference.kind.is_shared_resource() => {
                waiting.push(Dependency::settled(reference.kind, reference.key.clone()));
            }
            None => waiting.push(Dependency::available(reference.kind, reference.key.clone())),
        }
    }

    if !waiting.is_empty() {
        return PushPlan::Blocked(waiting);
    }
    ops.push(RowOp::upsert(
        kind,
        key.clone(),
        entity.payload.clone(),
        entity.references.clone(),
    ));
    PushPlan::Ready(TransactCommand::new(ops))
}

/// Delete `key` from the device if it is there.
pub(super) fn plan_removal(cache: &DeviceCache, kind: EntityKind, key: &ModelKey) -> PushPlan {
    match cache.get(kind, key) {
        Some(row) if row.device_id().is_some() => {
            PushPlan::Ready(TransactCommand::single(RowOp::delete(kind, key.clone())))
        }
        Some(row) if row.is_in_transit() => {
            PushPlan::Blocked(vec![Dependency::settled(kind, key.clone())])
        }
        _ => PushPlan::Nothing,
    }
}

/// Bring one entity in line with its desired configuration: upsert when
/// configured, delete otherwise. Blocked plans become config-queue jobs
/// that re-run this on release.
pub(super) fn reconcile_entity(
    session: &ConnectionSession,
    kind: EntityKind,
    key: ModelKey,
) -> Result<(), CoreError> {
    let cache = session.cache();
    let plan = match cache.config(kind, &key) {
        Some(entity) => plan_upsert(cache, kind, &key, &entity),
        None => plan_removal(cache, kind, &key),
    };

    match plan {
        PushPlan::Nothing => Ok(()),
        PushPlan::Ready(cmd) => {
            // Reserve every row the command touches so a racing plan
            // waits instead of inserting a duplicate.
            for op in &cmd.ops {
                cache.mark_in_transit(op.kind, &op.key);
            }
            session.transact(cmd)
        }
        PushPlan::Blocked(dependencies) => {
            let label = format!("{kind} {key}");
            let deferred = session.clone();
            session.queue().add_job(Job::new(
                label,
                WaitQueue::Config,
                dependencies,
                move || async move {
                    if let Err(e) = reconcile_entity(&deferred, kind, key.clone()) {
                        warn!(%kind, %key, error = %e, "deferred push failed");
                    }
                },
            ))?;
            Ok(())
        }
    }
}

/// First-sync pass: push desired entities the device lacks, in
/// dependency order, then delete stale controller-written rows.
pub(super) fn reconcile_all(session: &ConnectionSession) {
    let cache = session.cache();
    let mut pushed = 0usize;
    for (kind, key, _) in cache.config_entries() {
        if cache.is_available(kind, &key) || cache.is_in_transit(kind, &key) {
            continue;
        }
        pushed += 1;
        if let Err(e) = reconcile_entity(session, kind, key.clone()) {
            warn!(%kind, %key, error = %e, "desired push failed");
        }
    }

    let mut stale = 0usize;
    for kind in STALE_CANDIDATES {
        for row in cache.rows(*kind) {
            if !row.is_available() || cache.has_config(*kind, row.key()) {
                continue;
            }
            stale += 1;
            if let Err(e) = reconcile_entity(session, *kind, row.key().clone()) {
                warn!(kind = %kind, key = %row.key(), error = %e, "stale row delete failed");
            }
        }
    }
    debug!(node = %session.node(), pushed, stale, "first-sync reconciliation queued");
}
