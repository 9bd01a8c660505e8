// ── Device-originated updates ──
//
// Folds monitor pushes into the cache, in device order. Deletes run first,
// referencing kinds before referenced ones, so a resource is never cleared
// while something still holds it; inserts and updates then run in
// dependency order so a MAC's logical switch is known before the MAC.
// A row parked on a missing dependency is superseded by anything the
// device says later about the same uuid.

use hwvtep_api::wire::{set_members, string_column, uuid_ref};
use hwvtep_api::{Row, RowUpdate, StoreTransaction, TableUpdate, TableUpdates};
use strum::IntoEnumIterator;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use super::history::{HistoryAction, HistoryEntry};
use super::writer;
use super::{ConnectionSession, Deferred, Inbound};
use crate::cache::{DeviceCache, EntityRef};
use crate::model::{DeviceId, EntityKind, ModelKey, RowStatus};
use crate::queue::{Dependency, Job, WaitQueue};

/// Model key of a device row, or the dependency that must resolve first.
pub(super) fn derive_key(
    cache: &DeviceCache,
    kind: EntityKind,
    id: &DeviceId,
    row: &Row,
) -> Result<ModelKey, Dependency> {
    let natural = kind
        .key_column()
        .and_then(|column| string_column(row, column));
    let Some(natural) = natural else {
        return Ok(ModelKey::new(id.to_string()));
    };
    if !kind.is_mac() {
        return Ok(ModelKey::from(natural));
    }

    let Some(switch) = row.get("logical_switch").and_then(uuid_ref) else {
        return Ok(ModelKey::from(natural));
    };
    let switch = DeviceId::from(switch);
    match cache.model_key(EntityKind::LogicalSwitch, &switch) {
        Some(ls) => Ok(ModelKey::qualified(&ls, natural)),
        None => Err(Dependency::available_id(EntityKind::LogicalSwitch, switch)),
    }
}

/// Shared resources a device row references, as far as the cache knows
/// them.
fn shared_refs(cache: &DeviceCache, kind: EntityKind, row: &Row) -> Vec<EntityRef> {
    let mut out = Vec::new();
    for (column, target) in kind.shared_references() {
        let Some(value) = row.get(*column) else {
            continue;
        };
        for member in set_members(value) {
            let Some(id) = uuid_ref(member) else { continue };
            if let Some(key) = cache.model_key(*target, &DeviceId::from(id)) {
                out.push(EntityRef::new(*target, key));
            }
        }
    }
    out
}

/// Apply one batch. When this instance owns the device the batch is
/// mirrored to the operational store in a single transaction. After a
/// failed write that transaction first rewrites the node from the cache.
pub(super) async fn apply_updates(session: &ConnectionSession, updates: &TableUpdates) {
    let inner = &session.inner;
    let mut tx = session.is_owner().then(|| inner.store.begin());
    if let Some(tx) = tx.as_deref_mut() {
        if inner.store_dirty.swap(false, Ordering::SeqCst) {
            resync_store(session, tx);
        }
    }

    let tables: Vec<(EntityKind, &TableUpdate)> = EntityKind::iter()
        .filter_map(|kind| updates.table(kind.table()).map(|t| (kind, t)))
        .collect();

    for (kind, table) in tables.iter().rev() {
        for (uuid, update) in &table.rows {
            if update.is_delete() {
                remove_row(session, tx.as_deref_mut(), *kind, &DeviceId::from(uuid.as_str()));
            }
        }
    }
    for (kind, table) in &tables {
        for (uuid, update) in &table.rows {
            if let Some(row) = &update.new {
                upsert_row(session, tx.as_deref_mut(), *kind, uuid, update, row);
            }
        }
    }

    if let Some(tx) = tx {
        if tx.is_empty() {
            tx.cancel();
        } else if let Err(e) = tx.commit().await {
            warn!(node = %inner.node, error = %e, "operational write failed, resync pending");
            inner.store_dirty.store(true, Ordering::SeqCst);
        }
    }

    inner.queue.on_config_data_available();
    inner.queue.on_oper_data_available();
}

fn remove_row(
    session: &ConnectionSession,
    tx: Option<&mut (dyn StoreTransaction + 'static)>,
    kind: EntityKind,
    id: &DeviceId,
) {
    let inner = &session.inner;
    if forget_deferred(session, kind, id) {
        debug!(node = %inner.node, %kind, %id, "parked row deleted by device");
    }
    let Some(row) = inner.cache.clear_by_id(kind, id) else {
        debug!(node = %inner.node, %kind, %id, "delete of uncached row ignored");
        return;
    };
    let key = row.key().clone();
    inner.cache.release_refs(&EntityRef::new(kind, key.clone()));
    if let Some(tx) = tx {
        writer::delete_row(tx, &inner.node, kind, &key);
    }
    inner.device_history.record(HistoryEntry::new(
        kind,
        key,
        Some(id.clone()),
        HistoryAction::Delete,
    ));
}

fn upsert_row(
    session: &ConnectionSession,
    tx: Option<&mut (dyn StoreTransaction + 'static)>,
    kind: EntityKind,
    uuid: &str,
    update: &RowUpdate,
    row: &Row,
) {
    let inner = &session.inner;
    let id = DeviceId::from(uuid);
    forget_deferred(session, kind, &id);

    let key = match derive_key(&inner.cache, kind, &id, row) {
        Ok(key) => key,
        Err(dependency) => {
            defer_row(session, kind, uuid, update, dependency);
            return;
        }
    };

    let known = inner.cache.get_by_id(kind, &id).is_some();
    inner
        .cache
        .mark_available(kind, key.clone(), id.clone(), row.clone());
    let shared = shared_refs(&inner.cache, kind, row);
    inner
        .cache
        .set_refs(&EntityRef::new(kind, key.clone()), &shared);

    if let Some(tx) = tx {
        writer::put_row(tx, &inner.node, kind, &key, &id, row);
    }
    let action = if known {
        HistoryAction::Update
    } else {
        HistoryAction::Insert
    };
    inner
        .device_history
        .record(HistoryEntry::new(kind, key, Some(id), action));
}

/// Rewrite the node's whole subtree from what the cache holds now.
fn resync_store(session: &ConnectionSession, tx: &mut dyn StoreTransaction) {
    let inner = &session.inner;
    tx.delete(inner.node.store_path());
    writer::write_node(tx, &inner.node, &inner.info, &inner.schema);
    let mut rows = 0;
    for (kind, row) in inner.cache.entries() {
        if row.status() != RowStatus::Available {
            continue;
        }
        if let (Some(id), Some(payload)) = (row.device_id(), row.payload()) {
            writer::put_row(tx, &inner.node, kind, row.key(), id, payload);
            rows += 1;
        }
    }
    info!(node = %inner.node, rows, "operational store resynced from cache");
}

/// Drop the parked copy of a row, if any. Returns whether one existed.
fn forget_deferred(session: &ConnectionSession, kind: EntityKind, id: &DeviceId) -> bool {
    let inner = &session.inner;
    let Some(parked) = inner.deferred.lock().remove(&(kind, id.clone())) else {
        return false;
    };
    inner.queue.cancel_job(parked.job);
    true
}

/// A replay may run only while it is still the row's latest parked copy.
pub(super) fn claim_deferred(
    session: &ConnectionSession,
    kind: EntityKind,
    id: &DeviceId,
    generation: u64,
) -> bool {
    let mut deferred = session.inner.deferred.lock();
    let key = (kind, id.clone());
    match deferred.get(&key) {
        Some(parked) if parked.generation == generation => {
            deferred.remove(&key);
            true
        }
        _ => false,
    }
}

/// Park a row whose key depends on a row not seen yet. On release it is
/// fed back through the inbound channel, keeping device order.
fn defer_row(
    session: &ConnectionSession,
    kind: EntityKind,
    uuid: &str,
    update: &RowUpdate,
    dependency: Dependency,
) {
    let inner = &session.inner;
    let mut table = TableUpdate::default();
    table.rows.insert(uuid.to_owned(), update.clone());
    let mut retry = TableUpdates::default();
    retry.tables.insert(kind.table().to_owned(), table);

    let id = DeviceId::from(uuid);
    let generation = inner.defer_seq.fetch_add(1, Ordering::SeqCst);
    let inbound = inner.inbound_tx.clone();
    let replay_id = id.clone();
    let job = Job::new(
        format!("{kind} uuid {uuid}"),
        WaitQueue::Oper,
        vec![dependency],
        move || async move {
            let _ = inbound.send(Inbound::Replay {
                kind,
                id: replay_id,
                generation,
                updates: retry,
            });
        },
    );
    // Replays are applied by the inbound task, which is running this
    // batch, so the entry lands before any replay can be claimed.
    match inner.queue.add_job(job) {
        Ok(job) => {
            inner
                .deferred
                .lock()
                .insert((kind, id), Deferred { job, generation });
        }
        Err(e) => warn!(node = %inner.node, %kind, uuid, error = %e, "device row dropped"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn natural_keys() {
        let cache = DeviceCache::new(Duration::from_secs(30));
        let id = DeviceId::from("U1");

        let key = derive_key(&cache, EntityKind::LogicalSwitch, &id, &row(json!({"name": "LS1"})));
        assert_eq!(key.unwrap().as_str(), "LS1");

        let key = derive_key(
            &cache,
            EntityKind::PhysicalLocator,
            &id,
            &row(json!({"dst_ip": "10.0.0.9"})),
        );
        assert_eq!(key.unwrap().as_str(), "10.0.0.9");

        let key = derive_key(&cache, EntityKind::Tunnel, &id, &row(json!({})));
        assert_eq!(key.unwrap().as_str(), "U1");
    }

    #[test]
    fn mac_key_is_qualified_by_its_switch() {
        let cache = DeviceCache::new(Duration::from_secs(30));
        let mac = row(json!({
            "MAC": "00:11:22:33:44:55",
            "logical_switch": ["uuid", "U1"],
        }));

        let pending = derive_key(&cache, EntityKind::RemoteUcastMac, &"M1".into(), &mac);
        assert_eq!(
            pending.unwrap_err(),
            Dependency::available_id(EntityKind::LogicalSwitch, "U1".into())
        );

        cache.mark_available(EntityKind::LogicalSwitch, "LS1".into(), "U1".into(), Row::new());
        let key = derive_key(&cache, EntityKind::RemoteUcastMac, &"M1".into(), &mac).unwrap();
        assert_eq!(key.as_str(), "LS1/00:11:22:33:44:55");
    }

    #[test]
    fn shared_refs_follow_locator_column() {
        let cache = DeviceCache::new(Duration::from_secs(30));
        cache.mark_available(
            EntityKind::PhysicalLocator,
            "10.0.0.9".into(),
            "L1".into(),
            Row::new(),
        );
        let mac = row(json!({ "locator": ["uuid", "L1"] }));
        assert_eq!(
            shared_refs(&cache, EntityKind::RemoteUcastMac, &mac),
            vec![EntityRef::new(EntityKind::PhysicalLocator, "10.0.0.9".into())]
        );
        assert!(shared_refs(&cache, EntityKind::LogicalSwitch, &mac).is_empty());
    }
}
