// ── Per-device observed-state cache ──
//
// Rows as the engine last saw them on one device, indexed by model key and
// by device id, plus the desired configuration for that device and the
// shared-resource reference counts.

mod refcount;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::model::{ConfigKey, DesiredEntity, DeviceId, DeviceRow, EntityKind, ModelKey};

pub use refcount::{EntityRef, RefCountTable, RefRelease};

/// Observed and desired state of one device.
///
/// Lookups are lock-free. Mutations that touch both row indices run under
/// a per-device write lock, so a row with a device id is always reachable,
/// and identical, through both its model key and its device id.
pub struct DeviceCache {
    /// Primary storage: (kind, model key) -> row.
    rows: DashMap<(EntityKind, ModelKey), Arc<DeviceRow>>,

    /// Secondary index: (kind, device id) -> model key.
    ids: DashMap<(EntityKind, DeviceId), ModelKey>,

    /// Desired configuration: (kind, config key) -> entity.
    config: DashMap<(EntityKind, ConfigKey), Arc<DesiredEntity>>,

    refs: RefCountTable,

    /// Serializes multi-index row mutations.
    write: Mutex<()>,

    in_transit_expiry: Duration,

    /// Bumped on every row mutation.
    version: watch::Sender<u64>,
}

impl DeviceCache {
    pub fn new(in_transit_expiry: Duration) -> Self {
        let (version, _) = watch::channel(0u64);
        Self {
            rows: DashMap::new(),
            ids: DashMap::new(),
            config: DashMap::new(),
            refs: RefCountTable::new(),
            write: Mutex::new(()),
            in_transit_expiry,
            version,
        }
    }

    // ── Row reads ───────────────────────────────────────────────────

    pub fn get(&self, kind: EntityKind, key: &ModelKey) -> Option<Arc<DeviceRow>> {
        self.rows
            .get(&(kind, key.clone()))
            .map(|r| Arc::clone(r.value()))
    }

    pub fn get_by_id(&self, kind: EntityKind, id: &DeviceId) -> Option<Arc<DeviceRow>> {
        let key = self.ids.get(&(kind, id.clone()))?.value().clone();
        self.get(kind, &key)
    }

    pub fn model_key(&self, kind: EntityKind, id: &DeviceId) -> Option<ModelKey> {
        self.ids.get(&(kind, id.clone())).map(|k| k.value().clone())
    }

    pub fn device_id(&self, kind: EntityKind, key: &ModelKey) -> Option<DeviceId> {
        self.get(kind, key)?.device_id().cloned()
    }

    /// The predicate dependent jobs wait on.
    pub fn is_available(&self, kind: EntityKind, key: &ModelKey) -> bool {
        self.get(kind, key).is_some_and(|r| r.is_available())
    }

    pub fn is_available_id(&self, kind: EntityKind, id: &DeviceId) -> bool {
        self.get_by_id(kind, id).is_some_and(|r| r.is_available())
    }

    pub fn is_in_transit(&self, kind: EntityKind, key: &ModelKey) -> bool {
        self.get(kind, key).is_some_and(|r| r.is_in_transit())
    }

    /// All rows of one kind.
    pub fn rows(&self, kind: EntityKind) -> Vec<Arc<DeviceRow>> {
        self.rows
            .iter()
            .filter(|r| r.key().0 == kind)
            .map(|r| Arc::clone(r.value()))
            .collect()
    }

    /// Every row, sorted by kind then key.
    pub fn entries(&self) -> Vec<(EntityKind, Arc<DeviceRow>)> {
        let mut out: Vec<_> = self
            .rows
            .iter()
            .map(|r| (r.key().0, Arc::clone(r.value())))
            .collect();
        out.sort_by(|a, b| (a.0, a.1.key()).cmp(&(b.0, b.1.key())));
        out
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    // ── Row writes ──────────────────────────────────────────────────

    /// Insert or replace a row, keeping the device id index in step.
    pub fn put(&self, kind: EntityKind, row: DeviceRow) {
        let _guard = self.write.lock();
        let key = row.key().clone();

        // Stale id of this model key.
        let old_id = self
            .rows
            .get(&(kind, key.clone()))
            .and_then(|r| r.device_id().cloned());
        if let Some(old_id) = old_id {
            if Some(&old_id) != row.device_id() {
                self.ids.remove(&(kind, old_id));
            }
        }

        if let Some(id) = row.device_id() {
            // The device renamed a row: drop the entry under its old key.
            let previous = self.ids.insert((kind, id.clone()), key.clone());
            if let Some(previous) = previous.filter(|p| *p != key) {
                debug!(%kind, old = %previous, new = %key, "device row re-keyed");
                self.rows.remove(&(kind, previous));
            }
        }

        self.rows.insert((kind, key), Arc::new(row));
        self.bump_version();
    }

    /// Record a device-confirmed row.
    pub fn mark_available(
        &self,
        kind: EntityKind,
        key: ModelKey,
        id: DeviceId,
        payload: hwvtep_api::Row,
    ) {
        self.put(kind, DeviceRow::available(key, id, payload));
    }

    /// Flip a row to in transit, keeping its device id and payload. A row
    /// the cache has never seen becomes an empty reservation.
    pub fn mark_in_transit(&self, kind: EntityKind, key: &ModelKey) {
        let now = Instant::now();
        let _guard = self.write.lock();
        let row = match self.rows.get(&(kind, key.clone())) {
            Some(existing) => (**existing).clone().into_in_transit(now),
            None => DeviceRow::in_transit(key.clone(), now),
        };
        self.rows.insert((kind, key.clone()), Arc::new(row));
        self.bump_version();
    }

    pub fn clear(&self, kind: EntityKind, key: &ModelKey) -> Option<Arc<DeviceRow>> {
        let _guard = self.write.lock();
        self.remove_locked(kind, key)
    }

    /// Clear a row only if it is still in transit past the expiry window
    /// at `now`. A row confirmed since it was last looked at is kept.
    pub fn clear_if_expired(
        &self,
        kind: EntityKind,
        key: &ModelKey,
        now: Instant,
    ) -> Option<Arc<DeviceRow>> {
        let _guard = self.write.lock();
        let expired = self
            .rows
            .get(&(kind, key.clone()))
            .and_then(|r| r.in_transit_age(now))
            .is_some_and(|age| age >= self.in_transit_expiry);
        if !expired {
            return None;
        }
        self.remove_locked(kind, key)
    }

    /// Caller holds `write`.
    fn remove_locked(&self, kind: EntityKind, key: &ModelKey) -> Option<Arc<DeviceRow>> {
        let removed = self.rows.remove(&(kind, key.clone())).map(|(_, row)| row);
        if let Some(id) = removed.as_ref().and_then(|r| r.device_id()) {
            self.ids.remove(&(kind, id.clone()));
        }
        if removed.is_some() {
            self.bump_version();
        }
        removed
    }

    pub fn clear_by_id(&self, kind: EntityKind, id: &DeviceId) -> Option<Arc<DeviceRow>> {
        let key = self.model_key(kind, id)?;
        self.clear(kind, &key)
    }

    /// Purge in-transit rows older than the expiry window. Returns what
    /// was purged.
    pub fn sweep_expired(&self, now: Instant) -> Vec<EntityRef> {
        let candidates: Vec<EntityRef> = self
            .rows
            .iter()
            .filter(|r| {
                r.value()
                    .in_transit_age(now)
                    .is_some_and(|age| age >= self.in_transit_expiry)
            })
            .map(|r| EntityRef::new(r.key().0, r.key().1.clone()))
            .collect();

        // The row may have settled since the scan; re-checked under the lock.
        candidates
            .into_iter()
            .filter(|entry| {
                let purged = self.clear_if_expired(entry.kind, &entry.key, now).is_some();
                if purged {
                    debug!(kind = %entry.kind, key = %entry.key, "in-transit row expired");
                }
                purged
            })
            .collect()
    }

    // ── Desired configuration ───────────────────────────────────────

    pub fn put_config(&self, kind: EntityKind, key: &ModelKey, entity: DesiredEntity) {
        self.config.insert((kind, ConfigKey::from(key)), Arc::new(entity));
    }

    pub fn remove_config(&self, kind: EntityKind, key: &ModelKey) -> Option<Arc<DesiredEntity>> {
        self.config.remove(&(kind, ConfigKey::from(key))).map(|(_, e)| e)
    }

    pub fn config(&self, kind: EntityKind, key: &ModelKey) -> Option<Arc<DesiredEntity>> {
        self.config
            .get(&(kind, ConfigKey::from(key)))
            .map(|e| Arc::clone(e.value()))
    }

    pub fn has_config(&self, kind: EntityKind, key: &ModelKey) -> bool {
        self.config.contains_key(&(kind, ConfigKey::from(key)))
    }

    /// Every desired entity, in dependency order of kind.
    pub fn config_entries(&self) -> Vec<(EntityKind, ModelKey, Arc<DesiredEntity>)> {
        let mut out: Vec<_> = self
            .config
            .iter()
            .map(|e| {
                let (kind, key) = e.key();
                (*kind, key.model_key().clone(), Arc::clone(e.value()))
            })
            .collect();
        out.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        out
    }

    // ── Reference counts ────────────────────────────────────────────

    pub fn inc_ref(&self, resource: &EntityRef, referrer: &EntityRef) -> usize {
        self.refs.inc(resource, referrer)
    }

    /// Drop one reference. When it was the last one the resource is
    /// marked in transit: it is being torn down and must not be reused
    /// until the device confirms its state again.
    pub fn dec_ref(&self, resource: &EntityRef, referrer: &EntityRef) -> RefRelease {
        let release = self.refs.dec(resource, referrer);
        if release == RefRelease::Released {
            debug!(resource = %resource, "last reference released");
            self.mark_in_transit(resource.kind, &resource.key);
        }
        release
    }

    /// Drop every reference `referrer` holds, marking orphaned resources
    /// in transit.
    pub fn release_refs(&self, referrer: &EntityRef) -> Vec<EntityRef> {
        let released = self.refs.release_all(referrer);
        for resource in &released {
            debug!(resource = %resource, "last reference released");
            self.mark_in_transit(resource.kind, &resource.key);
        }
        released
    }

    /// Make `resources` the exact set `referrer` holds. References no
    /// longer held are dropped through [`dec_ref`](Self::dec_ref).
    pub fn set_refs(&self, referrer: &EntityRef, resources: &[EntityRef]) {
        for held in self.refs.resources_of(referrer) {
            if !resources.contains(&held) {
                self.dec_ref(&held, referrer);
            }
        }
        for resource in resources {
            self.inc_ref(resource, referrer);
        }
    }

    pub fn refs(&self) -> &RefCountTable {
        &self.refs
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Subscribe to the row mutation counter.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Drop observed rows and reference counts. Desired config is kept.
    pub fn clear_rows(&self) {
        let _guard = self.write.lock();
        self.rows.clear();
        self.ids.clear();
        self.refs.clear();
        self.bump_version();
    }

    fn bump_version(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::RowStatus;
    use serde_json::json;

    const EXPIRY: Duration = Duration::from_secs(30);

    fn payload(name: &str) -> hwvtep_api::Row {
        let mut row = hwvtep_api::Row::new();
        row.insert("name".into(), json!(name));
        row
    }

    fn ls() -> ModelKey {
        ModelKey::from("LS1")
    }

    #[test]
    fn available_row_is_identical_through_both_indices() {
        let cache = DeviceCache::new(EXPIRY);
        let id = DeviceId::from("U1");
        cache.mark_available(EntityKind::LogicalSwitch, ls(), id.clone(), payload("LS1"));

        let by_key = cache.get(EntityKind::LogicalSwitch, &ls()).unwrap();
        let by_id = cache.get_by_id(EntityKind::LogicalSwitch, &id).unwrap();
        assert_eq!(*by_key, *by_id);
        assert!(cache.is_available(EntityKind::LogicalSwitch, &ls()));
        assert!(cache.is_available_id(EntityKind::LogicalSwitch, &id));
    }

    #[test]
    fn indices_are_scoped_by_kind() {
        let cache = DeviceCache::new(EXPIRY);
        cache.mark_available(EntityKind::LogicalSwitch, ls(), "U1".into(), payload("LS1"));
        assert!(cache.get(EntityKind::PhysicalPort, &ls()).is_none());
        assert!(
            cache
                .get_by_id(EntityKind::PhysicalPort, &"U1".into())
                .is_none()
        );
    }

    #[test]
    fn changed_device_id_drops_stale_mapping() {
        let cache = DeviceCache::new(EXPIRY);
        cache.mark_available(EntityKind::LogicalSwitch, ls(), "U1".into(), payload("LS1"));
        cache.mark_available(EntityKind::LogicalSwitch, ls(), "U2".into(), payload("LS1"));

        assert!(cache.get_by_id(EntityKind::LogicalSwitch, &"U1".into()).is_none());
        assert!(cache.get_by_id(EntityKind::LogicalSwitch, &"U2".into()).is_some());
    }

    #[test]
    fn device_rename_moves_row_to_new_key() {
        let cache = DeviceCache::new(EXPIRY);
        cache.mark_available(EntityKind::LogicalSwitch, ls(), "U1".into(), payload("LS1"));
        cache.mark_available(
            EntityKind::LogicalSwitch,
            "LS9".into(),
            "U1".into(),
            payload("LS9"),
        );

        assert!(cache.get(EntityKind::LogicalSwitch, &ls()).is_none());
        assert_eq!(
            cache.model_key(EntityKind::LogicalSwitch, &"U1".into()),
            Some(ModelKey::from("LS9"))
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_removes_both_indices() {
        let cache = DeviceCache::new(EXPIRY);
        cache.mark_available(EntityKind::LogicalSwitch, ls(), "U1".into(), payload("LS1"));

        let removed = cache.clear_by_id(EntityKind::LogicalSwitch, &"U1".into());
        assert!(removed.is_some());
        assert!(cache.get(EntityKind::LogicalSwitch, &ls()).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mark_in_transit_preserves_identity() {
        let cache = DeviceCache::new(EXPIRY);
        cache.mark_available(EntityKind::LogicalSwitch, ls(), "U1".into(), payload("LS1"));
        cache.mark_in_transit(EntityKind::LogicalSwitch, &ls());

        let row = cache.get(EntityKind::LogicalSwitch, &ls()).unwrap();
        assert_eq!(row.status(), RowStatus::InTransit);
        assert!(row.in_transit_since().is_some());
        assert_eq!(row.device_id(), Some(&DeviceId::from("U1")));
        assert_eq!(row.payload(), Some(&payload("LS1")));
        // Still reachable by id while in transit.
        assert!(cache.get_by_id(EntityKind::LogicalSwitch, &"U1".into()).is_some());
        assert!(!cache.is_available(EntityKind::LogicalSwitch, &ls()));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_respects_expiry_window() {
        let cache = DeviceCache::new(EXPIRY);
        cache.mark_in_transit(EntityKind::LogicalSwitch, &ls());

        tokio::time::advance(EXPIRY - Duration::from_millis(1)).await;
        assert!(cache.sweep_expired(Instant::now()).is_empty());
        assert!(cache.is_in_transit(EntityKind::LogicalSwitch, &ls()));

        tokio::time::advance(Duration::from_millis(1)).await;
        let purged = cache.sweep_expired(Instant::now());
        assert_eq!(purged, vec![EntityRef::new(EntityKind::LogicalSwitch, ls())]);
        assert!(cache.get(EntityKind::LogicalSwitch, &ls()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_ignores_settled_rows() {
        let cache = DeviceCache::new(EXPIRY);
        cache.mark_in_transit(EntityKind::LogicalSwitch, &ls());
        cache.mark_available(EntityKind::LogicalSwitch, ls(), "U1".into(), payload("LS1"));

        tokio::time::advance(EXPIRY * 3).await;
        assert!(cache.sweep_expired(Instant::now()).is_empty());
        assert!(cache.is_available(EntityKind::LogicalSwitch, &ls()));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_clear_spares_row_confirmed_after_scan() {
        let cache = DeviceCache::new(EXPIRY);
        cache.mark_in_transit(EntityKind::LogicalSwitch, &ls());
        tokio::time::advance(EXPIRY).await;
        let now = Instant::now();

        // Confirmed between the sweep's scan and its clear.
        cache.mark_available(EntityKind::LogicalSwitch, ls(), "U1".into(), payload("LS1"));
        assert!(cache.clear_if_expired(EntityKind::LogicalSwitch, &ls(), now).is_none());
        assert!(cache.is_available(EntityKind::LogicalSwitch, &ls()));
        assert_eq!(
            cache.model_key(EntityKind::LogicalSwitch, &"U1".into()),
            Some(ls())
        );

        cache.mark_in_transit(EntityKind::LogicalSwitch, &ls());
        assert!(cache.clear_if_expired(EntityKind::LogicalSwitch, &ls(), Instant::now()).is_none());
        tokio::time::advance(EXPIRY).await;
        assert!(
            cache
                .clear_if_expired(EntityKind::LogicalSwitch, &ls(), Instant::now())
                .is_some()
        );
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn n_references_release_resource_exactly_once() {
        let cache = DeviceCache::new(EXPIRY);
        let locator = EntityRef::new(EntityKind::PhysicalLocator, "10.0.0.9".into());
        cache.mark_available(
            EntityKind::PhysicalLocator,
            locator.key.clone(),
            "L1".into(),
            payload("10.0.0.9"),
        );
        let macs: Vec<_> = (0..5)
            .map(|n| {
                EntityRef::new(
                    EntityKind::RemoteUcastMac,
                    format!("LS1/00:00:00:00:00:0{n}").into(),
                )
            })
            .collect();

        for mac in &macs {
            cache.inc_ref(&locator, mac);
        }
        let releases: Vec<_> = macs.iter().map(|mac| cache.dec_ref(&locator, mac)).collect();

        let released = releases
            .iter()
            .filter(|r| **r == RefRelease::Released)
            .count();
        assert_eq!(released, 1);
        assert_eq!(releases.last(), Some(&RefRelease::Released));
        assert!(!cache.refs().contains(&locator));
        assert!(cache.is_in_transit(EntityKind::PhysicalLocator, &locator.key));
        // Reserved, not deleted: the device id is still known.
        assert_eq!(
            cache.device_id(EntityKind::PhysicalLocator, &locator.key),
            Some(DeviceId::from("L1"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn set_refs_moves_reference_without_touching_kept_ones() {
        let cache = DeviceCache::new(EXPIRY);
        let mac = EntityRef::new(EntityKind::RemoteUcastMac, "LS1/00:00:00:00:00:01".into());
        let old = EntityRef::new(EntityKind::PhysicalLocator, "10.0.0.9".into());
        let new = EntityRef::new(EntityKind::PhysicalLocator, "10.0.0.10".into());
        for loc in [&old, &new] {
            cache.mark_available(loc.kind, loc.key.clone(), loc.key.as_str().into(), payload("x"));
        }

        cache.set_refs(&mac, std::slice::from_ref(&old));
        cache.set_refs(&mac, std::slice::from_ref(&old));
        assert!(cache.is_available(old.kind, &old.key));

        cache.set_refs(&mac, std::slice::from_ref(&new));
        assert!(cache.is_in_transit(old.kind, &old.key));
        assert!(cache.is_available(new.kind, &new.key));
        assert_eq!(cache.refs().resources_of(&mac), vec![new]);
    }

    #[test]
    fn config_index_is_independent_of_rows() {
        let cache = DeviceCache::new(EXPIRY);
        cache.put_config(
            EntityKind::LogicalSwitch,
            &ls(),
            DesiredEntity::logical_switch("LS1", Some(5000)),
        );
        assert!(cache.has_config(EntityKind::LogicalSwitch, &ls()));
        assert!(!cache.is_available(EntityKind::LogicalSwitch, &ls()));

        cache.clear_rows();
        assert_eq!(cache.config_entries().len(), 1);
        assert!(cache.remove_config(EntityKind::LogicalSwitch, &ls()).is_some());
        assert!(!cache.has_config(EntityKind::LogicalSwitch, &ls()));
    }

    #[test]
    fn version_bumps_on_mutation() {
        let cache = DeviceCache::new(EXPIRY);
        let rx = cache.changes();
        cache.mark_available(EntityKind::LogicalSwitch, ls(), "U1".into(), payload("LS1"));
        cache.clear(EntityKind::LogicalSwitch, &ls());
        assert_eq!(*rx.borrow(), 2);
    }
}
