// ── Shared-resource reference counts ──
//
// Tracks which entities reference a shared resource (a tunnel endpoint
// referenced by remote MACs). A resource whose last holder lets go becomes
// a deletion candidate; the cache decides what that means.

use std::collections::HashSet;
use std::fmt;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

use crate::model::{EntityKind, ModelKey};

/// An entity named by kind and model key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub key: ModelKey,
}

impl EntityRef {
    pub fn new(kind: EntityKind, key: ModelKey) -> Self {
        Self { kind, key }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

/// Outcome of dropping one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefRelease {
    /// Other holders remain.
    Remaining(usize),
    /// That was the last holder; the resource is no longer tracked.
    Released,
    /// The referrer did not hold the resource.
    NotHeld,
}

#[derive(Debug, Default)]
pub struct RefCountTable {
    /// resource -> entities referencing it
    holders: DashMap<EntityRef, HashSet<EntityRef>>,
    /// referrer -> resources it references
    held: DashMap<EntityRef, HashSet<EntityRef>>,
}

impl RefCountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `referrer` uses `resource`. Idempotent per pair.
    /// Returns the resource's holder count.
    pub fn inc(&self, resource: &EntityRef, referrer: &EntityRef) -> usize {
        let count = {
            let mut set = self.holders.entry(resource.clone()).or_default();
            set.insert(referrer.clone());
            set.len()
        };
        self.held
            .entry(referrer.clone())
            .or_default()
            .insert(resource.clone());
        count
    }

    pub fn dec(&self, resource: &EntityRef, referrer: &EntityRef) -> RefRelease {
        let release = match self.holders.entry(resource.clone()) {
            Entry::Vacant(_) => RefRelease::NotHeld,
            Entry::Occupied(mut entry) => {
                if entry.get_mut().remove(referrer) {
                    if entry.get().is_empty() {
                        entry.remove();
                        RefRelease::Released
                    } else {
                        RefRelease::Remaining(entry.get().len())
                    }
                } else {
                    RefRelease::NotHeld
                }
            }
        };

        if let Entry::Occupied(mut entry) = self.held.entry(referrer.clone()) {
            entry.get_mut().remove(resource);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        release
    }

    /// Drop every reference `referrer` holds. Returns the resources that
    /// lost their last holder.
    pub fn release_all(&self, referrer: &EntityRef) -> Vec<EntityRef> {
        let resources = self
            .held
            .get(referrer)
            .map(|set| set.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        resources
            .into_iter()
            .filter(|resource| self.dec(resource, referrer) == RefRelease::Released)
            .collect()
    }

    pub fn count(&self, resource: &EntityRef) -> usize {
        self.holders.get(resource).map_or(0, |set| set.len())
    }

    pub fn contains(&self, resource: &EntityRef) -> bool {
        self.holders.contains_key(resource)
    }

    pub fn resources_of(&self, referrer: &EntityRef) -> Vec<EntityRef> {
        self.held
            .get(referrer)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Resource -> sorted holders, sorted by resource.
    pub fn snapshot(&self) -> Vec<(EntityRef, Vec<EntityRef>)> {
        let mut out: Vec<_> = self
            .holders
            .iter()
            .map(|entry| {
                let mut holders: Vec<_> = entry.value().iter().cloned().collect();
                holders.sort();
                (entry.key().clone(), holders)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn clear(&self) {
        self.holders.clear();
        self.held.clear();
    }
}
