// ── Cluster ownership service ──
//
// Leader election per device is delegated to an external service. Each
// controller instance registers as a candidate for a device's entity and
// is told, through change notifications, who owns it.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Error;

/// The unit of ownership: one per managed device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnershipEntity {
    pub entity_type: String,
    pub name: String,
}

impl OwnershipEntity {
    pub fn new(entity_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for OwnershipEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.name)
    }
}

/// Point-in-time ownership of an entity as seen by this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnershipState {
    Owner,
    NotOwner,
    NoOwner,
    Unknown,
}

/// Ownership change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipChange {
    pub entity: OwnershipEntity,
    pub was_owner: bool,
    pub is_owner: bool,
    pub has_owner: bool,
}

impl OwnershipChange {
    pub fn state(&self) -> OwnershipState {
        match (self.is_owner, self.has_owner) {
            (true, _) => OwnershipState::Owner,
            (false, true) => OwnershipState::NotOwner,
            (false, false) => OwnershipState::NoOwner,
        }
    }
}

/// Proof of a live candidacy. Hand it back to
/// [`OwnershipService::unregister_candidate`] to withdraw.
#[derive(Debug, PartialEq, Eq)]
pub struct CandidateRegistration {
    entity: OwnershipEntity,
}

impl CandidateRegistration {
    pub fn new(entity: OwnershipEntity) -> Self {
        Self { entity }
    }

    pub fn entity(&self) -> &OwnershipEntity {
        &self.entity
    }
}

#[async_trait]
pub trait OwnershipService: Send + Sync {
    /// Become a candidate for `entity`. Fails with
    /// [`Error::CandidateAlreadyRegistered`] when a local candidacy exists.
    async fn register_candidate(
        &self,
        entity: &OwnershipEntity,
    ) -> Result<CandidateRegistration, Error>;

    /// Withdraw a candidacy. Completes only once the service has removed it.
    async fn unregister_candidate(&self, registration: CandidateRegistration)
    -> Result<(), Error>;

    async fn ownership_state(&self, entity: &OwnershipEntity) -> Result<OwnershipState, Error>;

    /// Ownership changes for every entity of `entity_type`.
    fn subscribe(&self, entity_type: &str) -> broadcast::Receiver<OwnershipChange>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(is_owner: bool, has_owner: bool) -> OwnershipChange {
        OwnershipChange {
            entity: OwnershipEntity::new("ovsdb-hwvtep", "hwvtep://10.0.0.1"),
            was_owner: false,
            is_owner,
            has_owner,
        }
    }

    #[test]
    fn change_maps_to_state() {
        assert_eq!(change(true, true).state(), OwnershipState::Owner);
        assert_eq!(change(false, true).state(), OwnershipState::NotOwner);
        assert_eq!(change(false, false).state(), OwnershipState::NoOwner);
    }

    #[test]
    fn entity_display() {
        let entity = OwnershipEntity::new("ovsdb-hwvtep", "hwvtep://10.0.0.1");
        assert_eq!(entity.to_string(), "ovsdb-hwvtep:hwvtep://10.0.0.1");
    }
}
