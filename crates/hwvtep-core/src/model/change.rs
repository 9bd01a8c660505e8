// ── Desired-configuration feed ──
//
// The controller's config store reports changes as typed model paths. The
// embedding application translates its change notifications into these
// and hands them to `ConnectionRegistry::apply_config`.

use std::net::SocketAddr;

use hwvtep_api::Row;
use serde_json::json;

use super::{EntityKind, ModelKey, NodeId, Reference};

/// Encapsulation written on every tunnel endpoint the engine creates.
pub const VXLAN_OVER_IPV4: &str = "vxlan_over_ipv4";

/// What the controller wants one entity to look like.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredEntity {
    /// Plain columns.
    pub payload: Row,
    /// Reference columns, resolved to device ids at submission.
    pub references: Vec<Reference>,
}

impl DesiredEntity {
    pub fn new(payload: Row, references: Vec<Reference>) -> Self {
        Self {
            payload,
            references,
        }
    }

    pub fn logical_switch(name: &str, tunnel_key: Option<u32>) -> Self {
        let mut payload = Row::new();
        payload.insert("name".into(), json!(name));
        if let Some(vni) = tunnel_key {
            payload.insert("tunnel_key".into(), json!(vni));
        }
        Self::new(payload, Vec::new())
    }

    pub fn remote_ucast_mac(mac: &str, logical_switch: &ModelKey, locator_ip: &str) -> Self {
        let mut payload = Row::new();
        payload.insert("MAC".into(), json!(mac));
        Self::new(
            payload,
            vec![
                Reference::new(
                    "logical_switch",
                    EntityKind::LogicalSwitch,
                    logical_switch.clone(),
                ),
                Reference::new("locator", EntityKind::PhysicalLocator, ModelKey::from(locator_ip)),
            ],
        )
    }

    /// Payload of a tunnel endpoint keyed by its destination address.
    pub fn physical_locator(dst_ip: &ModelKey) -> Self {
        let mut payload = Row::new();
        payload.insert("dst_ip".into(), json!(dst_ip.as_str()));
        payload.insert("encapsulation_type".into(), json!(VXLAN_OVER_IPV4));
        Self::new(payload, Vec::new())
    }

    /// Payload for a shared resource the engine creates on demand. Only
    /// tunnel endpoints are created this way.
    pub fn shared_resource(kind: EntityKind, key: &ModelKey) -> Option<Self> {
        match kind {
            EntityKind::PhysicalLocator => Some(Self::physical_locator(key)),
            _ => None,
        }
    }
}

/// One desired-configuration mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    /// A managed node was declared or changed. With an address the
    /// controller initiates (and retries) the connection itself.
    NodeUpserted {
        node: NodeId,
        address: Option<SocketAddr>,
    },
    NodeRemoved {
        node: NodeId,
    },
    EntityUpserted {
        node: NodeId,
        kind: EntityKind,
        key: ModelKey,
        entity: DesiredEntity,
    },
    EntityRemoved {
        node: NodeId,
        kind: EntityKind,
        key: ModelKey,
    },
}

impl ConfigChange {
    pub fn node(&self) -> &NodeId {
        match self {
            Self::NodeUpserted { node, .. }
            | Self::NodeRemoved { node }
            | Self::EntityUpserted { node, .. }
            | Self::EntityRemoved { node, .. } => node,
        }
    }

    pub fn logical_switch(node: NodeId, name: &str, tunnel_key: Option<u32>) -> Self {
        Self::EntityUpserted {
            node,
            kind: EntityKind::LogicalSwitch,
            key: ModelKey::from(name),
            entity: DesiredEntity::logical_switch(name, tunnel_key),
        }
    }

    pub fn remote_ucast_mac(node: NodeId, logical_switch: &str, mac: &str, locator_ip: &str) -> Self {
        let ls = ModelKey::from(logical_switch);
        Self::EntityUpserted {
            node,
            kind: EntityKind::RemoteUcastMac,
            key: ModelKey::qualified(&ls, mac),
            entity: DesiredEntity::remote_ucast_mac(mac, &ls, locator_ip),
        }
    }
}
