// ── Entity kinds ──
//
// One variant per hardware_vtep table the engine tracks. Declaration order
// is dependency order: a kind only references kinds declared before it, so
// iterating `EntityKind::iter()` applies referenced rows first.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EntityKind {
    PhysicalSwitch,
    PhysicalPort,
    LogicalSwitch,
    PhysicalLocator,
    PhysicalLocatorSet,
    LocalUcastMac,
    RemoteUcastMac,
    LocalMcastMac,
    RemoteMcastMac,
    Tunnel,
}

impl EntityKind {
    /// Device table backing this kind.
    pub const fn table(self) -> &'static str {
        match self {
            Self::PhysicalSwitch => "Physical_Switch",
            Self::PhysicalPort => "Physical_Port",
            Self::LogicalSwitch => "Logical_Switch",
            Self::PhysicalLocator => "Physical_Locator",
            Self::PhysicalLocatorSet => "Physical_Locator_Set",
            Self::LocalUcastMac => "Ucast_Macs_Local",
            Self::RemoteUcastMac => "Ucast_Macs_Remote",
            Self::LocalMcastMac => "Mcast_Macs_Local",
            Self::RemoteMcastMac => "Mcast_Macs_Remote",
            Self::Tunnel => "Tunnel",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        Self::iter().find(|k| k.table() == table)
    }

    /// Segment of this kind under a node in the operational tree.
    pub const fn segment(self) -> &'static str {
        match self {
            Self::PhysicalSwitch => "physical-switches",
            Self::PhysicalPort => "physical-ports",
            Self::LogicalSwitch => "logical-switches",
            Self::PhysicalLocator => "physical-locators",
            Self::PhysicalLocatorSet => "physical-locator-sets",
            Self::LocalUcastMac => "local-ucast-macs",
            Self::RemoteUcastMac => "remote-ucast-macs",
            Self::LocalMcastMac => "local-mcast-macs",
            Self::RemoteMcastMac => "remote-mcast-macs",
            Self::Tunnel => "tunnels",
        }
    }

    /// Columns requested when monitoring the table.
    pub const fn columns(self) -> &'static [&'static str] {
        match self {
            Self::PhysicalSwitch => &[
                "name",
                "description",
                "management_ips",
                "tunnel_ips",
                "ports",
                "tunnels",
            ],
            Self::PhysicalPort => &["name", "description", "vlan_bindings"],
            Self::LogicalSwitch => &["name", "description", "tunnel_key", "replication_mode"],
            Self::PhysicalLocator => &["dst_ip", "encapsulation_type"],
            Self::PhysicalLocatorSet => &["locators"],
            Self::LocalUcastMac | Self::RemoteUcastMac => {
                &["MAC", "logical_switch", "locator", "ipaddr"]
            }
            Self::LocalMcastMac | Self::RemoteMcastMac => {
                &["MAC", "logical_switch", "locator_set", "ipaddr"]
            }
            Self::Tunnel => &["local", "remote", "bfd_status"],
        }
    }

    /// Kinds the controller writes. Rows of these kinds that the device
    /// reports without desired configuration are stale.
    pub const fn is_controller_managed(self) -> bool {
        matches!(
            self,
            Self::LogicalSwitch | Self::PhysicalLocator | Self::RemoteUcastMac | Self::RemoteMcastMac
        )
    }

    /// MAC kinds, keyed by `<logical switch>/<mac>`.
    pub const fn is_mac(self) -> bool {
        matches!(
            self,
            Self::LocalUcastMac | Self::RemoteUcastMac | Self::LocalMcastMac | Self::RemoteMcastMac
        )
    }

    /// Column carrying the natural key. Kinds without one are keyed by
    /// their device uuid.
    pub const fn key_column(self) -> Option<&'static str> {
        match self {
            Self::PhysicalSwitch | Self::PhysicalPort | Self::LogicalSwitch => Some("name"),
            Self::PhysicalLocator => Some("dst_ip"),
            Self::LocalUcastMac | Self::RemoteUcastMac | Self::LocalMcastMac | Self::RemoteMcastMac => {
                Some("MAC")
            }
            Self::PhysicalLocatorSet | Self::Tunnel => None,
        }
    }

    /// Reference columns that point at shared resources. These are the
    /// references tracked in the cache's reference-count table.
    pub const fn shared_references(self) -> &'static [(&'static str, EntityKind)] {
        match self {
            Self::LocalUcastMac | Self::RemoteUcastMac => &[("locator", Self::PhysicalLocator)],
            Self::LocalMcastMac | Self::RemoteMcastMac => {
                &[("locator_set", Self::PhysicalLocatorSet)]
            }
            _ => &[],
        }
    }

    /// Shared resources the engine creates on demand when a referencing
    /// row needs them.
    pub const fn is_shared_resource(self) -> bool {
        matches!(self, Self::PhysicalLocator | Self::PhysicalLocatorSet)
    }
}
