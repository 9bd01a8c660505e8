// ── Core identity types ──
//
// A row is named three ways: by the controller (ModelKey), by the device
// once it exists there (DeviceId) and by its desired-configuration entry
// (ConfigKey). NodeId names the device itself.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use hwvtep_api::StorePath;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── ModelKey ────────────────────────────────────────────────────────

/// Controller-side name of a logical entity, unique within its kind.
///
/// Independent of any device-local identifier: `LS1` for a logical
/// switch, `10.0.0.9` for a tunnel endpoint, `LS1/00:11:22:33:44:55` for a
/// MAC entry qualified by its switch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelKey(String);

impl ModelKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key of an entity that lives inside `parent` (e.g. a MAC in a switch).
    pub fn qualified(parent: &ModelKey, leaf: &str) -> Self {
        Self(format!("{}/{leaf}", parent.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ModelKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── ConfigKey ───────────────────────────────────────────────────────

/// Key of a desired-configuration entry. Shares the model key namespace
/// but indexes what the controller wants rather than what the device has.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigKey(ModelKey);

impl ConfigKey {
    pub fn model_key(&self) -> &ModelKey {
        &self.0
    }
}

impl From<ModelKey> for ConfigKey {
    fn from(key: ModelKey) -> Self {
        Self(key)
    }
}

impl From<&ModelKey> for ConfigKey {
    fn from(key: &ModelKey) -> Self {
        Self(key.clone())
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ── DeviceId ────────────────────────────────────────────────────────

/// Identifier the device assigned to a row.
///
/// Devices report RFC 4122 uuids; anything else is kept verbatim so a
/// non-conforming device still round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceId {
    Uuid(Uuid),
    Opaque(String),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Opaque(s) => f.write_str(s),
        }
    }
}

impl FromStr for DeviceId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl From<Uuid> for DeviceId {
    fn from(u: Uuid) -> Self {
        Self::Uuid(u)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Uuid::parse_str(s).map_or_else(|_| Self::Opaque(s.to_owned()), Self::Uuid)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        match Uuid::parse_str(&s) {
            Ok(u) => Self::Uuid(u),
            Err(_) => Self::Opaque(s),
        }
    }
}

// ── NodeId ──────────────────────────────────────────────────────────

/// Controller-side identity of a managed device, e.g. `hwvtep://10.0.0.1`.
///
/// Doubles as the ownership entity name and as the root of the device's
/// operational subtree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Node id of a device that connected to us. Only the address is used:
    /// the source port of a passive connection changes on every reconnect.
    pub fn for_device(ip: IpAddr) -> Self {
        Self(format!("hwvtep://{ip}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn store_path(&self) -> StorePath {
        StorePath::root(self.0.clone())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
