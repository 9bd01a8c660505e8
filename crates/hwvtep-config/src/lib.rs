//! Operator configuration for the hardware VTEP southbound.
//!
//! A TOML file in the platform config directory, overridden by
//! `HWVTEP_`-prefixed environment variables, validated and translated to
//! `hwvtep_core::CoreConfig`. Statically configured devices the controller
//! dials itself are turned into node changes for the registry.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hwvtep_core::{ConfigChange, CoreConfig, NodeId};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub limits: Limits,

    /// Devices the controller connects to itself.
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceSettings {
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_entity_type")]
    pub entity_type: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            database: default_database(),
            entity_type: default_entity_type(),
        }
    }
}

fn default_database() -> String {
    "hardware_vtep".into()
}
fn default_entity_type() -> String {
    "ovsdb-hwvtep".into()
}

/// Every timeout the engine uses. Seconds unless the name says otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Timeouts {
    #[serde(default = "default_metadata_ms")]
    pub metadata_ms: u64,

    #[serde(default = "default_monitor")]
    pub monitor_secs: u64,

    #[serde(default = "default_ownership_wait")]
    pub ownership_wait_secs: u64,

    #[serde(default = "default_dependency")]
    pub dependency_secs: u64,

    #[serde(default = "default_in_transit_expiry")]
    pub in_transit_expiry_secs: u64,

    /// Defaults to half the in-transit expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_interval_secs: Option<u64>,

    #[serde(default = "default_gate")]
    pub reconciliation_gate_secs: u64,

    #[serde(default = "default_cleanup_delay")]
    pub cleanup_delay_secs: u64,

    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            metadata_ms: default_metadata_ms(),
            monitor_secs: default_monitor(),
            ownership_wait_secs: default_ownership_wait(),
            dependency_secs: default_dependency(),
            in_transit_expiry_secs: default_in_transit_expiry(),
            sweep_interval_secs: None,
            reconciliation_gate_secs: default_gate(),
            cleanup_delay_secs: default_cleanup_delay(),
            retry_interval_secs: default_retry_interval(),
        }
    }
}

fn default_metadata_ms() -> u64 {
    1000
}
fn default_monitor() -> u64 {
    10
}
fn default_ownership_wait() -> u64 {
    60
}
fn default_dependency() -> u64 {
    120
}
fn default_in_transit_expiry() -> u64 {
    30
}
fn default_gate() -> u64 {
    30
}
fn default_cleanup_delay() -> u64 {
    30
}
fn default_retry_interval() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Limits {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            history_capacity: default_history_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    10_000
}
fn default_history_capacity() -> usize {
    500
}

/// A controller-initiated device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeEntry {
    /// Node id, e.g. "hwvtep://10.0.0.1".
    pub id: String,

    /// Management address, e.g. "10.0.0.1:6640".
    pub address: SocketAddr,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "hwvtep", "hwvtep-southbound").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("hwvtep-southbound");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load and validate the config from the canonical path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_from(&config_path())
}

/// Load and validate the config from `path` + environment. A missing file
/// yields the defaults.
///
/// Nested keys are separated by a double underscore in the environment:
/// `HWVTEP_TIMEOUTS__CLEANUP_DELAY_SECS=5`.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("HWVTEP_").split("__"));

    let config: Config = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Load config, returning the defaults if it is missing or invalid.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Validation and translation ──────────────────────────────────────

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.database.is_empty() {
            return Err(invalid("device.database", "must not be empty"));
        }
        if self.device.entity_type.is_empty() {
            return Err(invalid("device.entity_type", "must not be empty"));
        }

        let t = &self.timeouts;
        for (field, value) in [
            ("timeouts.metadata_ms", t.metadata_ms),
            ("timeouts.monitor_secs", t.monitor_secs),
            ("timeouts.ownership_wait_secs", t.ownership_wait_secs),
            ("timeouts.dependency_secs", t.dependency_secs),
            ("timeouts.in_transit_expiry_secs", t.in_transit_expiry_secs),
            ("timeouts.reconciliation_gate_secs", t.reconciliation_gate_secs),
            ("timeouts.retry_interval_secs", t.retry_interval_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        // An expired row may live up to one sweep past its window; a
        // sweep slower than the window would double that.
        if let Some(sweep) = t.sweep_interval_secs {
            if sweep == 0 || sweep > t.in_transit_expiry_secs {
                return Err(invalid(
                    "timeouts.sweep_interval_secs",
                    format!("expected 1..={}, got {sweep}", t.in_transit_expiry_secs),
                ));
            }
        }

        if self.limits.queue_capacity == 0 {
            return Err(invalid("limits.queue_capacity", "must be greater than zero"));
        }
        if self.limits.history_capacity == 0 {
            return Err(invalid("limits.history_capacity", "must be greater than zero"));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(invalid("nodes.id", "must not be empty"));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(invalid("nodes.id", format!("duplicate node '{}'", node.id)));
            }
        }
        Ok(())
    }

    /// Engine tunables. Call after [`validate`](Self::validate); `load_from`
    /// already does.
    pub fn to_core_config(&self) -> CoreConfig {
        let t = &self.timeouts;
        let in_transit_expiry = Duration::from_secs(t.in_transit_expiry_secs);
        CoreConfig {
            database: self.device.database.clone(),
            entity_type: self.device.entity_type.clone(),
            metadata_timeout: Duration::from_millis(t.metadata_ms),
            monitor_timeout: Duration::from_secs(t.monitor_secs),
            ownership_wait_timeout: Duration::from_secs(t.ownership_wait_secs),
            dependency_timeout: Duration::from_secs(t.dependency_secs),
            queue_capacity: self.limits.queue_capacity,
            in_transit_expiry,
            sweep_interval: t
                .sweep_interval_secs
                .map_or(in_transit_expiry / 2, Duration::from_secs),
            reconciliation_gate_timeout: Duration::from_secs(t.reconciliation_gate_secs),
            cleanup_delay: Duration::from_secs(t.cleanup_delay_secs),
            retry_interval: Duration::from_secs(t.retry_interval_secs),
            history_capacity: self.limits.history_capacity,
        }
    }

    /// One `NodeUpserted` per configured device, to feed the registry at
    /// startup.
    pub fn node_changes(&self) -> Vec<ConfigChange> {
        self.nodes
            .iter()
            .map(|node| ConfigChange::NodeUpserted {
                node: NodeId::new(node.id.clone()),
                address: Some(node.address),
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_core_defaults() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.to_core_config(), CoreConfig::default());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.limits.queue_capacity, 10_000);
        assert!(config.nodes.is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[timeouts]
cleanup_delay_secs = 5
sweep_interval_secs = 3

[limits]
queue_capacity = 64

[[nodes]]
id = "hwvtep://10.0.0.1"
address = "10.0.0.1:6640"
"#,
        )
        .unwrap();

        let config = load_from(&path).unwrap();
        let core = config.to_core_config();
        assert_eq!(core.cleanup_delay, Duration::from_secs(5));
        assert_eq!(core.sweep_interval, Duration::from_secs(3));
        assert_eq!(core.queue_capacity, 64);
        assert_eq!(core.in_transit_expiry, Duration::from_secs(30));

        assert_eq!(
            config.node_changes(),
            vec![ConfigChange::NodeUpserted {
                node: NodeId::from("hwvtep://10.0.0.1"),
                address: Some("10.0.0.1:6640".parse().unwrap()),
            }]
        );
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.timeouts.retry_interval_secs = 3;
        config.nodes.push(NodeEntry {
            id: "hwvtep://10.0.0.2".into(),
            address: "10.0.0.2:6640".parse().unwrap(),
        });

        save_to(&config, &path).unwrap();
        assert_eq!(load_from(&path).unwrap(), config);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();
        config.timeouts.sweep_interval_secs = Some(60);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sweep_interval_secs"));

        let mut config = Config::default();
        config.limits.queue_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation { field, .. }) if field == "limits.queue_capacity"
        ));

        let mut config = Config::default();
        let node = NodeEntry {
            id: "hwvtep://10.0.0.1".into(),
            address: "10.0.0.1:6640".parse().unwrap(),
        };
        config.nodes = vec![node.clone(), node];
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));
    }
}
