// ── Runtime engine configuration ──
//
// Every timeout, capacity and window the engine uses. Core never reads
// config files; hwvtep-config builds a `CoreConfig` and hands it in.

use std::time::Duration;

/// Tunables for the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Database every device must serve.
    pub database: String,
    /// Ownership entity type registered for each device.
    pub entity_type: String,
    /// Bound on `get_databases` / `get_schema` during connect.
    pub metadata_timeout: Duration,
    /// Bound on the initial monitor request after ownership is granted.
    pub monitor_timeout: Duration,
    /// How long to wait for a first ownership decision before querying
    /// the ownership service directly.
    pub ownership_wait_timeout: Duration,
    /// How long a dependent job may wait before it is dropped.
    pub dependency_timeout: Duration,
    /// Maximum number of waiting jobs per device (both queues).
    pub queue_capacity: usize,
    /// Age at which an in-transit row is purged.
    pub in_transit_expiry: Duration,
    /// Period of the in-transit and dependency expiry sweep.
    pub sweep_interval: Duration,
    /// Deadline for the first full sync once a command is waiting.
    pub reconciliation_gate_timeout: Duration,
    /// Grace window before orphaned operational state is deleted.
    pub cleanup_delay: Duration,
    /// Pause between controller-initiated reconnect attempts.
    pub retry_interval: Duration,
    /// Entries kept per transaction history ring.
    pub history_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let in_transit_expiry = Duration::from_secs(30);
        Self {
            database: "hardware_vtep".into(),
            entity_type: "ovsdb-hwvtep".into(),
            metadata_timeout: Duration::from_secs(1),
            monitor_timeout: Duration::from_secs(10),
            ownership_wait_timeout: Duration::from_secs(60),
            dependency_timeout: Duration::from_secs(120),
            queue_capacity: 10_000,
            in_transit_expiry,
            sweep_interval: in_transit_expiry / 2,
            reconciliation_gate_timeout: Duration::from_secs(30),
            cleanup_delay: Duration::from_secs(30),
            retry_interval: Duration::from_secs(10),
            history_capacity: 500,
        }
    }
}
