//! Southbound reconciliation engine for hardware VTEP devices.
//!
//! This crate keeps a clustered controller's desired configuration and a
//! fleet of OVSDB-style hardware VTEP switches in agreement. Transport,
//! cluster ownership and the operational store are collaborators from
//! `hwvtep-api`, injected at construction:
//!
//! - **[`ConnectionRegistry`]**: entry point. Tracks every live device
//!   session by transport identity, node id and ownership entity; drives
//!   candidate registration, ownership changes, disconnect cleanup and
//!   reconnect retries; routes desired-configuration changes.
//!
//! - **[`ConnectionSession`]**: one device. Owns a [`DeviceCache`], a
//!   [`DependencyQueue`] and the first-sync gate. Outbound commands and
//!   inbound monitor updates are each serialized through their own task.
//!
//! - **[`DeviceCache`]**: what the device is known to contain, keyed both by
//!   controller model key and by device row id, plus the desired config
//!   and reference counts on shared tunnel endpoints.
//!
//! - **[`DependencyQueue`]**: work parked until the rows it references
//!   exist, released in order when new data arrives and dropped when it
//!   waits too long.
//!
//! - **[`ReconciliationScheduler`]**: keyed delayed, retry and periodic
//!   tasks (reconnects, orphan cleanup, expiry sweeps).
//!
//! - **Diagnostics** ([`diag`]): serializable per-device dumps.

pub mod cache;
pub mod config;
pub mod diag;
pub mod error;
pub mod model;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod session;

// ── Primary re-exports ──────────────────────────────────────────────
pub use cache::{DeviceCache, EntityRef};
pub use config::CoreConfig;
pub use diag::SessionDump;
pub use error::CoreError;
pub use queue::{Dependency, DependencyFailure, DependencyQueue, Job, WaitQueue};
pub use registry::ConnectionRegistry;
pub use scheduler::{ReconciliationScheduler, TaskKey, TaskKind};
pub use session::gate::{GateOutcome, ReconciliationGate};
pub use session::history::{HistoryAction, HistoryEntry, TransactionHistory};
pub use session::{ConnectionSession, Initiation, SessionState};

pub use model::{
    ConfigChange, DesiredEntity, DeviceId, DeviceRow, EntityKind, ModelKey, NodeId, Reference,
    RowAction, RowOp, RowStatus, TransactCommand,
};
