//! Collaborator boundary for the hardware VTEP southbound.
//!
//! The reconciliation engine in `hwvtep-core` never talks to a wire
//! protocol, a cluster membership service or a datastore directly. It
//! consumes the traits defined here, injected at construction:
//!
//! - **[`TransportClient`] / [`Connector`]**: an OVSDB-style session with a
//!   device: database listing, schema fetch, table monitoring and
//!   transactions. [`MonitorCallback`] is the push side.
//!
//! - **[`OwnershipService`]**: cluster-wide candidate registration and
//!   ownership change notification for per-device entities.
//!
//! - **[`OperationalStore`]**: the write path for operational state, with
//!   commit/cancel transactions. [`MemoryStore`] is an in-process
//!   implementation.
//!
//! - **Wire values** ([`wire`], [`schema`]): rows, operations, table
//!   updates and database schemas as the device reports them.

pub mod error;
pub mod ownership;
pub mod schema;
pub mod store;
pub mod transport;
pub mod wire;

pub use error::Error;
pub use ownership::{
    CandidateRegistration, OwnershipChange, OwnershipEntity, OwnershipService, OwnershipState,
};
pub use schema::{DatabaseSchema, TableSchema};
pub use store::{MemoryStore, OperationalStore, StorePath, StoreTransaction};
pub use transport::{ConnectionInfo, Connector, MonitorCallback, TransportClient};
pub use wire::{
    Condition, MonitorRequest, Operation, OperationResult, Row, RowUpdate, TableUpdate,
    TableUpdates,
};
