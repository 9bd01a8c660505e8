//! Device transport abstraction.
//!
//! A [`TransportClient`] is one live protocol session with a device. The
//! core never constructs one itself: passive connections are handed in by
//! whatever listener accepted them, active ones come from a [`Connector`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::schema::DatabaseSchema;
use crate::wire::{MonitorRequest, Operation, OperationResult, TableUpdates};

/// Endpoints of a transport session. Two sessions with the same remote
/// address are the same device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub remote: SocketAddr,
    pub local: Option<SocketAddr>,
}

impl ConnectionInfo {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            local: None,
        }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.remote)
    }
}

/// Push side of a monitor subscription.
///
/// Invoked by the transport for every update batch and for every
/// exception that ends the session. Implementations must not block.
pub trait MonitorCallback: Send + Sync {
    fn update(&self, updates: TableUpdates);
    fn exception(&self, error: Error);
}

/// One protocol session with a device.
#[async_trait]
pub trait TransportClient: Send + Sync {
    fn connection_info(&self) -> ConnectionInfo;

    async fn get_databases(&self) -> Result<Vec<String>, Error>;

    async fn get_schema(&self, database: &str) -> Result<DatabaseSchema, Error>;

    /// Start monitoring. Resolves with the full current contents of the
    /// requested tables; later changes arrive through `callback`.
    async fn monitor(
        &self,
        schema: &DatabaseSchema,
        requests: Vec<MonitorRequest>,
        callback: Arc<dyn MonitorCallback>,
    ) -> Result<TableUpdates, Error>;

    /// Submit one atomic transaction. Results are positional.
    async fn transact(
        &self,
        schema: &DatabaseSchema,
        operations: Vec<Operation>,
    ) -> Result<Vec<OperationResult>, Error>;

    async fn disconnect(&self);

    fn is_active(&self) -> bool;
}

/// Opens controller-initiated sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: SocketAddr) -> Result<Arc<dyn TransportClient>, Error>;
}

/// Whether two handles are the same underlying session.
pub fn same_session(a: &Arc<dyn TransportClient>, b: &Arc<dyn TransportClient>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
