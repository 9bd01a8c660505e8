use thiserror::Error;

/// Top-level error type for the `hwvtep-api` crate.
///
/// Covers every failure a collaborator can report: transport,
/// device-side transaction errors, ownership service and operational
/// store. `hwvtep-core` maps these into session-scoped failures.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// The device refused or never answered the connection attempt.
    #[error("Connection to {address} refused: {reason}")]
    ConnectionRefused { address: String, reason: String },

    /// A request did not complete in time.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// The session dropped while a request was outstanding.
    #[error("Transport disconnected")]
    Disconnected,

    // ── Metadata ────────────────────────────────────────────────────
    /// The device does not serve the requested database.
    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    /// Schema fetch or parse failure.
    #[error("Schema error: {0}")]
    Schema(String),

    // ── Transactions ────────────────────────────────────────────────
    /// The device rejected one operation of a transaction.
    #[error("Transaction operation {index} failed: {message}")]
    Transaction { index: usize, message: String },

    // ── Ownership ───────────────────────────────────────────────────
    /// A candidate for this entity is already registered locally.
    #[error("Candidate already registered for {entity}")]
    CandidateAlreadyRegistered { entity: String },

    /// Any other ownership service failure.
    #[error("Ownership service error: {0}")]
    Ownership(String),

    // ── Operational store ───────────────────────────────────────────
    /// Commit or read failure in the operational store.
    #[error("Operational store error: {0}")]
    Store(String),

    // ── Data ────────────────────────────────────────────────────────
    /// A device payload could not be decoded.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. } | Self::Timeout { .. } | Self::Disconnected
        )
    }

    /// Returns `true` if this error reports a duplicate candidate registration.
    pub fn is_already_registered(&self) -> bool {
        matches!(self, Self::CandidateAlreadyRegistered { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Deserialization {
            message: err.to_string(),
        }
    }
}
