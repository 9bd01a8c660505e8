// ── Core error types ──
//
// Session-scoped failures from hwvtep-core. Collaborator errors are
// translated through `From<hwvtep_api::Error>` so callers never match on
// transport details.

use std::time::Duration;

use thiserror::Error;

use crate::model::{EntityKind, ModelKey, NodeId};

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to device at {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("{operation} timed out after {}ms", timeout.as_millis())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Device metadata unavailable: {reason}")]
    MetadataUnavailable { reason: String },

    #[error("Session for {node} is closed")]
    SessionClosed { node: NodeId },

    #[error("This instance does not own {node}")]
    NotOwner { node: NodeId },

    // ── Dependency errors ────────────────────────────────────────────
    #[error("Dependencies of {job} unresolved after {}ms", waited.as_millis())]
    DependencyTimeout { job: String, waited: Duration },

    #[error("Dependency queue full ({capacity} jobs)")]
    QueueFull { capacity: usize },

    #[error("{column} of {kind} {key} references unknown {target_kind} {target}")]
    UnresolvedReference {
        kind: EntityKind,
        key: ModelKey,
        column: String,
        target_kind: EntityKind,
        target: ModelKey,
    },

    // ── Collaborator errors (wrapped) ────────────────────────────────
    #[error("Transport error: {message}")]
    Transport { message: String, transient: bool },

    #[error("Device rejected transaction: {message}")]
    Rejected { message: String },

    #[error("Ownership service error: {message}")]
    Ownership { message: String },

    #[error("Operational store error: {message}")]
    Store { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Returns `true` for failures a reconnect or resubmission may clear.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { transient, .. } => *transient,
            Self::ConnectionFailed { .. } | Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

// ── Conversion from collaborator errors ──────────────────────────────

impl From<hwvtep_api::Error> for CoreError {
    fn from(err: hwvtep_api::Error) -> Self {
        use hwvtep_api::Error as Api;

        let transient = err.is_transient();
        match err {
            Api::ConnectionRefused { address, reason } => {
                CoreError::ConnectionFailed { address, reason }
            }
            Api::Timeout {
                operation,
                timeout_ms,
            } => CoreError::Timeout {
                operation,
                timeout: Duration::from_millis(timeout_ms),
            },
            Api::DatabaseNotFound(name) => CoreError::MetadataUnavailable {
                reason: format!("database {name} not served"),
            },
            Api::Schema(reason) => CoreError::MetadataUnavailable { reason },
            Api::Transaction { index, message } => CoreError::Rejected {
                message: format!("operation {index}: {message}"),
            },
            Api::CandidateAlreadyRegistered { entity } => CoreError::Ownership {
                message: format!("candidate already registered for {entity}"),
            },
            Api::Ownership(message) => CoreError::Ownership { message },
            Api::Store(message) => CoreError::Store { message },
            other @ (Api::Disconnected | Api::Deserialization { .. }) => CoreError::Transport {
                message: other.to_string(),
                transient,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_map_to_core_variants() {
        let err: CoreError = hwvtep_api::Error::Disconnected.into();
        assert!(matches!(err, CoreError::Transport { transient: true, .. }));
        assert!(err.is_transient());

        let err: CoreError = hwvtep_api::Error::Schema("no tables".into()).into();
        assert!(matches!(err, CoreError::MetadataUnavailable { .. }));
        assert!(!err.is_transient());

        let err: CoreError = hwvtep_api::Error::Transaction {
            index: 2,
            message: "duplicate".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Device rejected transaction: operation 2: duplicate"
        );
    }

    #[test]
    fn dependency_timeout_is_distinct_from_transport_failure() {
        let err = CoreError::DependencyTimeout {
            job: "remote-ucast-mac LS1/00:11:22:33:44:55".into(),
            waited: Duration::from_secs(120),
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("120000ms"));
    }
}
