//! Error types for sync operations

use crate::model::BlockHeight;
use crate::progress::SyncStage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// A single or streaming call ran past its deadline
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Status error
    #[error("Status error: {0}")]
    Status(#[from] tonic::Status),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Native engine failure unrelated to chain validity
    #[error("Engine error: {0}")]
    Engine(String),

    /// Chain validation could not run to completion
    #[error("Chain validation failed: {0}")]
    ValidationMachinery(String),

    /// Stored blocks are not a continuous chain
    #[error("Chain invalid; highest valid block is {height}")]
    ChainInvalid {
        /// Highest height still believed valid
        height: BlockHeight,
    },

    /// A transaction could not be enhanced within its retry budget
    #[error("Enhancement of transaction {txid} failed after {attempts} attempts: {reason}")]
    EnhancementExhausted {
        /// Transaction id, hex encoded
        txid: String,
        /// Attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },

    /// Lookup returned nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A sync cycle is already running
    #[error("Sync already in progress")]
    SyncInProgress,

    /// Operation cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Sync cycle failed
    #[error("{0}")]
    Sync(SyncFailure),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<lightsync_net::Error> for Error {
    fn from(e: lightsync_net::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl Error {
    /// Whether this failure came from the network path.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Connection(_)
                | Error::Timeout(_)
                | Error::Transport(_)
                | Error::Status(_)
        )
    }

    /// Classify into the reason reported to callers.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Error::ValidationMachinery(_) => FailureReason::Validation,
            Error::ChainInvalid { .. } => FailureReason::ChainInvalid,
            Error::EnhancementExhausted { .. } => FailureReason::EnhancementExhausted,
            Error::Storage(_) | Error::NotFound(_) | Error::Io(_) => FailureReason::Storage,
            Error::Sync(failure) => failure.reason,
            e if e.is_transport() => FailureReason::Transport,
            _ => FailureReason::Engine,
        }
    }
}

/// Why a cycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Network or timeout failure
    Transport,
    /// Validation machinery failure
    Validation,
    /// Chain continuity broken
    ChainInvalid,
    /// Enhancement retry budget exhausted
    EnhancementExhausted,
    /// Repository failure
    Storage,
    /// Native engine failure
    Engine,
}

/// Typed cycle failure surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    /// Stage that failed
    pub stage: SyncStage,
    /// Failure classification
    pub reason: FailureReason,
    /// Human readable detail
    pub message: String,
}

impl SyncFailure {
    /// Build from the error a stage returned.
    pub fn from_error(stage: SyncStage, error: &Error) -> Self {
        Self {
            stage,
            reason: error.failure_reason(),
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Sync failed while {} ({:?}): {}",
            self.stage.name(),
            self.reason,
            self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            Error::Timeout(Duration::from_secs(1)).failure_reason(),
            FailureReason::Transport
        );
        assert_eq!(
            Error::ChainInvalid { height: 10 }.failure_reason(),
            FailureReason::ChainInvalid
        );
        assert_eq!(
            Error::ValidationMachinery("io".into()).failure_reason(),
            FailureReason::Validation
        );
        assert_eq!(
            Error::Engine("scan".into()).failure_reason(),
            FailureReason::Engine
        );
        assert!(Error::Status(tonic::Status::unavailable("down")).is_transport());
        assert!(!Error::Cancelled.is_transport());
    }

    #[test]
    fn test_sync_failure_display() {
        let failure = SyncFailure::from_error(
            SyncStage::Validating,
            &Error::ValidationMachinery("disk".into()),
        );
        assert_eq!(failure.reason, FailureReason::Validation);
        assert!(failure.to_string().contains("Validating"));
    }
}
