use bazaar_shared::{CryptoError, EntityKind, ProtocolError, ValidationError};
use bazaar_store::StoreError;
use thiserror::Error;

use crate::session::SessionState;

/// Why the merge engine refused a remote record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("Invalid record: {0}")]
    Validation(#[from] ValidationError),

    /// The recomputed integrity hash differs from the one carried.
    #[error("Tampered record {id}: integrity hash mismatch")]
    TamperDetected { id: String },

    /// A signature is present but does not verify against the host key.
    #[error("Invalid signature on {id}: {reason}")]
    SignatureInvalid { id: String, reason: String },
}

/// Errors surfaced by sync sessions, the orchestrator and backups.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid record: {0}")]
    Validation(ValidationError),

    #[error("Tampered record {id}")]
    TamperDetected { id: String },

    #[error("Invalid signature on {id}: {reason}")]
    SignatureInvalid { id: String, reason: String },

    /// Key derivation, decryption or envelope failure.
    #[error("Crypto failure: {0}")]
    CryptoFailure(#[from] CryptoError),

    /// Transport failure. The only retryable kind.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage quota exceeded")]
    QuotaExceeded,

    /// A local write hit an entity with an open conflict.
    #[error("Unresolved conflict on {kind} {id}")]
    ConflictUnresolved { kind: EntityKind, id: String },

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A backup payload that is not the expected JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Invalid session transition {from:?} -> {to:?}")]
    InvalidStateTransition { from: SessionState, to: SessionState },

    /// A blocking task panicked or was torn down.
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl SyncError {
    /// Whether retrying the cycle may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::QuotaExceeded => SyncError::QuotaExceeded,
            StoreError::Validation(v) => SyncError::Validation(v),
            other => SyncError::Store(other),
        }
    }
}

impl From<MergeError> for SyncError {
    fn from(e: MergeError) -> Self {
        match e {
            MergeError::Validation(v) => SyncError::Validation(v),
            MergeError::TamperDetected { id } => SyncError::TamperDetected { id },
            MergeError::SignatureInvalid { id, reason } => SyncError::SignatureInvalid { id, reason },
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            SyncError::Cancelled
        } else {
            SyncError::TaskFailed(e.to_string())
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
