use std::io;

use bazaar_shared::{EntityKind, PeerId, ValidationError};
use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(io::Error),

    /// A stored document failed to (de)serialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// The on-disk schema is not the one this build understands.
    #[error("Schema mismatch: found version {found}, expected {expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    /// Another thread panicked while holding a store lock.
    #[error("Store lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// The disk or database is full.
    #[error("Storage quota exceeded")]
    QuotaExceeded,

    /// Stored bytes no longer hash to their content id.
    #[error("Content {id} is corrupted")]
    ContentCorrupted { id: String },

    #[error("Blob too large: {size} bytes (max {max})")]
    BlobTooLarge { size: usize, max: usize },

    #[error("Empty blob")]
    EmptyBlob,

    #[error("Invalid content id: {0}")]
    InvalidContentId(String),

    /// Saving would move a peer checkpoint backwards.
    #[error("Checkpoint for {peer} would regress on {kind}")]
    CheckpointRegression { peer: PeerId, kind: EntityKind },

    #[error("Invalid record: {0}")]
    Validation(#[from] ValidationError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => StoreError::QuotaExceeded,
            _ => StoreError::Sqlite(e),
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::StorageFull => StoreError::QuotaExceeded,
            _ => StoreError::Io(e),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
