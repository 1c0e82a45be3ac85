//! # bazaar-store
//!
//! Durable local storage for the Bazaar marketplace, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed access to the six keyed
//! collections, keyset-paged scans, per-peer checkpoints and the conflict
//! log. Media bytes live in a separate content-addressed store whose
//! backend is chosen by a capability probe.

pub mod backup;
pub mod checkpoints;
pub mod conflicts;
pub mod content;
pub mod database;
pub mod migrations;
pub mod records;
pub mod scan;

mod error;

pub use backup::{BackupBlob, BackupPayload};
pub use conflicts::StoredConflict;
pub use content::{probe_backend, ContentBackend, ContentStore, DbBackend, FsBackend};
pub use database::{default_data_dir, Database};
pub use error::{Result, StoreError};
pub use scan::{ScanCursor, ScanPosition};
