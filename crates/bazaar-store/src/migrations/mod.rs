//! Database migration runner.
//!
//! Migrations are executed in order on every [`Database::open_at`] call.
//! Each migration is guarded by the `user_version` pragma so it runs exactly
//! once, and commits together with the version bump. The version is mirrored
//! in the `meta` collection under `schema_version`; the two must agree.
//!
//! [`Database::open_at`]: crate::Database::open_at

pub mod v001_initial;
pub mod v002_local_state;
pub mod v003_content_blobs;
pub mod v004_ingest_seq;

use bazaar_shared::constants::META_SCHEMA_VERSION;
use bazaar_shared::{now_millis, MetaEntry};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};

/// Current schema version.  Bump this and add a new migration module whenever
/// the schema changes.
pub const CURRENT_VERSION: u32 = 4;

type Migration = fn(&Connection) -> rusqlite::Result<()>;

const MIGRATIONS: [(u32, &str, Migration); 4] = [
    (1, "v001_initial", v001_initial::up),
    (2, "v002_local_state", v002_local_state::up),
    (3, "v003_content_blobs", v003_content_blobs::up),
    (4, "v004_ingest_seq", v004_ingest_seq::up),
];

/// Run all pending migrations against the open connection.
///
/// Fails with [`StoreError::SchemaMismatch`] rather than touching a database
/// written by a newer build or whose recorded versions disagree.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    tracing::info!(
        current_version = current,
        target_version = CURRENT_VERSION,
        "checking database migrations"
    );

    if current > CURRENT_VERSION {
        return Err(StoreError::SchemaMismatch {
            found: current,
            expected: CURRENT_VERSION,
        });
    }

    if current > 0 {
        let recorded = recorded_version(conn)?;
        if recorded != Some(current) {
            tracing::error!(
                user_version = current,
                meta_version = ?recorded,
                "schema version disagreement"
            );
            return Err(StoreError::SchemaMismatch {
                found: recorded.unwrap_or(0),
                expected: current,
            });
        }
    }

    for (version, name, up) in MIGRATIONS {
        if current >= version {
            continue;
        }
        tracing::info!(migration = name, "applying migration");
        let tx = conn.unchecked_transaction()?;
        up(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        record_version(&tx, version)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    Ok(())
}

/// Schema version mirrored in the `meta` collection, if present and numeric.
pub fn recorded_version(conn: &Connection) -> Result<Option<u32>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM meta WHERE id = ?1",
            params![META_SCHEMA_VERSION],
            |row| row.get(0),
        )
        .optional()?;

    match body {
        Some(body) => {
            let entry: MetaEntry = serde_json::from_str(&body)?;
            Ok(entry.value.parse().ok())
        }
        None => Ok(None),
    }
}

fn record_version(conn: &Connection, version: u32) -> Result<()> {
    let entry = MetaEntry {
        key: META_SCHEMA_VERSION.to_string(),
        value: version.to_string(),
        updated: now_millis(),
    };
    conn.execute(
        "INSERT INTO meta (id, updated, body) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET updated = excluded.updated, body = excluded.body",
        params![entry.key, entry.updated, serde_json::to_string(&entry)?],
    )?;
    Ok(())
}
