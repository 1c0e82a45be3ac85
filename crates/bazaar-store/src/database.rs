//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run, and the schema version checked, before any other
//! operation.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/bazaar/bazaar.db`
    /// - macOS:   `~/Library/Application Support/com.bazaar.bazaar/bazaar.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\bazaar\bazaar\data\bazaar.db`
    pub fn open_default() -> Result<Self> {
        let data_dir = default_data_dir()?;
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("bazaar.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Private in-memory database, used by tests and ephemeral peers.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    ///
    /// Callers should prefer the typed helpers, but direct access is
    /// occasionally needed for ad-hoc queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// Every write made through `self` inside `f` is committed if `f` returns
    /// `Ok`, and rolled back otherwise (including on panic). Transactions do
    /// not nest.
    pub fn transaction<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        let mut guard = RollbackGuard {
            conn: &self.conn,
            armed: true,
        };

        let value = f(self)?;
        self.conn.execute_batch("COMMIT")?;
        guard.armed = false;
        Ok(value)
    }

    /// Close the connection, surfacing any error SQLite reports.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| StoreError::from(e))
    }
}

struct RollbackGuard<'a> {
    conn: &'a Connection,
    armed: bool,
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "rollback failed");
            }
        }
    }
}

/// Platform data directory used by [`Database::open_default`] and the
/// filesystem content backend.
pub fn default_data_dir() -> Result<PathBuf> {
    let project_dirs =
        ProjectDirs::from("com", "bazaar", "bazaar").ok_or(StoreError::NoDataDir)?;
    Ok(project_dirs.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::CURRENT_VERSION;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = Database::open_at(&path).expect("should open");
        db.close().unwrap();
        assert!(path.exists());

        Database::open_at(&path).expect("should reopen");
    }

    #[test]
    fn reopen_newer_schema_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = Database::open_at(&path).unwrap();
        db.conn()
            .pragma_update(None, "user_version", CURRENT_VERSION + 5)
            .unwrap();
        drop(db);

        assert!(matches!(
            Database::open_at(&path),
            Err(StoreError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn transaction_commits_on_ok() {
        let db = Database::open_in_memory().unwrap();
        db.transaction(|db| {
            db.conn()
                .execute("INSERT INTO meta (id, updated, body) VALUES ('k', 1, '{}')", [])?;
            Ok(())
        })
        .unwrap();

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM meta WHERE id = 'k'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn transaction_rolls_back_on_err() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.transaction(|db| {
            db.conn()
                .execute("INSERT INTO meta (id, updated, body) VALUES ('k', 1, '{}')", [])?;
            Err(StoreError::NotFound)
        });
        assert!(matches!(result, Err(StoreError::NotFound)));

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM meta WHERE id = 'k'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);

        // The connection is usable for the next transaction.
        db.transaction(|_| Ok(())).unwrap();
    }
}
