//! Content-addressed storage for media bytes.
//!
//! A blob's id is the lowercase hex BLAKE3 digest of its bytes. Blobs are
//! immutable; storing the same bytes twice is a no-op. Every read re-hashes
//! and refuses to return bytes that no longer match their id.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use bazaar_shared::constants::MAX_MEDIA_SIZE;
use bazaar_shared::{content_id, now_millis};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Operations shared by every content backend.
pub trait ContentBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Store `bytes` and return their content id.
    fn put(&self, bytes: &[u8]) -> Result<String>;

    /// Read and verify the blob with this id.
    fn get(&self, id: &str) -> Result<Vec<u8>>;

    fn contains(&self, id: &str) -> Result<bool>;

    /// Remove a blob. Returns whether it existed.
    fn delete(&self, id: &str) -> Result<bool>;
}

/// Shared handle to the backend chosen at startup.
pub type ContentStore = Arc<dyn ContentBackend>;

fn check_size(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(StoreError::EmptyBlob);
    }
    if bytes.len() > MAX_MEDIA_SIZE {
        return Err(StoreError::BlobTooLarge {
            size: bytes.len(),
            max: MAX_MEDIA_SIZE,
        });
    }
    Ok(())
}

/// Ids are 64 lowercase hex characters; anything else never reaches the
/// filesystem or a query.
fn check_id(id: &str) -> Result<()> {
    if id.len() == 64 && id.bytes().all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f')) {
        Ok(())
    } else {
        Err(StoreError::InvalidContentId(id.to_string()))
    }
}

fn verify(id: &str, bytes: Vec<u8>) -> Result<Vec<u8>> {
    if content_id(&bytes) != id {
        warn!(id, "content hash mismatch");
        return Err(StoreError::ContentCorrupted { id: id.to_string() });
    }
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------------

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf> {
    let mut resolved = base.to_path_buf();
    for component in target.strip_prefix(base).unwrap_or(target).components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(StoreError::InvalidContentId(format!(
                    "path traversal in {}",
                    target.display()
                )))
            }
            _ => {}
        }
    }
    if !resolved.starts_with(base) {
        return Err(StoreError::InvalidContentId(format!(
            "path escapes store: {}",
            target.display()
        )));
    }
    Ok(resolved)
}

/// One file per blob under a base directory.
#[derive(Debug, Clone)]
pub struct FsBackend {
    base_path: PathBuf,
}

impl FsBackend {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path)?;
        let base_path = base_path.canonicalize()?;
        info!(path = %base_path.display(), "content store initialized");
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn blob_path(&self, id: &str) -> Result<PathBuf> {
        check_id(id)?;
        ensure_within(&self.base_path, &self.base_path.join(id))
    }
}

impl ContentBackend for FsBackend {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn put(&self, bytes: &[u8]) -> Result<String> {
        check_size(bytes)?;
        let id = content_id(bytes);
        let path = self.blob_path(&id)?;
        if path.exists() {
            return Ok(id);
        }

        // Write then rename so readers never observe a partial blob.
        let tmp = path.with_extension("part");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;

        debug!(id = %id, size = bytes.len(), "stored blob");
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(id)?;
        if !path.exists() {
            return Err(StoreError::NotFound);
        }
        verify(id, fs::read(&path)?)
    }

    fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.blob_path(id)?.exists())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let path = self.blob_path(id)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        debug!(id, "deleted blob");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Database backend
// ---------------------------------------------------------------------------

/// Blobs kept in the `content_blobs` table of a dedicated connection.
pub struct DbBackend {
    db: Mutex<Database>,
}

impl DbBackend {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = self
            .db
            .lock()
            .map_err(|_| StoreError::LockPoisoned("content database"))?;
        f(&db)
    }
}

impl ContentBackend for DbBackend {
    fn name(&self) -> &'static str {
        "db"
    }

    fn put(&self, bytes: &[u8]) -> Result<String> {
        check_size(bytes)?;
        let id = content_id(bytes);
        self.with_db(|db| {
            db.conn().execute(
                "INSERT OR IGNORE INTO content_blobs (id, data, size, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, bytes, bytes.len() as i64, now_millis()],
            )?;
            Ok(())
        })?;
        debug!(id = %id, size = bytes.len(), "stored blob");
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Vec<u8>> {
        check_id(id)?;
        let data: Option<Vec<u8>> = self.with_db(|db| {
            Ok(db
                .conn()
                .query_row(
                    "SELECT data FROM content_blobs WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        verify(id, data.ok_or(StoreError::NotFound)?)
    }

    fn contains(&self, id: &str) -> Result<bool> {
        check_id(id)?;
        self.with_db(|db| {
            let n: i64 = db.conn().query_row(
                "SELECT COUNT(*) FROM content_blobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    fn delete(&self, id: &str) -> Result<bool> {
        check_id(id)?;
        self.with_db(|db| {
            let affected = db
                .conn()
                .execute("DELETE FROM content_blobs WHERE id = ?1", params![id])?;
            Ok(affected > 0)
        })
    }
}

// ---------------------------------------------------------------------------
// Capability probe
// ---------------------------------------------------------------------------

/// Whether `dir` can be created and written to.
fn dir_is_writable(dir: &Path) -> bool {
    let probe = dir.join(".probe");
    let ok = fs::create_dir_all(dir).is_ok() && fs::write(&probe, b"probe").is_ok();
    let _ = fs::remove_file(&probe);
    ok
}

/// Select the content backend once at startup: the filesystem under `dir`
/// when it is writable, otherwise the database backend on `fallback`.
pub fn probe_backend(dir: &Path, fallback: impl FnOnce() -> Result<Database>) -> Result<ContentStore> {
    if dir_is_writable(dir) {
        match FsBackend::new(dir.to_path_buf()) {
            Ok(backend) => return Ok(Arc::new(backend)),
            Err(e) => warn!(error = %e, "filesystem content backend unavailable"),
        }
    }
    info!(dir = %dir.display(), "falling back to database content backend");
    Ok(Arc::new(DbBackend::new(fallback()?)))
}
