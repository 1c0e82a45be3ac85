//! Keyset-paged iteration over a collection, either in `(updated, id)`
//! order or in the order this device stored the rows.

use std::collections::VecDeque;

use bazaar_shared::{EntityKind, Record};
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::records::decode_row;

/// Rows fetched per page.
pub const DEFAULT_PAGE_SIZE: u32 = 256;

/// Position of the last yielded record. Resuming from it yields exactly the
/// records after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPosition {
    pub updated: i64,
    pub id: String,
}

/// Lazy iterator over records with `updated >= since`.
///
/// Memory use is bounded by one page regardless of collection size. Rows
/// written behind the cursor while iterating are not revisited; rows written
/// ahead of it are picked up.
pub struct ScanCursor<'db> {
    db: &'db Database,
    kind: EntityKind,
    since: i64,
    after: Option<ScanPosition>,
    page: VecDeque<(i64, String, String)>,
    page_size: u32,
    exhausted: bool,
}

impl<'db> ScanCursor<'db> {
    /// Where a restarted scan should continue from.
    pub fn position(&self) -> Option<&ScanPosition> {
        self.after.as_ref()
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn fill(&mut self) -> Result<()> {
        let table = self.kind.table();
        let mut rows: Vec<(i64, String, String)> = Vec::new();
        match &self.after {
            None => {
                let mut stmt = self.db.conn().prepare(&format!(
                    "SELECT updated, id, body FROM {table}
                     WHERE updated >= ?1
                     ORDER BY updated, id
                     LIMIT ?2"
                ))?;
                let mapped = stmt.query_map(params![self.since, self.page_size], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                for row in mapped {
                    rows.push(row?);
                }
            }
            Some(pos) => {
                let mut stmt = self.db.conn().prepare(&format!(
                    "SELECT updated, id, body FROM {table}
                     WHERE updated >= ?1 AND (updated > ?2 OR (updated = ?2 AND id > ?3))
                     ORDER BY updated, id
                     LIMIT ?4"
                ))?;
                let mapped = stmt.query_map(
                    params![self.since, pos.updated, pos.id, self.page_size],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
                for row in mapped {
                    rows.push(row?);
                }
            }
        }

        if (rows.len() as u32) < self.page_size {
            self.exhausted = true;
        }
        self.page.extend(rows);
        Ok(())
    }
}

impl Iterator for ScanCursor<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }

        let (updated, id, body) = self.page.pop_front()?;
        let record = decode_row(self.kind, &body);
        self.after = Some(ScanPosition { updated, id });
        Some(record)
    }
}

impl Database {
    /// Records of `kind` with `updated >= since`, ascending by `(updated, id)`.
    ///
    /// Message records yielded here carry `unread = false`; the flag is
    /// device-local and not part of what a scan replicates.
    pub fn scan_since(&self, kind: EntityKind, since: i64) -> ScanCursor<'_> {
        ScanCursor {
            db: self,
            kind,
            since,
            after: None,
            page: VecDeque::new(),
            page_size: DEFAULT_PAGE_SIZE,
            exhausted: false,
        }
    }

    /// Up to `limit` records of `kind` stored after ingest sequence `after`,
    /// ascending by sequence and paired with it. Page through by passing the
    /// last sequence returned.
    pub fn changes_after(&self, kind: EntityKind, after: i64, limit: u32) -> Result<Vec<(i64, Record)>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT seq, body FROM {} WHERE seq > ?1 ORDER BY seq LIMIT ?2",
            kind.table()
        ))?;
        let rows = stmt.query_map(params![after, limit.max(1)], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (seq, body) = row?;
            out.push((seq, decode_row(kind, &body)?));
        }
        Ok(out)
    }

    /// Resume a scan strictly after `position`.
    pub fn scan_from(&self, kind: EntityKind, since: i64, position: ScanPosition) -> ScanCursor<'_> {
        ScanCursor {
            after: Some(position),
            ..self.scan_since(kind, since)
        }
    }
}
