//! Typed access to the six keyed collections.

use bazaar_shared::{EntityKind, Message, MetaEntry, Record};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Fetch one record. Messages carry their local `unread` flag.
    pub fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Record>> {
        let row: Option<(String, bool)> = if kind == EntityKind::Message {
            self.conn()
                .query_row(
                    "SELECT body, unread FROM messages WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
        } else {
            self.conn()
                .query_row(
                    &format!("SELECT body FROM {} WHERE id = ?1", kind.table()),
                    params![id],
                    |row| Ok((row.get(0)?, false)),
                )
                .optional()?
        };

        row.map(|(body, unread)| decode(kind, &body, unread))
            .transpose()
    }

    /// Insert or replace a record.
    ///
    /// A message keeps its stored `unread` flag on replace; it is only taken
    /// from the record on first insert.
    ///
    /// Every write is stamped with the next ingest sequence number.
    pub fn put(&self, record: &Record) -> Result<()> {
        record.validate()?;
        let body = record.to_body()?;
        let seq = self.next_seq()?;

        match record {
            Record::Message(m) => {
                self.conn().execute(
                    "INSERT INTO messages (id, updated, body, unread, recipient, seq)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                        updated = excluded.updated,
                        body = excluded.body,
                        recipient = excluded.recipient,
                        seq = excluded.seq",
                    params![m.id, m.created, body, m.unread, m.to, seq],
                )?;
            }
            _ => {
                self.conn().execute(
                    &format!(
                        "INSERT INTO {} (id, updated, body, seq) VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(id) DO UPDATE SET
                            updated = excluded.updated,
                            body = excluded.body,
                            seq = excluded.seq",
                        record.kind().table()
                    ),
                    params![record.id(), record.updated(), body, seq],
                )?;
            }
        }

        tracing::debug!(kind = %record.kind(), id = record.id(), updated = record.updated(), seq, "stored record");
        Ok(())
    }

    fn next_seq(&self) -> Result<i64> {
        self.conn()
            .execute("UPDATE ingest_counter SET value = value + 1 WHERE id = 1", [])?;
        let seq = self
            .conn()
            .query_row("SELECT value FROM ingest_counter WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        Ok(seq)
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            &format!("DELETE FROM {} WHERE id = ?1", kind.table()),
            params![id],
        )?;
        Ok(affected > 0)
    }

    pub fn count(&self, kind: EntityKind) -> Result<u64> {
        let n: i64 = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM {}", kind.table()),
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    // -- messages -----------------------------------------------------------

    /// Toggle the local read state. Never touches the synced body.
    pub fn set_unread(&self, id: &str, unread: bool) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages SET unread = ?2 WHERE id = ?1",
            params![id, unread],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Unread messages addressed to `recipient`, oldest first.
    pub fn list_unread(&self, recipient: &str) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT body FROM messages
             WHERE recipient = ?1 AND unread = 1
             ORDER BY updated, id",
        )?;
        let rows = stmt.query_map(params![recipient], |row| row.get::<_, String>(0))?;

        let mut messages = Vec::new();
        for body in rows {
            let mut message: Message = serde_json::from_str(&body?)?;
            message.unread = true;
            messages.push(message);
        }
        Ok(messages)
    }

    // -- meta ---------------------------------------------------------------

    pub fn get_meta(&self, key: &str) -> Result<Option<MetaEntry>> {
        match self.get(EntityKind::Meta, key)? {
            Some(Record::Meta(entry)) => Ok(Some(entry)),
            _ => Ok(None),
        }
    }

    pub fn put_meta(&self, entry: MetaEntry) -> Result<()> {
        self.put(&Record::Meta(entry))
    }
}

fn decode(kind: EntityKind, body: &str, unread: bool) -> Result<Record> {
    let mut record = Record::from_body(kind, body)?;
    if let Record::Message(m) = &mut record {
        m.unread = unread;
    }
    Ok(record)
}

pub(crate) fn decode_row(kind: EntityKind, body: &str) -> Result<Record> {
    decode(kind, body, false)
}
