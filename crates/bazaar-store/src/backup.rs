use bazaar_shared::{Booking, EntityKind, Listing, MediaObject, Message, Record, User};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::Result;
use crate::migrations::CURRENT_VERSION;

/// Everything a device holds, serialized to JSON before it is sealed.
///
/// Holds every synchronized collection, the bytes of stored media and which
/// messages were still unread. Meta (checkpoints, schema version) is device
/// state and stays behind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupPayload {
    /// ISO 8601 timestamp of when the backup was created
    pub created_at: String,
    /// App version that produced the backup
    pub version: String,
    pub schema_version: u32,
    pub users: Vec<User>,
    pub listings: Vec<Listing>,
    pub bookings: Vec<Booking>,
    pub messages: Vec<Message>,
    pub media: Vec<MediaObject>,
    /// Media bytes held by the exporting device.
    #[serde(default)]
    pub blobs: Vec<BackupBlob>,
    /// Ids of messages still unread on the exporting device.
    #[serde(default)]
    pub unread: Vec<String>,
}

/// One media blob, hex encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupBlob {
    pub id: String,
    pub data: String,
}

impl BackupPayload {
    /// Every record in dependency order (users before the listings and
    /// bookings that reference them).
    pub fn into_records(self) -> Vec<Record> {
        let mut records = Vec::with_capacity(self.len());
        records.extend(self.users.into_iter().map(Record::User));
        records.extend(self.media.into_iter().map(Record::Media));
        records.extend(self.listings.into_iter().map(Record::Listing));
        records.extend(self.bookings.into_iter().map(Record::Booking));
        records.extend(self.messages.into_iter().map(Record::Message));
        records
    }

    pub fn len(&self) -> usize {
        self.users.len()
            + self.listings.len()
            + self.bookings.len()
            + self.messages.len()
            + self.media.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Database {
    /// Export every synchronized collection into a serializable struct.
    pub fn export_payload(&self) -> Result<BackupPayload> {
        let mut payload = BackupPayload {
            created_at: chrono::Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            schema_version: CURRENT_VERSION,
            ..Default::default()
        };

        for kind in EntityKind::SYNCED {
            for record in self.scan_since(kind, 0) {
                match record? {
                    Record::User(u) => payload.users.push(u),
                    Record::Listing(l) => payload.listings.push(l),
                    Record::Booking(b) => payload.bookings.push(b),
                    Record::Message(m) => payload.messages.push(m),
                    Record::Media(m) => payload.media.push(m),
                    Record::Meta(_) => {}
                }
            }
        }

        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM messages WHERE unread = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![true], |row| row.get::<_, String>(0))?;
        for id in rows {
            payload.unread.push(id?);
        }

        tracing::info!(records = payload.len(), "exported backup payload");
        Ok(payload)
    }
}
