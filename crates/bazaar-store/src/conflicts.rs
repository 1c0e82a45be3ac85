//! Append-only log of merges that were not settled automatically.

use bazaar_shared::{now_millis, Conflict, ConflictReason, EntityKind, PeerId, Record};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};

/// A conflict as persisted, with its log metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConflict {
    pub id: i64,
    pub conflict: Conflict,
    pub peer: Option<PeerId>,
    pub detected_at: i64,
    pub resolved: bool,
}

impl Database {
    /// Record both versions of a refused merge. Returns the log id.
    pub fn append_conflict(&self, conflict: &Conflict, peer: Option<&PeerId>) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO conflicts (kind, entity_id, reason, local, remote, peer, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conflict.kind.as_str(),
                conflict.entity_id,
                conflict.reason.as_str(),
                serde_json::to_string(&conflict.local)?,
                serde_json::to_string(&conflict.remote)?,
                peer.map(PeerId::as_str),
                now_millis(),
            ],
        )?;
        let id = self.conn().last_insert_rowid();

        tracing::warn!(
            conflict_id = id,
            kind = %conflict.kind,
            entity = %conflict.entity_id,
            reason = conflict.reason.as_str(),
            "conflict recorded"
        );
        Ok(id)
    }

    /// Conflicts in detection order. Resolved ones are included on request.
    pub fn list_conflicts(&self, include_resolved: bool) -> Result<Vec<StoredConflict>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, kind, entity_id, reason, local, remote, peer, detected_at, resolved
             FROM conflicts
             WHERE resolved = 0 OR ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![include_resolved], |row| {
            Ok(RawConflict {
                id: row.get(0)?,
                kind: row.get(1)?,
                entity_id: row.get(2)?,
                reason: row.get(3)?,
                local: row.get(4)?,
                remote: row.get(5)?,
                peer: row.get(6)?,
                detected_at: row.get(7)?,
                resolved: row.get(8)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_stored()?);
        }
        Ok(out)
    }

    /// Whether an unresolved conflict exists for the entity.
    pub fn has_open_conflict(&self, kind: EntityKind, entity_id: &str) -> Result<bool> {
        let open: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM conflicts
                           WHERE kind = ?1 AND entity_id = ?2 AND resolved = 0)",
            params![kind.as_str(), entity_id],
            |row| row.get(0),
        )?;
        Ok(open)
    }

    /// Mark a conflict settled. With `winner`, the chosen version is
    /// written in the same transaction.
    pub fn resolve_conflict(&self, id: i64, winner: Option<&Record>) -> Result<()> {
        self.transaction(|db| {
            let affected = db.conn().execute(
                "UPDATE conflicts SET resolved = 1 WHERE id = ?1 AND resolved = 0",
                params![id],
            )?;
            if affected == 0 {
                return Err(StoreError::NotFound);
            }
            if let Some(record) = winner {
                db.put(record)?;
            }
            Ok(())
        })
    }
}

struct RawConflict {
    id: i64,
    kind: String,
    entity_id: String,
    reason: String,
    local: String,
    remote: String,
    peer: Option<String>,
    detected_at: i64,
    resolved: bool,
}

impl RawConflict {
    fn into_stored(self) -> Result<StoredConflict> {
        let kind = EntityKind::from_str_opt(&self.kind)
            .ok_or_else(|| StoreError::Migration(format!("unknown kind {}", self.kind)))?;
        let reason = ConflictReason::from_str_opt(&self.reason)
            .ok_or_else(|| StoreError::Migration(format!("unknown reason {}", self.reason)))?;

        Ok(StoredConflict {
            id: self.id,
            conflict: Conflict {
                kind,
                entity_id: self.entity_id,
                reason,
                local: serde_json::from_str(&self.local)?,
                remote: serde_json::from_str(&self.remote)?,
            },
            peer: self.peer.map(PeerId),
            detected_at: self.detected_at,
            resolved: self.resolved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_shared::{Booking, BookingStatus};

    fn declined_vs_confirmed() -> Conflict {
        let requested = Booking::request(
            "b1", "l1", "hana", "omar", "2025-07-01", "2025-07-03", 20_000, "EUR", 100,
        )
        .unwrap();
        let mut declined = requested.clone();
        declined.transition(BookingStatus::Declined, 200).unwrap();
        let mut confirmed = requested;
        confirmed.transition(BookingStatus::Confirmed, 150).unwrap();

        Conflict {
            kind: EntityKind::Booking,
            entity_id: "b1".into(),
            reason: ConflictReason::TerminalState,
            local: Record::Booking(declined),
            remote: Record::Booking(confirmed),
        }
    }

    #[test]
    fn append_and_list() {
        let db = Database::open_in_memory().unwrap();
        let conflict = declined_vs_confirmed();
        let id = db
            .append_conflict(&conflict, Some(&PeerId::new("tablet")))
            .unwrap();

        let listed = db.list_conflicts(false).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].conflict, conflict);
        assert_eq!(listed[0].peer, Some(PeerId::new("tablet")));
        assert!(!listed[0].resolved);
    }

    #[test]
    fn resolve_hides_from_open_list() {
        let db = Database::open_in_memory().unwrap();
        let conflict = declined_vs_confirmed();
        let id = db.append_conflict(&conflict, None).unwrap();
        assert!(db.has_open_conflict(EntityKind::Booking, "b1").unwrap());
        assert!(!db.has_open_conflict(EntityKind::Booking, "b2").unwrap());

        db.resolve_conflict(id, Some(&conflict.local)).unwrap();
        assert!(db.list_conflicts(false).unwrap().is_empty());
        assert!(!db.has_open_conflict(EntityKind::Booking, "b1").unwrap());
        assert_eq!(db.list_conflicts(true).unwrap().len(), 1);
        assert_eq!(
            db.get(EntityKind::Booking, "b1").unwrap(),
            Some(conflict.local.clone())
        );

        assert!(matches!(
            db.resolve_conflict(id, None),
            Err(StoreError::NotFound)
        ));
    }
}
