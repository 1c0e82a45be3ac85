//! Per-peer sync checkpoints, persisted as `checkpoint:<peer>` meta entries.

use bazaar_shared::constants::META_CHECKPOINT_PREFIX;
use bazaar_shared::{now_millis, Checkpoint, MetaEntry, PeerId};

use crate::database::Database;
use crate::error::{Result, StoreError};

fn meta_key(peer: &PeerId) -> String {
    format!("{META_CHECKPOINT_PREFIX}{peer}")
}

impl Database {
    /// Stored checkpoint for `peer`, or an empty one.
    pub fn load_checkpoint(&self, peer: &PeerId) -> Result<Checkpoint> {
        match self.get_meta(&meta_key(peer))? {
            Some(entry) => Ok(serde_json::from_str(&entry.value)?),
            None => Ok(Checkpoint::empty(peer.clone())),
        }
    }

    /// Persist `checkpoint`. Refuses to lower any per-kind mark already
    /// stored for the same peer.
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let previous = self.load_checkpoint(&checkpoint.peer)?;
        if let Some((kind, _)) = previous
            .last_seen
            .iter()
            .find(|(kind, ts)| checkpoint.get(**kind) < **ts)
        {
            return Err(StoreError::CheckpointRegression {
                peer: checkpoint.peer.clone(),
                kind: *kind,
            });
        }

        self.put_meta(MetaEntry {
            key: meta_key(&checkpoint.peer),
            value: serde_json::to_string(checkpoint)?,
            updated: now_millis(),
        })?;

        tracing::debug!(peer = %checkpoint.peer, marks = ?checkpoint.last_seen, "checkpoint saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_shared::EntityKind;

    #[test]
    fn missing_checkpoint_is_empty() {
        let db = Database::open_in_memory().unwrap();
        let cp = db.load_checkpoint(&PeerId::new("tablet")).unwrap();
        assert_eq!(cp.get(EntityKind::Booking), 0);
    }

    #[test]
    fn save_and_load() {
        let db = Database::open_in_memory().unwrap();
        let mut cp = Checkpoint::empty(PeerId::new("tablet"));
        cp.advance(EntityKind::Booking, 200);
        cp.advance(EntityKind::Listing, 90);
        db.save_checkpoint(&cp).unwrap();

        assert_eq!(db.load_checkpoint(&PeerId::new("tablet")).unwrap(), cp);
        assert_eq!(
            db.load_checkpoint(&PeerId::new("phone")).unwrap().get(EntityKind::Booking),
            0
        );
    }

    #[test]
    fn never_regresses() {
        let db = Database::open_in_memory().unwrap();
        let peer = PeerId::new("tablet");
        let mut cp = Checkpoint::empty(peer.clone());
        cp.advance(EntityKind::Booking, 200);
        db.save_checkpoint(&cp).unwrap();

        let mut older = Checkpoint::empty(peer.clone());
        older.advance(EntityKind::Booking, 150);
        older.advance(EntityKind::Listing, 999);
        assert!(matches!(
            db.save_checkpoint(&older),
            Err(StoreError::CheckpointRegression {
                kind: EntityKind::Booking,
                ..
            })
        ));
        assert_eq!(db.load_checkpoint(&peer).unwrap(), cp);

        cp.advance(EntityKind::Booking, 300);
        db.save_checkpoint(&cp).unwrap();
        assert_eq!(db.load_checkpoint(&peer).unwrap().get(EntityKind::Booking), 300);
    }
}
