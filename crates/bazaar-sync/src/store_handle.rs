//! Shared async access to the local store.
//!
//! `Database` is synchronous; every call here hops onto a blocking thread
//! and takes the store lock for the duration of one closure. Each remote
//! record is read, merged and written inside its own `BEGIN IMMEDIATE`
//! transaction, so concurrent sessions always merge against the row as it
//! is stored right now.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bazaar_shared::protocol::ManifestEntry;
use bazaar_shared::{Checkpoint, EntityKind, PeerId, Record};
use bazaar_store::scan::DEFAULT_PAGE_SIZE;
use bazaar_store::{ContentStore, Database, DbBackend};
use tracing::{debug, warn};

use crate::error::{MergeError, SyncError, SyncResult};
use crate::merge::{check_local_write, merge, MergeContext, MergeOutcome};

/// Tally of one batch of remote records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: u32,
    pub rejected: u32,
    pub conflicts: u32,
    /// Ids whose stored version changed, by kind.
    pub changed: BTreeMap<EntityKind, Vec<String>>,
    /// Ids the merge engine refused, by kind.
    pub failed: BTreeMap<EntityKind, Vec<String>>,
}

impl ApplyReport {
    pub fn absorb(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.rejected += other.rejected;
        self.conflicts += other.conflicts;
        for (kind, ids) in other.changed {
            self.changed.entry(kind).or_default().extend(ids);
        }
        for (kind, ids) in other.failed {
            self.failed.entry(kind).or_default().extend(ids);
        }
    }

    pub fn changed_count(&self) -> usize {
        self.changed.values().map(Vec::len).sum()
    }
}

#[derive(Clone)]
pub struct StoreHandle {
    db: Arc<Mutex<Database>>,
    content: ContentStore,
}

impl StoreHandle {
    pub fn new(db: Database, content: ContentStore) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            content,
        }
    }

    /// Throwaway store: in-memory records and in-memory blobs.
    pub fn in_memory() -> SyncResult<Self> {
        let db = Database::open_in_memory()?;
        let blobs = Database::open_in_memory()?;
        Ok(Self::new(db, Arc::new(DbBackend::new(blobs))))
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    /// Run `f` against the database on a blocking thread.
    pub async fn with_db<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> SyncResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| SyncError::TaskFailed("store lock poisoned".into()))?;
            f(&*guard)
        })
        .await?
    }

    pub async fn get(&self, kind: EntityKind, id: impl Into<String>) -> SyncResult<Option<Record>> {
        let id = id.into();
        self.with_db(move |db| Ok(db.get(kind, &id)?)).await
    }

    pub async fn load_checkpoint(&self, peer: PeerId) -> SyncResult<Checkpoint> {
        self.with_db(move |db| Ok(db.load_checkpoint(&peer)?)).await
    }

    /// Raise the stored checkpoint for `peer` to at least `marks`, never
    /// lowering a kind another session already moved further.
    pub async fn advance_checkpoint(
        &self,
        peer: PeerId,
        marks: BTreeMap<EntityKind, i64>,
    ) -> SyncResult<Checkpoint> {
        self.with_db(move |db| {
            let checkpoint = db.transaction(|db| {
                let mut checkpoint = db.load_checkpoint(&peer)?;
                for (kind, seq) in &marks {
                    checkpoint.advance(*kind, *seq);
                }
                db.save_checkpoint(&checkpoint)?;
                Ok(checkpoint)
            })?;
            Ok(checkpoint)
        })
        .await
    }

    /// Summary of every synced record stored after `after[kind]` in this
    /// device's ingest log.
    pub async fn manifest(&self, after: BTreeMap<EntityKind, i64>) -> SyncResult<Vec<ManifestEntry>> {
        self.with_db(move |db| {
            let mut entries = Vec::new();
            for kind in EntityKind::SYNCED {
                let mut from = after.get(&kind).copied().unwrap_or(0);
                loop {
                    let page = db.changes_after(kind, from, DEFAULT_PAGE_SIZE)?;
                    let Some((last, _)) = page.last() else {
                        break;
                    };
                    from = *last;
                    for (seq, record) in page {
                        entries.push(ManifestEntry {
                            kind,
                            id: record.id().to_string(),
                            updated: record.updated(),
                            digest: record.digest()?,
                            seq,
                        });
                    }
                }
            }
            Ok(entries)
        })
        .await
    }

    /// Stored records of `kind` among `ids`. Unknown ids are skipped.
    pub async fn get_many(&self, kind: EntityKind, ids: Vec<String>) -> SyncResult<Vec<Record>> {
        self.with_db(move |db| {
            let mut out = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(record) = db.get(kind, id)? {
                    out.push(record);
                }
            }
            Ok(out)
        })
        .await
    }

    /// Merge remote records one at a time, each in its own transaction.
    ///
    /// Records the merge engine refuses are skipped and counted; a store
    /// failure aborts the batch, leaving earlier records applied.
    pub async fn apply_remote(&self, records: Vec<Record>, peer: Option<PeerId>) -> SyncResult<ApplyReport> {
        self.with_db(move |db| {
            let mut report = ApplyReport::default();
            for record in records {
                let kind = record.kind();
                let id = record.id().to_string();

                match apply_one(db, record, peer.as_ref())? {
                    Ok(outcome) => {
                        report.applied += 1;
                        if outcome.changed {
                            report.changed.entry(kind).or_default().push(id);
                        }
                        if outcome.conflict.is_some() {
                            report.conflicts += 1;
                        }
                    }
                    Err(e) => {
                        report.rejected += 1;
                        warn!(%kind, %id, error = %e, "remote record rejected");
                        report.failed.entry(kind).or_default().push(id);
                    }
                }
            }
            debug!(
                applied = report.applied,
                rejected = report.rejected,
                conflicts = report.conflicts,
                "batch applied"
            );
            Ok(report)
        })
        .await
    }

    /// Write a record produced on this device.
    pub async fn put_local(&self, record: Record) -> SyncResult<()> {
        self.with_db(move |db| {
            db.transaction(|db| {
                if db.has_open_conflict(record.kind(), record.id())? {
                    return Ok(Err(SyncError::ConflictUnresolved {
                        kind: record.kind(),
                        id: record.id().to_string(),
                    }));
                }
                if record.kind() == EntityKind::Booking {
                    let current = db.get(record.kind(), record.id())?;
                    if let Err(e) = check_local_write(current.as_ref(), &record) {
                        return Ok(Err(e.into()));
                    }
                }
                db.put(&record)?;
                Ok(Ok(()))
            })?
        })
        .await
    }

    pub async fn has_blob(&self, id: String) -> SyncResult<bool> {
        let content = Arc::clone(&self.content);
        tokio::task::spawn_blocking(move || -> SyncResult<bool> { Ok(content.contains(&id)?) }).await?
    }

    pub async fn get_blob(&self, id: String) -> SyncResult<Vec<u8>> {
        let content = Arc::clone(&self.content);
        tokio::task::spawn_blocking(move || -> SyncResult<Vec<u8>> { Ok(content.get(&id)?) }).await?
    }

    pub async fn put_blob(&self, bytes: Vec<u8>) -> SyncResult<String> {
        let content = Arc::clone(&self.content);
        tokio::task::spawn_blocking(move || -> SyncResult<String> { Ok(content.put(&bytes)?) }).await?
    }
}

/// Host key for booking signatures, looked up from the stored user.
fn merge_context(db: &Database, record: &Record) -> bazaar_store::Result<MergeContext> {
    let host_public_key = match record {
        Record::Booking(b) => match db.get(EntityKind::User, &b.host)? {
            Some(Record::User(u)) => u.public_key,
            _ => None,
        },
        _ => None,
    };
    Ok(MergeContext { host_public_key })
}

/// Read-merge-write for one record. The outer error aborts the batch, the
/// inner one rejects only this record.
fn apply_one(
    db: &Database,
    record: Record,
    peer: Option<&PeerId>,
) -> SyncResult<Result<MergeOutcome, MergeError>> {
    let outcome = db.transaction(|db| {
        let local = db.get(record.kind(), record.id())?;
        let ctx = merge_context(db, &record)?;

        let outcome = match merge(local.as_ref(), record, &ctx) {
            Ok(outcome) => outcome,
            Err(e) => return Ok(Err(e)),
        };

        if outcome.changed {
            db.put(&outcome.accepted)?;
        }
        if let Some(conflict) = &outcome.conflict {
            if db.has_open_conflict(conflict.kind, &conflict.entity_id)? {
                debug!(kind = %conflict.kind, id = %conflict.entity_id, "conflict already open");
            } else {
                db.append_conflict(conflict, peer)?;
            }
        }
        Ok(Ok(outcome))
    })?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_shared::{content_id, Booking, BookingStatus, ConflictReason, Message, User};

    fn booking(status: BookingStatus, updated: i64) -> Booking {
        let mut b = Booking::request(
            "b1", "l1", "hana", "omar", "2025-06-01", "2025-06-04", 36_000, "EUR", 100,
        )
        .unwrap();
        if status != BookingStatus::Requested {
            b.transition(status, updated).unwrap();
        }
        b
    }

    #[tokio::test]
    async fn apply_counts_and_records_changes() {
        let store = StoreHandle::in_memory().unwrap();
        let report = store
            .apply_remote(
                vec![
                    Record::User(User::new("hana", 5)),
                    Record::Booking(booking(BookingStatus::Requested, 100)),
                ],
                Some(PeerId::new("phone")),
            )
            .await
            .unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(report.changed_count(), 2);
        assert_eq!(report.changed[&EntityKind::Booking], vec!["b1".to_string()]);
    }

    #[tokio::test]
    async fn tampered_record_rejected_local_kept() {
        let store = StoreHandle::in_memory().unwrap();
        let original = Record::Booking(booking(BookingStatus::Requested, 100));
        store.put_local(original.clone()).await.unwrap();

        let mut forged = booking(BookingStatus::Confirmed, 200);
        forged.total_price = 1;
        let report = store
            .apply_remote(vec![Record::Booking(forged)], None)
            .await
            .unwrap();

        assert_eq!(report.rejected, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(report.failed[&EntityKind::Booking], vec!["b1".to_string()]);
        assert_eq!(store.get(EntityKind::Booking, "b1").await.unwrap(), Some(original));
    }

    #[tokio::test]
    async fn conflicts_logged_once_and_block_local_writes() {
        let store = StoreHandle::in_memory().unwrap();
        let declined = Record::Booking(booking(BookingStatus::Declined, 200));
        store.put_local(declined.clone()).await.unwrap();

        let confirmed = Record::Booking(booking(BookingStatus::Confirmed, 300));
        for _ in 0..2 {
            let report = store
                .apply_remote(vec![confirmed.clone()], Some(PeerId::new("phone")))
                .await
                .unwrap();
            assert_eq!(report.conflicts, 1);
            assert!(report.changed.is_empty());
        }

        let open = store.with_db(|db| Ok(db.list_conflicts(false)?)).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].conflict.reason, ConflictReason::TerminalState);

        assert!(matches!(
            store.put_local(declined).await,
            Err(SyncError::ConflictUnresolved { .. })
        ));
    }

    #[tokio::test]
    async fn local_booking_writes_checked() {
        let store = StoreHandle::in_memory().unwrap();
        let declined = Record::Booking(booking(BookingStatus::Declined, 200));
        store.put_local(declined.clone()).await.unwrap();

        let mut reopened = booking(BookingStatus::Requested, 100);
        reopened.updated = 300;
        reopened.seal().unwrap();
        assert!(matches!(
            store.put_local(Record::Booking(reopened)).await,
            Err(SyncError::Validation(_))
        ));

        let mut edited = booking(BookingStatus::Declined, 200);
        edited.total_price = 5;
        assert!(matches!(
            store.put_local(Record::Booking(edited)).await,
            Err(SyncError::TamperDetected { .. })
        ));
        assert_eq!(store.get(EntityKind::Booking, "b1").await.unwrap(), Some(declined));
    }

    #[tokio::test]
    async fn new_messages_arrive_unread() {
        let store = StoreHandle::in_memory().unwrap();
        let msg = Message {
            id: "m1".into(),
            from: "omar".into(),
            to: "hana".into(),
            body: "Is the flat free in June?".into(),
            message_type: "text".into(),
            ref_id: None,
            unread: false,
            created: 10,
        };
        store
            .apply_remote(vec![Record::Message(msg.clone()), Record::Message(msg)], None)
            .await
            .unwrap();

        let unread = store.with_db(|db| Ok(db.list_unread("hana")?)).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert!(unread[0].unread);
    }

    #[tokio::test]
    async fn manifest_lists_writes_after_position() {
        let store = StoreHandle::in_memory().unwrap();
        store.put_local(Record::User(User::new("first", 50))).await.unwrap();
        store.put_local(Record::User(User::new("second", 10))).await.unwrap();

        let all = store.manifest(BTreeMap::new()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].seq < all[1].seq);

        let after = BTreeMap::from([(EntityKind::User, all[0].seq)]);
        let recent = store.manifest(after).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "second");
        assert_eq!(recent[0].updated, 10);
    }

    #[tokio::test]
    async fn checkpoint_only_moves_forward() {
        let store = StoreHandle::in_memory().unwrap();
        let peer = PeerId::new("phone");

        store
            .advance_checkpoint(peer.clone(), BTreeMap::from([(EntityKind::Booking, 300)]))
            .await
            .unwrap();
        let cp = store
            .advance_checkpoint(
                peer.clone(),
                BTreeMap::from([(EntityKind::Booking, 100), (EntityKind::User, 40)]),
            )
            .await
            .unwrap();

        assert_eq!(cp.get(EntityKind::Booking), 300);
        assert_eq!(cp.get(EntityKind::User), 40);
        assert_eq!(store.load_checkpoint(peer).await.unwrap(), cp);
    }

    #[tokio::test]
    async fn blobs_round_trip() {
        let store = StoreHandle::in_memory().unwrap();
        let id = store.put_blob(b"png".to_vec()).await.unwrap();
        assert_eq!(id, content_id(b"png"));
        assert!(store.has_blob(id.clone()).await.unwrap());
        assert_eq!(store.get_blob(id).await.unwrap(), b"png");
    }
}
