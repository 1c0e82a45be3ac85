//! Sync cycles between this device and one peer.
//!
//! The initiator drives a cycle: `Hello`, `Manifest`, then `Fetch` for what
//! it lacks, `FetchMedia` for missing bytes, `Push`/`PushMedia` for what the
//! peer lacks, and finally `Done`. The responder ([`SyncEngine::serve`])
//! answers each request in turn. Every record either side receives goes
//! through the merge engine in its own store transaction, and the per-peer
//! checkpoint only moves once `Done` has been acknowledged.
//!
//! A checkpoint is a read position in the peer's ingest log: each side lists
//! what it stored after the position the other side sent in `Hello`, so a
//! record relayed through a third device is offered again however old its
//! own timestamp is. Entries that did not arrive intact hold the position
//! back so the next cycle offers them again.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bazaar_shared::constants::{MAX_MEDIA_SIZE, MEDIA_CHUNK_SIZE, PROTOCOL_VERSION};
use bazaar_shared::crypto::KeyDerivation;
use bazaar_shared::protocol::{
    Done, ErrorFrame, Fetch, FetchMedia, Hello, Manifest, ManifestEntry, MediaChunk, Push,
    PushAck, RecordBatch, WireMessage,
};
use bazaar_shared::{content_id, Checkpoint, EntityKind, PeerId, ProtocolError, Record};
use bazaar_store::StoredConflict;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{ChangeEvent, ChangeNotifier, ChangeOrigin};
use crate::rate_limit::PeerRateLimiter;
use crate::retry::retry;
use crate::session::{Session, SessionState};
use crate::store_handle::{ApplyReport, StoreHandle};
use crate::transport::Transport;

/// Rate limiter buckets idle for this long are dropped after a cycle.
const STALE_BUCKET_AGE: Duration = Duration::from_secs(600);

/// What one cycle (or one served session) did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub peer: PeerId,
    /// Remote records merged locally.
    pub pulled: u32,
    /// Local records the peer merged.
    pub pushed: u32,
    pub conflicts: u32,
    pub rejected: u32,
    pub media_transferred: u32,
    /// Local ids whose stored version changed.
    pub changed: BTreeMap<EntityKind, Vec<String>>,
}

impl CycleReport {
    fn new(peer: PeerId) -> Self {
        Self {
            peer,
            pulled: 0,
            pushed: 0,
            conflicts: 0,
            rejected: 0,
            media_transferred: 0,
            changed: BTreeMap::new(),
        }
    }

    fn absorb_applied(&mut self, applied: ApplyReport) {
        self.pulled += applied.applied;
        self.rejected += applied.rejected;
        self.conflicts += applied.conflicts;
        for (kind, ids) in applied.changed {
            self.changed.entry(kind).or_default().extend(ids);
        }
    }

    fn absorb_ack(&mut self, ack: &PushAck) {
        self.pushed += ack.applied;
        self.rejected += ack.rejected;
        self.conflicts += ack.conflicts;
    }

    fn absorb(&mut self, other: CycleReport) {
        self.pulled += other.pulled;
        self.pushed += other.pushed;
        self.conflicts += other.conflicts;
        self.rejected += other.rejected;
        self.media_transferred += other.media_transferred;
        for (kind, ids) in other.changed {
            self.changed.entry(kind).or_default().extend(ids);
        }
    }

    pub fn changed_ids(&self, kind: EntityKind) -> &[String] {
        self.changed.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// A sync session running on its own task.
pub struct SessionHandle {
    peer: PeerId,
    task: JoinHandle<SyncResult<CycleReport>>,
}

impl SessionHandle {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Abort the session at its next suspension point. Records already
    /// committed stay; the checkpoint is not advanced.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> SyncResult<CycleReport> {
        self.task.await?
    }
}

/// Ids to move in each direction, grouped by kind in dependency order.
#[derive(Debug, Default, PartialEq, Eq)]
struct ManifestDiff {
    inbound: BTreeMap<EntityKind, Vec<String>>,
    outbound: BTreeMap<EntityKind, Vec<String>>,
}

impl ManifestDiff {
    fn compute(local: &[ManifestEntry], remote: &[ManifestEntry]) -> Self {
        Self {
            inbound: newer_in(remote, local),
            outbound: newer_in(local, remote),
        }
    }

    fn len(side: &BTreeMap<EntityKind, Vec<String>>) -> usize {
        side.values().map(Vec::len).sum()
    }
}

/// Entries of `from` that `to` lacks, holds older, or holds with different
/// content at the same timestamp.
fn newer_in(from: &[ManifestEntry], to: &[ManifestEntry]) -> BTreeMap<EntityKind, Vec<String>> {
    let known: HashMap<(EntityKind, &str), &ManifestEntry> =
        to.iter().map(|e| ((e.kind, e.id.as_str()), e)).collect();

    let mut out: BTreeMap<EntityKind, Vec<String>> = BTreeMap::new();
    for entry in from {
        let wanted = match known.get(&(entry.kind, entry.id.as_str())) {
            None => true,
            Some(held) => {
                held.updated < entry.updated
                    || (held.updated == entry.updated && held.digest != entry.digest)
            }
        };
        if wanted {
            out.entry(entry.kind).or_default().push(entry.id.clone());
        }
    }
    out
}

/// Where to start listing this device's log for a peer that has read it up
/// to `theirs`.
fn unread_by(theirs: &Checkpoint) -> BTreeMap<EntityKind, i64> {
    EntityKind::SYNCED
        .into_iter()
        .map(|kind| (kind, theirs.get(kind)))
        .collect()
}

/// Read positions in the peer's log once `remote` has been processed. A kind
/// moves to its highest listed seq, or to just before its first entry in
/// `failed`.
fn read_positions(
    remote: &[ManifestEntry],
    failed: &BTreeMap<EntityKind, Vec<String>>,
) -> BTreeMap<EntityKind, i64> {
    let mut highest: BTreeMap<EntityKind, i64> = BTreeMap::new();
    let mut held: BTreeMap<EntityKind, i64> = BTreeMap::new();
    for entry in remote {
        let mark = highest.entry(entry.kind).or_insert(entry.seq);
        *mark = (*mark).max(entry.seq);
        if failed.get(&entry.kind).is_some_and(|ids| ids.contains(&entry.id)) {
            let cap = held.entry(entry.kind).or_insert(entry.seq - 1);
            *cap = (*cap).min(entry.seq - 1);
        }
    }
    for (kind, cap) in held {
        highest.insert(kind, cap);
    }
    highest
}

fn check_hello(hello: &Hello, expected_peer: Option<&PeerId>) -> SyncResult<()> {
    if hello.protocol != PROTOCOL_VERSION {
        return Err(ProtocolError::Unexpected {
            expected: PROTOCOL_VERSION,
            got: hello.protocol.clone(),
        }
        .into());
    }
    if let Some(expected) = expected_peer {
        if &hello.peer != expected {
            return Err(ProtocolError::Unexpected {
                expected: "Hello from the dialed peer",
                got: hello.peer.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

fn merge_ids(into: &mut BTreeMap<EntityKind, Vec<String>>, extra: BTreeMap<EntityKind, Vec<String>>) {
    for (kind, ids) in extra {
        let list = into.entry(kind).or_default();
        for id in ids {
            if !list.contains(&id) {
                list.push(id);
            }
        }
    }
}

/// Responder state for one round, from `Manifest` to `Done`.
struct ServedRound {
    remote_entries: Vec<ManifestEntry>,
    report: CycleReport,
    uploads: HashMap<String, Vec<u8>>,
    failed: BTreeMap<EntityKind, Vec<String>>,
}

/// Runs sync cycles for this device. Cheap to clone; clones share the
/// store, limiter and change channel.
#[derive(Clone)]
pub struct SyncEngine {
    local: PeerId,
    store: StoreHandle,
    config: SyncConfig,
    limiter: PeerRateLimiter,
    notifier: ChangeNotifier,
    pub(crate) kdf: Arc<OnceLock<Arc<dyn KeyDerivation>>>,
}

impl SyncEngine {
    pub fn new(local: PeerId, store: StoreHandle, config: SyncConfig) -> Self {
        Self {
            limiter: PeerRateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            notifier: ChangeNotifier::new(config.notify_capacity),
            local,
            store,
            config,
            kdf: Arc::new(OnceLock::new()),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ChangeEvent> {
        self.notifier.subscribe()
    }

    // -- local writes -------------------------------------------------------

    /// Store a record created or edited on this device and tell local
    /// subscribers. Refused while the entity has an open conflict.
    pub async fn put_local(&self, record: Record) -> SyncResult<()> {
        let kind = record.kind();
        let id = record.id().to_string();
        self.store.put_local(record).await?;
        self.notifier.notify([(kind, vec![id])], ChangeOrigin::Local);
        Ok(())
    }

    pub async fn mark_read(&self, message_id: impl Into<String>) -> SyncResult<()> {
        let id = message_id.into();
        let notify_id = id.clone();
        self.store
            .with_db(move |db| Ok(db.set_unread(&id, false)?))
            .await?;
        self.notifier
            .notify([(EntityKind::Message, vec![notify_id])], ChangeOrigin::Local);
        Ok(())
    }

    pub async fn conflicts(&self, include_resolved: bool) -> SyncResult<Vec<StoredConflict>> {
        self.store
            .with_db(move |db| Ok(db.list_conflicts(include_resolved)?))
            .await
    }

    /// Close a logged conflict, optionally storing the chosen version.
    pub async fn resolve_conflict(&self, conflict_id: i64, winner: Option<Record>) -> SyncResult<()> {
        let changed = winner.as_ref().map(|r| (r.kind(), vec![r.id().to_string()]));
        self.store
            .with_db(move |db| Ok(db.resolve_conflict(conflict_id, winner.as_ref())?))
            .await?;
        info!(conflict_id, "conflict resolved");
        self.notifier.notify(changed, ChangeOrigin::Local);
        Ok(())
    }

    // -- initiator ----------------------------------------------------------

    /// One cycle with `peer`, reconnecting through `connect` and retrying
    /// with backoff while failures are network errors.
    pub async fn sync_with<C, Fut, T>(&self, peer: PeerId, mut connect: C) -> SyncResult<CycleReport>
    where
        C: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
        T: Transport,
    {
        let retry_config = self.config.retry_config();
        let result = retry("sync", &retry_config, || {
            let connecting = connect();
            let peer = peer.clone();
            async move {
                let transport = connecting.await?;
                self.sync_once(&peer, transport).await
            }
        })
        .await;

        self.limiter.purge_stale(STALE_BUCKET_AGE).await;

        match &result {
            Ok(report) => info!(
                peer = %peer.short(),
                pulled = report.pulled,
                pushed = report.pushed,
                conflicts = report.conflicts,
                rejected = report.rejected,
                media = report.media_transferred,
                "sync cycle complete"
            ),
            Err(e) => error!(peer = %peer.short(), error = %e, "sync cycle abandoned"),
        }
        result
    }

    /// [`SyncEngine::sync_with`] on its own task.
    pub fn spawn_sync<C, Fut, T>(&self, peer: PeerId, connect: C) -> SessionHandle
    where
        C: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
        T: Transport + 'static,
    {
        let engine = self.clone();
        let task_peer = peer.clone();
        let task = tokio::spawn(async move { engine.sync_with(task_peer, connect).await });
        SessionHandle { peer, task }
    }

    /// A single attempt over an established transport, no retry.
    pub async fn sync_once<T: Transport>(&self, peer: &PeerId, transport: T) -> SyncResult<CycleReport> {
        let mut session = Session::new(transport);
        let result = self.drive(&mut session, peer).await;
        if let Err(e) = &result {
            warn!(peer = %peer.short(), error = %e, "sync attempt failed");
            report_error(&mut session, e).await;
        }
        session.close().await;
        result
    }

    async fn drive<T: Transport>(&self, session: &mut Session<T>, peer: &PeerId) -> SyncResult<CycleReport> {
        session.transition(SessionState::Handshaking)?;
        let mine = self.store.load_checkpoint(peer.clone()).await?;

        let hello = WireMessage::Hello(Hello {
            peer: self.local.clone(),
            protocol: PROTOCOL_VERSION.to_string(),
            checkpoint: mine.clone(),
        });
        let theirs = match session.request(hello).await? {
            WireMessage::Hello(reply) => {
                check_hello(&reply, Some(peer))?;
                reply.checkpoint
            }
            other => return Err(other.unexpected("Hello").into()),
        };
        session.set_peer(peer.clone());
        session.transition(SessionState::Syncing)?;

        let after = unread_by(&theirs);
        debug!(peer = %peer.short(), read = ?mine.last_seen, ?after, "checkpoints exchanged");

        let report = self.run_round(session, peer, mine, after).await?;
        session.transition(SessionState::Idle)?;
        Ok(report)
    }

    async fn run_round<T: Transport>(
        &self,
        session: &mut Session<T>,
        peer: &PeerId,
        mine: Checkpoint,
        after: BTreeMap<EntityKind, i64>,
    ) -> SyncResult<CycleReport> {
        let mut report = CycleReport::new(peer.clone());
        let mut failed: BTreeMap<EntityKind, Vec<String>> = BTreeMap::new();

        let local_entries = self.store.manifest(after).await?;
        let manifest = WireMessage::Manifest(Manifest {
            entries: local_entries.clone(),
        });
        let remote_entries = match session.request(manifest).await? {
            WireMessage::Manifest(m) => m.entries,
            other => return Err(other.unexpected("Manifest").into()),
        };

        let diff = ManifestDiff::compute(&local_entries, &remote_entries);
        info!(
            peer = %peer.short(),
            local = local_entries.len(),
            remote = remote_entries.len(),
            inbound = ManifestDiff::len(&diff.inbound),
            outbound = ManifestDiff::len(&diff.outbound),
            "manifests exchanged"
        );

        // Pull
        for (kind, ids) in &diff.inbound {
            for chunk in ids.chunks(self.config.chunk_size.max(1)) {
                let mut applied = self.pull(session, peer, *kind, chunk.to_vec()).await?;
                merge_ids(&mut failed, std::mem::take(&mut applied.failed));
                report.absorb_applied(applied);
            }
        }

        // Merged results that differ from the peer's copy go back to it.
        let mut outbound = diff.outbound;
        let merged_back = self.diverged(&report.changed, &remote_entries).await?;
        merge_ids(&mut outbound, merged_back);

        for entry in remote_entries.iter().filter(|e| e.kind == EntityKind::Media) {
            if self.store.has_blob(entry.id.clone()).await? {
                continue;
            }
            let fetched = self.store.get(EntityKind::Media, entry.id.clone()).await?.is_some()
                && self.fetch_media(session, &entry.id).await?;
            if fetched {
                report.media_transferred += 1;
            } else {
                merge_ids(
                    &mut failed,
                    BTreeMap::from([(EntityKind::Media, vec![entry.id.clone()])]),
                );
            }
        }

        // Push
        for (kind, ids) in &outbound {
            for chunk in ids.chunks(self.config.chunk_size.max(1)) {
                let records = self.store.get_many(*kind, chunk.to_vec()).await?;
                if records.is_empty() {
                    continue;
                }
                for _ in &records {
                    self.limiter.acquire(peer).await;
                }
                match session.request(WireMessage::Push(Push { records })).await? {
                    WireMessage::PushAck(ack) => report.absorb_ack(&ack),
                    other => return Err(other.unexpected("PushAck").into()),
                }
            }
        }

        if let Some(media_ids) = outbound.get(&EntityKind::Media) {
            for id in media_ids {
                if self.store.has_blob(id.clone()).await? && self.push_media(session, id).await? {
                    report.media_transferred += 1;
                }
            }
        }

        // Done
        let positions = read_positions(&remote_entries, &failed);
        if !failed.is_empty() {
            debug!(peer = %peer.short(), ?failed, "holding checkpoint before failed entries");
        }
        let mut proposed = mine;
        for (kind, seq) in &positions {
            proposed.advance(*kind, *seq);
        }
        match session.request(WireMessage::Done(Done { checkpoint: proposed })).await? {
            WireMessage::DoneAck => {}
            other => return Err(other.unexpected("DoneAck").into()),
        }
        let stored = self.store.advance_checkpoint(peer.clone(), positions).await?;
        debug!(peer = %peer.short(), read = ?stored.last_seen, "checkpoint advanced");

        self.notifier
            .notify(report.changed.clone(), ChangeOrigin::Peer(peer.clone()));
        Ok(report)
    }

    /// Fetch one chunk of ids and merge each batch as it arrives.
    async fn pull<T: Transport>(
        &self,
        session: &mut Session<T>,
        peer: &PeerId,
        kind: EntityKind,
        ids: Vec<String>,
    ) -> SyncResult<ApplyReport> {
        session.send(WireMessage::Fetch(Fetch { kind, ids })).await?;

        let mut total = ApplyReport::default();
        loop {
            match session.recv().await? {
                WireMessage::Records(batch) => {
                    debug!(%kind, count = batch.records.len(), last = batch.last, "records received");
                    let applied = self.store.apply_remote(batch.records, Some(peer.clone())).await?;
                    total.absorb(applied);
                    if batch.last {
                        return Ok(total);
                    }
                }
                other => return Err(other.unexpected("Records").into()),
            }
        }
    }

    /// Changed ids whose stored digest now differs from the peer's.
    async fn diverged(
        &self,
        changed: &BTreeMap<EntityKind, Vec<String>>,
        remote: &[ManifestEntry],
    ) -> SyncResult<BTreeMap<EntityKind, Vec<String>>> {
        let theirs: HashMap<(EntityKind, &str), &str> = remote
            .iter()
            .map(|e| ((e.kind, e.id.as_str()), e.digest.as_str()))
            .collect();

        let mut out: BTreeMap<EntityKind, Vec<String>> = BTreeMap::new();
        for (kind, ids) in changed {
            for record in self.store.get_many(*kind, ids.clone()).await? {
                let digest = record.digest()?;
                if theirs
                    .get(&(*kind, record.id()))
                    .is_some_and(|d| *d != digest)
                {
                    out.entry(*kind).or_default().push(record.id().to_string());
                }
            }
        }
        Ok(out)
    }

    /// Download and verify the bytes of one media object. Returns whether
    /// they were stored.
    async fn fetch_media<T: Transport>(&self, session: &mut Session<T>, id: &str) -> SyncResult<bool> {
        session
            .send(WireMessage::FetchMedia(FetchMedia { id: id.to_string() }))
            .await?;

        let mut bytes = Vec::new();
        loop {
            match session.recv().await? {
                WireMessage::MediaChunk(chunk) if chunk.id == id => {
                    if chunk.offset != bytes.len() as u64
                        || bytes.len() + chunk.data.len() > MAX_MEDIA_SIZE
                    {
                        return Err(ProtocolError::Unexpected {
                            expected: "contiguous MediaChunk within size limit",
                            got: format!("offset {} len {}", chunk.offset, chunk.data.len()),
                        }
                        .into());
                    }
                    bytes.extend_from_slice(&chunk.data);
                    if chunk.last {
                        break;
                    }
                }
                WireMessage::MediaMissing(missing) if missing.id == id => {
                    debug!(id, "peer does not hold media bytes");
                    return Ok(false);
                }
                other => return Err(other.unexpected("MediaChunk").into()),
            }
        }

        if content_id(&bytes) != id {
            warn!(id, size = bytes.len(), "media bytes do not match their id");
            return Ok(false);
        }
        self.store.put_blob(bytes).await?;
        debug!(id, "media fetched");
        Ok(true)
    }

    /// Upload the bytes of one media object, one acknowledged chunk at a
    /// time. Returns whether the peer stored them.
    async fn push_media<T: Transport>(&self, session: &mut Session<T>, id: &str) -> SyncResult<bool> {
        let bytes = self.store.get_blob(id.to_string()).await?;
        let mut stored = false;
        for chunk in media_chunks(id, &bytes) {
            match session.request(WireMessage::PushMedia(chunk)).await? {
                WireMessage::PushAck(ack) => {
                    if ack.rejected > 0 {
                        warn!(id, "peer refused media upload");
                        return Ok(false);
                    }
                    stored = ack.applied > 0;
                }
                other => return Err(other.unexpected("PushAck").into()),
            }
        }
        Ok(stored)
    }

    // -- responder ----------------------------------------------------------

    /// Answer sync requests from whoever is on the other end of
    /// `transport` until they hang up. Several rounds may run on one
    /// session; the report covers all of them.
    pub async fn serve<T: Transport>(&self, transport: T) -> SyncResult<CycleReport> {
        let mut session = Session::new(transport);
        let result = self.respond(&mut session).await;
        match &result {
            Ok(report) => info!(
                peer = %report.peer.short(),
                pulled = report.pulled,
                conflicts = report.conflicts,
                rejected = report.rejected,
                "served sync session"
            ),
            Err(e) => {
                error!(error = %e, "sync session aborted");
                report_error(&mut session, e).await;
            }
        }
        session.close().await;
        result
    }

    async fn respond<T: Transport>(&self, session: &mut Session<T>) -> SyncResult<CycleReport> {
        session.transition(SessionState::Handshaking)?;
        let hello = match session.recv().await? {
            WireMessage::Hello(hello) => hello,
            other => return Err(other.unexpected("Hello").into()),
        };
        check_hello(&hello, None)?;
        let peer = hello.peer.clone();

        let mine = self.store.load_checkpoint(peer.clone()).await?;
        session
            .send(WireMessage::Hello(Hello {
                peer: self.local.clone(),
                protocol: PROTOCOL_VERSION.to_string(),
                checkpoint: mine,
            }))
            .await?;
        session.set_peer(peer.clone());
        info!(peer = %peer.short(), "serving sync session");

        let mut after = unread_by(&hello.checkpoint);
        let mut total = CycleReport::new(peer.clone());
        let mut round: Option<ServedRound> = None;

        loop {
            let Some(msg) = session.recv_opt().await? else {
                return match round {
                    None => Ok(total),
                    Some(_) => Err(SyncError::Network("peer closed mid-cycle".into())),
                };
            };

            let msg = match msg {
                WireMessage::Manifest(manifest) => {
                    if session.state() != SessionState::Syncing {
                        session.transition(SessionState::Syncing)?;
                    }
                    let entries = self.store.manifest(after.clone()).await?;
                    session
                        .send(WireMessage::Manifest(Manifest { entries }))
                        .await?;
                    round = Some(ServedRound {
                        remote_entries: manifest.entries,
                        report: CycleReport::new(peer.clone()),
                        uploads: HashMap::new(),
                        failed: BTreeMap::new(),
                    });
                    continue;
                }
                other => other,
            };

            let Some(current) = round.as_mut() else {
                return Err(msg.unexpected("Manifest").into());
            };

            match msg {
                WireMessage::Fetch(fetch) => self.answer_fetch(session, &peer, fetch).await?,
                WireMessage::Push(push) => {
                    let mut applied = self.store.apply_remote(push.records, Some(peer.clone())).await?;
                    merge_ids(&mut current.failed, std::mem::take(&mut applied.failed));
                    let ack = PushAck {
                        applied: applied.applied,
                        rejected: applied.rejected,
                        conflicts: applied.conflicts,
                    };
                    current.report.absorb_applied(applied);
                    session.send(WireMessage::PushAck(ack)).await?;
                }
                WireMessage::FetchMedia(request) => self.answer_media(session, request.id).await?,
                WireMessage::PushMedia(chunk) => {
                    let ack = self.receive_upload(&mut current.uploads, chunk).await?;
                    if ack.applied > 0 {
                        current.report.media_transferred += 1;
                    }
                    session.send(WireMessage::PushAck(ack)).await?;
                }
                WireMessage::Done(done) => {
                    let mut finished = round.take().ok_or_else(|| {
                        SyncError::from(ProtocolError::Unexpected {
                            expected: "Manifest",
                            got: "Done".into(),
                        })
                    })?;
                    for entry in finished.remote_entries.iter().filter(|e| e.kind == EntityKind::Media) {
                        if !self.store.has_blob(entry.id.clone()).await? {
                            merge_ids(
                                &mut finished.failed,
                                BTreeMap::from([(EntityKind::Media, vec![entry.id.clone()])]),
                            );
                        }
                    }
                    let positions = read_positions(&finished.remote_entries, &finished.failed);
                    let stored = self.store.advance_checkpoint(peer.clone(), positions).await?;
                    debug!(
                        peer = %peer.short(),
                        peer_read = ?done.checkpoint.last_seen,
                        read = ?stored.last_seen,
                        "checkpoint advanced"
                    );
                    session.send(WireMessage::DoneAck).await?;
                    session.transition(SessionState::Idle)?;

                    after = unread_by(&done.checkpoint);
                    self.notifier.notify(
                        finished.report.changed.clone(),
                        ChangeOrigin::Peer(peer.clone()),
                    );
                    total.absorb(finished.report);
                }
                other => return Err(other.unexpected("request").into()),
            }
        }
    }

    async fn answer_fetch<T: Transport>(
        &self,
        session: &mut Session<T>,
        peer: &PeerId,
        fetch: Fetch,
    ) -> SyncResult<()> {
        let records = if fetch.kind.is_synced() {
            self.store.get_many(fetch.kind, fetch.ids).await?
        } else {
            warn!(peer = %peer.short(), kind = %fetch.kind, "fetch for device-local kind refused");
            Vec::new()
        };
        for _ in &records {
            self.limiter.acquire(peer).await;
        }

        let chunk_size = self.config.chunk_size.max(1);
        if records.is_empty() {
            return session
                .send(WireMessage::Records(RecordBatch {
                    records: Vec::new(),
                    last: true,
                }))
                .await;
        }

        let batches = records.len().div_ceil(chunk_size);
        for (i, chunk) in records.chunks(chunk_size).enumerate() {
            session
                .send(WireMessage::Records(RecordBatch {
                    records: chunk.to_vec(),
                    last: i + 1 == batches,
                }))
                .await?;
        }
        Ok(())
    }

    async fn answer_media<T: Transport>(&self, session: &mut Session<T>, id: String) -> SyncResult<()> {
        let bytes = if self.store.has_blob(id.clone()).await? {
            match self.store.get_blob(id.clone()).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(id = %id, error = %e, "stored media unreadable");
                    None
                }
            }
        } else {
            None
        };

        let Some(bytes) = bytes else {
            return session
                .send(WireMessage::MediaMissing(FetchMedia { id }))
                .await;
        };
        for chunk in media_chunks(&id, &bytes) {
            session.send(WireMessage::MediaChunk(chunk)).await?;
        }
        Ok(())
    }

    async fn receive_upload(
        &self,
        uploads: &mut HashMap<String, Vec<u8>>,
        chunk: MediaChunk,
    ) -> SyncResult<PushAck> {
        let rejected = PushAck {
            rejected: 1,
            ..PushAck::default()
        };

        let buffer = uploads.entry(chunk.id.clone()).or_default();
        if chunk.offset != buffer.len() as u64 || buffer.len() + chunk.data.len() > MAX_MEDIA_SIZE {
            warn!(id = %chunk.id, offset = chunk.offset, "media upload out of order or too large");
            uploads.remove(&chunk.id);
            return Ok(rejected);
        }
        buffer.extend_from_slice(&chunk.data);
        if !chunk.last {
            return Ok(PushAck::default());
        }

        let bytes = uploads.remove(&chunk.id).unwrap_or_default();
        if content_id(&bytes) != chunk.id {
            warn!(id = %chunk.id, "uploaded media does not match its id");
            return Ok(rejected);
        }
        self.store.put_blob(bytes).await?;
        Ok(PushAck {
            applied: 1,
            ..PushAck::default()
        })
    }
}

/// Split a blob into wire chunks. The blob is never empty.
fn media_chunks(id: &str, bytes: &[u8]) -> Vec<MediaChunk> {
    let mut offset = 0usize;
    bytes
        .chunks(MEDIA_CHUNK_SIZE)
        .map(|piece| {
            let chunk = MediaChunk {
                id: id.to_string(),
                offset: offset as u64,
                data: piece.to_vec(),
                last: offset + piece.len() == bytes.len(),
            };
            offset += piece.len();
            chunk
        })
        .collect()
}

/// Tell the peer why the session is ending, if it can still hear us.
async fn report_error<T: Transport>(session: &mut Session<T>, err: &SyncError) {
    if matches!(err, SyncError::Network(_) | SyncError::Cancelled) {
        return;
    }
    let frame = WireMessage::Error(ErrorFrame {
        reason: err.to_string(),
    });
    if let Err(e) = session.send(frame).await {
        debug!(error = %e, "could not report error to peer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: EntityKind, id: &str, updated: i64, digest: &str) -> ManifestEntry {
        ManifestEntry {
            kind,
            id: id.into(),
            updated,
            digest: digest.into(),
            seq: updated,
        }
    }

    fn logged(kind: EntityKind, id: &str, seq: i64) -> ManifestEntry {
        ManifestEntry {
            seq,
            ..entry(kind, id, 1, "d")
        }
    }

    #[test]
    fn diff_moves_newer_and_missing() {
        let local = vec![
            entry(EntityKind::Booking, "b1", 100, "aa"),
            entry(EntityKind::Listing, "l1", 50, "bb"),
            entry(EntityKind::User, "hana", 10, "cc"),
        ];
        let remote = vec![
            entry(EntityKind::Booking, "b1", 200, "dd"),
            entry(EntityKind::Listing, "l1", 50, "bb"),
            entry(EntityKind::Message, "m1", 5, "ee"),
        ];

        let diff = ManifestDiff::compute(&local, &remote);
        assert_eq!(
            diff.inbound,
            BTreeMap::from([
                (EntityKind::Booking, vec!["b1".to_string()]),
                (EntityKind::Message, vec!["m1".to_string()]),
            ])
        );
        assert_eq!(
            diff.outbound,
            BTreeMap::from([(EntityKind::User, vec!["hana".to_string()])])
        );
    }

    #[test]
    fn same_timestamp_different_content_goes_both_ways() {
        let local = vec![entry(EntityKind::Listing, "l1", 50, "aa")];
        let remote = vec![entry(EntityKind::Listing, "l1", 50, "bb")];
        let diff = ManifestDiff::compute(&local, &remote);
        assert_eq!(ManifestDiff::len(&diff.inbound), 1);
        assert_eq!(ManifestDiff::len(&diff.outbound), 1);
    }

    #[test]
    fn inbound_kinds_ordered_users_first() {
        let remote = vec![
            entry(EntityKind::Booking, "b1", 1, "x"),
            entry(EntityKind::User, "hana", 1, "y"),
        ];
        let diff = ManifestDiff::compute(&[], &remote);
        let kinds: Vec<_> = diff.inbound.keys().copied().collect();
        assert_eq!(kinds, vec![EntityKind::User, EntityKind::Booking]);
    }

    #[test]
    fn listing_starts_at_peer_read_position() {
        let mut theirs = Checkpoint::empty(PeerId::new("a"));
        theirs.advance(EntityKind::Booking, 200);

        let after = unread_by(&theirs);
        assert_eq!(after[&EntityKind::Booking], 200);
        assert_eq!(after[&EntityKind::User], 0);
        assert!(!after.contains_key(&EntityKind::Meta));
    }

    #[test]
    fn positions_take_highest_seq_per_kind() {
        let positions = read_positions(
            &[
                logged(EntityKind::Booking, "b2", 41),
                logged(EntityKind::Booking, "b1", 12),
                logged(EntityKind::User, "hana", 7),
            ],
            &BTreeMap::new(),
        );
        assert_eq!(positions[&EntityKind::Booking], 41);
        assert_eq!(positions[&EntityKind::User], 7);
        assert!(!positions.contains_key(&EntityKind::Listing));
    }

    #[test]
    fn positions_stop_before_failed_entries() {
        let remote = [
            logged(EntityKind::Media, "m1", 3),
            logged(EntityKind::Media, "m2", 8),
            logged(EntityKind::Media, "m3", 11),
            logged(EntityKind::Listing, "l1", 9),
        ];
        let failed = BTreeMap::from([(
            EntityKind::Media,
            vec!["m3".to_string(), "m2".to_string()],
        )]);

        let positions = read_positions(&remote, &failed);
        assert_eq!(positions[&EntityKind::Media], 7);
        assert_eq!(positions[&EntityKind::Listing], 9);
    }

    #[test]
    fn media_chunks_cover_blob() {
        let blob = vec![7u8; MEDIA_CHUNK_SIZE * 2 + 10];
        let chunks = media_chunks("id", &blob);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].offset, MEDIA_CHUNK_SIZE as u64);
        assert!(!chunks[1].last);
        assert!(chunks[2].last);
        assert_eq!(chunks.iter().map(|c| c.data.len()).sum::<usize>(), blob.len());
    }

    #[test]
    fn hello_checks_protocol_and_peer() {
        let hello = Hello {
            peer: PeerId::new("phone"),
            protocol: PROTOCOL_VERSION.to_string(),
            checkpoint: Checkpoint::empty(PeerId::new("laptop")),
        };
        assert!(check_hello(&hello, Some(&PeerId::new("phone"))).is_ok());
        assert!(check_hello(&hello, Some(&PeerId::new("tablet"))).is_err());

        let old = Hello {
            protocol: "/bazaar-sync/0.9.0".into(),
            ..hello
        };
        assert!(matches!(
            check_hello(&old, None),
            Err(SyncError::Protocol(ProtocolError::Unexpected { .. }))
        ));
    }
}
