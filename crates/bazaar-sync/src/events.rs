//! Change fan-out to local contexts (UI tabs, background workers).
//!
//! Events only say that something changed. Subscribers re-read the store;
//! a lagging subscriber that missed events should re-read everything.

use bazaar_shared::{EntityKind, PeerId};
use tokio::sync::broadcast;

/// Where a batch of writes came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Peer(PeerId),
    Import,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: EntityKind,
    pub ids: Vec<String>,
    pub origin: ChangeOrigin,
}

#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    /// Broadcast changed ids grouped by kind. Empty groups are skipped.
    /// Returns the number of events sent.
    pub fn notify<I>(&self, changes: I, origin: ChangeOrigin) -> usize
    where
        I: IntoIterator<Item = (EntityKind, Vec<String>)>,
    {
        let mut sent = 0;
        for (kind, ids) in changes {
            if ids.is_empty() {
                continue;
            }
            let event = ChangeEvent {
                kind,
                ids,
                origin: origin.clone(),
            };
            // No receivers is fine: nobody is looking.
            if self.tx.send(event).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
