//! Connection lifecycle of one peer session.

use std::fmt;

use bazaar_shared::protocol::WireMessage;
use bazaar_shared::PeerId;

use crate::error::{SyncError, SyncResult};
use crate::transport::Transport;

/// Lifecycle of a peer session.
///
/// ```text
/// Disconnected -> Connecting -> Handshaking -> Syncing -> Idle -> Disconnected
///                                                ^         |
///                                                +---------+
/// ```
///
/// Any state may drop to `Disconnected`, which is terminal for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Syncing,
    Idle,
}

impl SessionState {
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Handshaking)
                | (Handshaking, Syncing)
                | (Syncing, Idle)
                | (Idle, Syncing)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Syncing => "syncing",
            SessionState::Idle => "idle",
        };
        f.write_str(name)
    }
}

/// A transport plus the state machine guarding its use.
pub struct Session<T: Transport> {
    transport: T,
    state: SessionState,
    /// The remote side, once the handshake told us.
    peer: Option<PeerId>,
    closed: bool,
}

impl<T: Transport> Session<T> {
    /// Wrap an established transport. The session starts in `Connecting`.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: SessionState::Connecting,
            peer: None,
            closed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> Option<&PeerId> {
        self.peer.as_ref()
    }

    pub fn set_peer(&mut self, peer: PeerId) {
        self.peer = Some(peer);
    }

    /// Move to `next`, refusing edges the lifecycle does not have.
    pub fn transition(&mut self, next: SessionState) -> SyncResult<()> {
        if self.state == SessionState::Disconnected && self.closed {
            return Err(SyncError::Network("session is closed".into()));
        }
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidStateTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(from = %self.state, to = %next, "session state");
        self.state = next;
        Ok(())
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.closed {
            Err(SyncError::Network("session is closed".into()))
        } else {
            Ok(())
        }
    }

    pub async fn send(&mut self, msg: WireMessage) -> SyncResult<()> {
        self.ensure_open()?;
        tracing::trace!(frame = msg.name(), "send");
        match self.transport.send(msg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Next frame. A closed transport is a network error here; use
    /// [`Session::recv_opt`] where a clean close is expected.
    pub async fn recv(&mut self) -> SyncResult<WireMessage> {
        self.recv_opt()
            .await?
            .ok_or_else(|| SyncError::Network("peer closed the connection".into()))
    }

    /// Next frame, or `None` when the peer closed cleanly.
    pub async fn recv_opt(&mut self) -> SyncResult<Option<WireMessage>> {
        self.ensure_open()?;
        match self.transport.recv().await {
            Ok(Some(msg)) => {
                tracing::trace!(frame = msg.name(), "recv");
                Ok(Some(msg))
            }
            Ok(None) => {
                self.fail();
                Ok(None)
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Send `msg` and wait for the reply.
    pub async fn request(&mut self, msg: WireMessage) -> SyncResult<WireMessage> {
        self.send(msg).await?;
        self.recv().await
    }

    fn fail(&mut self) {
        self.state = SessionState::Disconnected;
        self.closed = true;
    }

    /// Close the transport. Idempotent.
    pub async fn close(&mut self) {
        if !self.closed {
            self.transport.close().await;
        }
        self.fail();
    }
}
