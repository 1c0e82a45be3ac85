//! Frame transports between two peers.
//!
//! A transport moves whole [`WireMessage`]s. Two backends exist: an
//! in-process duplex over tokio channels, and length-prefixed frames over
//! any byte stream (TCP, a relay socket, a pipe).

use std::future::Future;

use bazaar_shared::constants::MAX_FRAME_SIZE;
use bazaar_shared::protocol::WireMessage;
use bazaar_shared::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{SyncError, SyncResult};

pub trait Transport: Send {
    fn send(&mut self, msg: WireMessage) -> impl Future<Output = SyncResult<()>> + Send;

    /// Next frame, or `None` once the other side has closed.
    fn recv(&mut self) -> impl Future<Output = SyncResult<Option<WireMessage>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// One end of an in-process link. Frames are still bincode-encoded so the
/// wire format is exercised end to end.
pub struct ChannelTransport {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelTransport {
    /// Two connected ends, each buffering up to `capacity` frames.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            Self {
                tx: Some(a_tx),
                rx: a_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: b_rx,
            },
        )
    }
}

impl Transport for ChannelTransport {
    async fn send(&mut self, msg: WireMessage) -> SyncResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SyncError::Network("transport closed".into()))?;
        let bytes = msg.to_bytes()?;
        tx.send(bytes)
            .await
            .map_err(|_| SyncError::Network("peer hung up".into()))
    }

    async fn recv(&mut self) -> SyncResult<Option<WireMessage>> {
        match self.rx.recv().await {
            Some(bytes) => Ok(Some(WireMessage::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

// ---------------------------------------------------------------------------
// Byte streams
// ---------------------------------------------------------------------------

/// `u32` big-endian length prefix followed by the bincode frame.
pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

fn io_error(e: std::io::Error) -> SyncError {
    SyncError::Network(e.to_string())
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: WireMessage) -> SyncResult<()> {
        let bytes = msg.to_bytes()?;
        // to_bytes already enforces MAX_FRAME_SIZE, which fits in u32
        let len = bytes.len() as u32;
        self.stream.write_u32(len).await.map_err(io_error)?;
        self.stream.write_all(&bytes).await.map_err(io_error)?;
        self.stream.flush().await.map_err(io_error)
    }

    async fn recv(&mut self) -> SyncResult<Option<WireMessage>> {
        let len = match self.stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(io_error(e)),
        };
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await.map_err(io_error)?;
        Ok(Some(WireMessage::from_bytes(&buf)?))
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(error = %e, "stream shutdown failed");
        }
    }
}
