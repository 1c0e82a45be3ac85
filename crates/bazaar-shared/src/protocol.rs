use serde::{Deserialize, Serialize};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::ProtocolError;
use crate::models::{Checkpoint, Record};
use crate::types::{EntityKind, PeerId};

/// All wire protocol frames exchanged between two syncing peers.
///
/// The initiator sends requests, the responder answers each one before the
/// next arrives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WireMessage {
    /// Opening frame in both directions
    Hello(Hello),

    /// Summary of records changed since the negotiated checkpoint
    Manifest(Manifest),

    /// Request full records by id
    Fetch(Fetch),

    /// One chunk of a `Fetch` response
    Records(RecordBatch),

    /// Records the initiator wants the responder to merge
    Push(Push),

    /// Outcome of a `Push` or `PushMedia`
    PushAck(PushAck),

    /// Request the bytes of a media object
    FetchMedia(FetchMedia),

    /// One chunk of media bytes, in either direction
    MediaChunk(MediaChunk),

    /// Initiator-to-responder media upload chunk
    PushMedia(MediaChunk),

    /// The responder does not hold the requested bytes
    MediaMissing(FetchMedia),

    /// End of a cycle; carries the checkpoint the sender will store
    Done(Done),

    DoneAck,

    /// Fatal for the session
    Error(ErrorFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hello {
    pub peer: PeerId,
    pub protocol: String,
    /// How far the sender has read the receiver's ingest log, per kind.
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub kind: EntityKind,
    pub id: String,
    pub updated: i64,
    /// Canonical hash of the record content.
    pub digest: String,
    /// Position of the record in the sender's ingest log.
    pub seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fetch {
    pub kind: EntityKind,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    /// No further `Records` frames follow for this request.
    pub last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Push {
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushAck {
    pub applied: u32,
    pub rejected: u32,
    pub conflicts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchMedia {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaChunk {
    pub id: String,
    pub offset: u64,
    pub data: Vec<u8>,
    pub last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Done {
    /// The initiator's read position in the responder's log after this round.
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorFrame {
    pub reason: String,
}

impl WireMessage {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = bincode::serialize(self).map_err(ProtocolError::Encode)?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        bincode::deserialize(data).map_err(ProtocolError::Decode)
    }

    /// Short frame name for logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            WireMessage::Hello(_) => "Hello",
            WireMessage::Manifest(_) => "Manifest",
            WireMessage::Fetch(_) => "Fetch",
            WireMessage::Records(_) => "Records",
            WireMessage::Push(_) => "Push",
            WireMessage::PushAck(_) => "PushAck",
            WireMessage::FetchMedia(_) => "FetchMedia",
            WireMessage::MediaChunk(_) => "MediaChunk",
            WireMessage::PushMedia(_) => "PushMedia",
            WireMessage::MediaMissing(_) => "MediaMissing",
            WireMessage::Done(_) => "Done",
            WireMessage::DoneAck => "DoneAck",
            WireMessage::Error(_) => "Error",
        }
    }

    /// Build the error for receiving `self` where `expected` was due.
    pub fn unexpected(&self, expected: &'static str) -> ProtocolError {
        let got = match self {
            WireMessage::Error(frame) => format!("Error({})", frame.reason),
            other => other.name().to_string(),
        };
        ProtocolError::Unexpected { expected, got }
    }
}
