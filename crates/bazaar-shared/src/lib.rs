//! # bazaar-shared
//!
//! Types shared by every Bazaar crate: the replicated data model, the
//! booking lifecycle, canonical hashing, the crypto vault (key derivation,
//! AES-256-GCM, P-256 signing), the backup envelope and the sync wire
//! protocol.

pub mod canonical;
pub mod constants;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::{BazaarError, CryptoError, IdentityError, ProtocolError, ValidationError};
pub use identity::Identity;
pub use models::*;
pub use types::{now_millis, BookingStatus, EntityKind, PeerId};
