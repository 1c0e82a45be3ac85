use thiserror::Error;

#[derive(Error, Debug)]
pub enum BazaarError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    /// Authentication tag mismatch: wrong key or modified ciphertext.
    #[error("Authentication failed: ciphertext was tampered with or the key is wrong")]
    TamperDetected,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unsupported KDF algorithm: {0}")]
    UnsupportedKdf(u8),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Canonical serialization failed: {0}")]
    Canonical(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid signature encoding")]
    InvalidSignatureBytes,

    #[error("Signature does not verify")]
    SignatureMismatch,
}

/// A record that is malformed or violates its schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} {id}: {reason}")]
pub struct ValidationError {
    pub kind: String,
    pub id: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(kind: impl Into<String>, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame encoding failed: {0}")]
    Encode(bincode::Error),

    #[error("Frame decoding failed: {0}")]
    Decode(bincode::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unexpected frame: expected {expected}, got {got}")]
    Unexpected { expected: &'static str, got: String },
}
