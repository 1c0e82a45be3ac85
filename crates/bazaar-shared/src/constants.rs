/// Wire protocol identifier exchanged in the sync handshake
pub const PROTOCOL_VERSION: &str = "/bazaar-sync/1.1.0";

/// Application name
pub const APP_NAME: &str = "Bazaar";

/// AES-256-GCM nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// AES-256-GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric key size in bytes (AES-256)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Minimum KDF salt size in bytes
pub const SALT_SIZE: usize = 16;

/// PBKDF2-HMAC-SHA256 iteration count for the default KDF path
pub const PBKDF2_ITERATIONS: u32 = 150_000;

/// Argon2id memory cost in KiB (19 MiB)
pub const ARGON2_MEMORY_KIB: u32 = 19 * 1024;

/// Argon2id number of passes
pub const ARGON2_PASSES: u32 = 2;

/// Argon2id degree of parallelism
pub const ARGON2_LANES: u32 = 1;

/// Upper bounds on KDF cost accepted from an envelope. Ten times the
/// defaults; anything above is refused before deriving.
pub const MAX_PBKDF2_ITERATIONS: u32 = 10 * PBKDF2_ITERATIONS;
pub const MAX_ARGON2_MEMORY_KIB: u32 = 10 * ARGON2_MEMORY_KIB;
pub const MAX_ARGON2_PASSES: u32 = 10 * ARGON2_PASSES;
pub const MAX_ARGON2_LANES: u32 = 16;

/// Backup envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

/// P-256 compressed SEC1 public key size in bytes
pub const PUBKEY_SIZE: usize = 33;

/// P-256 ECDSA signature size in bytes (r || s)
pub const SIGNATURE_SIZE: usize = 64;

/// Maximum encoded frame size on a peer transport (4 MiB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Maximum media object size in bytes (50 MiB)
pub const MAX_MEDIA_SIZE: usize = 50 * 1024 * 1024;

/// Media bytes carried per transfer chunk (256 KiB)
pub const MEDIA_CHUNK_SIZE: usize = 256 * 1024;

/// Meta key holding the schema version
pub const META_SCHEMA_VERSION: &str = "schema_version";

/// Meta key prefix for per-peer checkpoints
pub const META_CHECKPOINT_PREFIX: &str = "checkpoint:";
