use std::fmt;

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::constants::{
    ARGON2_LANES, ARGON2_MEMORY_KIB, ARGON2_PASSES, NONCE_SIZE, PBKDF2_ITERATIONS, SALT_SIZE,
    SYMMETRIC_KEY_SIZE, TAG_SIZE,
};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Wire identifier of a key derivation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KdfAlgorithm {
    Pbkdf2Sha256 = 0x01,
    Argon2id = 0x02,
}

impl KdfAlgorithm {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Pbkdf2Sha256),
            0x02 => Some(Self::Argon2id),
            _ => None,
        }
    }
}

/// Cost parameters persisted next to every ciphertext so decryption never
/// has to guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfParams {
    Pbkdf2 { iterations: u32 },
    Argon2id { memory_kib: u32, passes: u32, lanes: u32 },
}

impl KdfParams {
    pub fn algorithm(&self) -> KdfAlgorithm {
        match self {
            KdfParams::Pbkdf2 { .. } => KdfAlgorithm::Pbkdf2Sha256,
            KdfParams::Argon2id { .. } => KdfAlgorithm::Argon2id,
        }
    }
}

/// A passphrase-based key derivation strategy.
pub trait KeyDerivation: Send + Sync + fmt::Debug {
    fn algorithm(&self) -> KdfAlgorithm;

    fn params(&self) -> KdfParams;

    /// Derive a 256-bit key. Deterministic for identical inputs.
    fn derive(&self, passphrase: &[u8], salt: &[u8]) -> Result<Zeroizing<SymmetricKey>, CryptoError>;
}

#[derive(Debug, Clone)]
pub struct Pbkdf2Kdf {
    iterations: u32,
}

impl Pbkdf2Kdf {
    pub fn new(iterations: u32) -> Result<Self, CryptoError> {
        if iterations == 0 {
            return Err(CryptoError::KeyDerivation(
                "PBKDF2 iteration count must be positive".to_string(),
            ));
        }
        Ok(Self { iterations })
    }
}

impl Default for Pbkdf2Kdf {
    fn default() -> Self {
        Self {
            iterations: PBKDF2_ITERATIONS,
        }
    }
}

impl KeyDerivation for Pbkdf2Kdf {
    fn algorithm(&self) -> KdfAlgorithm {
        KdfAlgorithm::Pbkdf2Sha256
    }

    fn params(&self) -> KdfParams {
        KdfParams::Pbkdf2 {
            iterations: self.iterations,
        }
    }

    fn derive(&self, passphrase: &[u8], salt: &[u8]) -> Result<Zeroizing<SymmetricKey>, CryptoError> {
        check_salt(salt)?;
        let mut key = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, self.iterations, &mut key[..]);
        Ok(key)
    }
}

#[derive(Debug, Clone)]
pub struct Argon2idKdf {
    memory_kib: u32,
    passes: u32,
    lanes: u32,
}

impl Argon2idKdf {
    pub fn new(memory_kib: u32, passes: u32, lanes: u32) -> Result<Self, CryptoError> {
        let kdf = Self {
            memory_kib,
            passes,
            lanes,
        };
        // Reject parameter sets argon2 itself would refuse.
        kdf.context()?;
        Ok(kdf)
    }

    fn context(&self) -> Result<Argon2<'static>, CryptoError> {
        let params = Params::new(
            self.memory_kib,
            self.passes,
            self.lanes,
            Some(SYMMETRIC_KEY_SIZE),
        )
        .map_err(|e| CryptoError::KeyDerivation(format!("argon2 params: {e}")))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

impl KeyDerivation for Argon2idKdf {
    fn algorithm(&self) -> KdfAlgorithm {
        KdfAlgorithm::Argon2id
    }

    fn params(&self) -> KdfParams {
        KdfParams::Argon2id {
            memory_kib: self.memory_kib,
            passes: self.passes,
            lanes: self.lanes,
        }
    }

    fn derive(&self, passphrase: &[u8], salt: &[u8]) -> Result<Zeroizing<SymmetricKey>, CryptoError> {
        check_salt(salt)?;
        let mut key = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);
        self.context()?
            .hash_password_into(passphrase, salt, &mut key[..])
            .map_err(|e| CryptoError::KeyDerivation(format!("argon2: {e}")))?;
        Ok(key)
    }
}

fn check_salt(salt: &[u8]) -> Result<(), CryptoError> {
    if salt.len() < SALT_SIZE {
        return Err(CryptoError::KeyDerivation(format!(
            "salt must be at least {SALT_SIZE} bytes, got {}",
            salt.len()
        )));
    }
    Ok(())
}

/// Pick the strongest KDF this build can run.
///
/// Argon2id is used when its context can be built and a probe derivation
/// succeeds (it needs ~19 MiB of working memory); otherwise PBKDF2 is used.
pub fn probe_kdf() -> Box<dyn KeyDerivation> {
    let probe = Argon2idKdf::new(ARGON2_MEMORY_KIB, ARGON2_PASSES, ARGON2_LANES)
        .and_then(|kdf| kdf.derive(b"probe", &[0u8; SALT_SIZE]).map(|_| kdf));

    match probe {
        Ok(kdf) => {
            tracing::debug!(params = ?kdf.params(), "selected Argon2id key derivation");
            Box::new(kdf)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Argon2id unavailable, falling back to PBKDF2-SHA256");
            Box::new(Pbkdf2Kdf::default())
        }
    }
}

/// Rebuild the exact strategy recorded alongside a ciphertext.
pub fn kdf_from_params(params: KdfParams) -> Result<Box<dyn KeyDerivation>, CryptoError> {
    match params {
        KdfParams::Pbkdf2 { iterations } => Ok(Box::new(Pbkdf2Kdf::new(iterations)?)),
        KdfParams::Argon2id {
            memory_kib,
            passes,
            lanes,
        } => Ok(Box::new(Argon2idKdf::new(memory_kib, passes, lanes)?)),
    }
}

// ---------------------------------------------------------------------------
// Authenticated encryption
// ---------------------------------------------------------------------------

/// Output of one AES-256-GCM sealing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

/// Encrypt with a fresh random nonce. `aad` is authenticated but not
/// encrypted.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CryptoError> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce = generate_nonce();

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(Sealed {
        nonce,
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

/// Decrypt and verify. Any mismatch fails closed without returning
/// plaintext.
pub fn decrypt(
    key: &SymmetricKey,
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
        return Err(CryptoError::TamperDetected);
    }

    let cipher = Aes256Gcm::new(key.into());
    let mut buffer = ciphertext.to_vec();
    match cipher.decrypt_in_place_detached(
        Nonce::from_slice(nonce),
        aad,
        &mut buffer,
        Tag::from_slice(tag),
    ) {
        Ok(()) => Ok(buffer),
        Err(_) => {
            zeroize::Zeroize::zeroize(&mut buffer);
            Err(CryptoError::TamperDetected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_argon() -> Argon2idKdf {
        Argon2idKdf::new(64, 1, 1).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_symmetric_key();
        let plaintext = b"two nights in the lighthouse";

        let sealed = encrypt(&key, plaintext, b"hdr").unwrap();
        let decrypted = decrypt(&key, &sealed.nonce, &sealed.ciphertext, &sealed.tag, b"hdr").unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt(&generate_symmetric_key(), b"secret", b"").unwrap();
        let err = decrypt(
            &generate_symmetric_key(),
            &sealed.nonce,
            &sealed.ciphertext,
            &sealed.tag,
            b"",
        )
        .unwrap_err();
        assert_eq!(err, CryptoError::TamperDetected);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_symmetric_key();
        let mut sealed = encrypt(&key, b"Important data", b"").unwrap();
        sealed.ciphertext[0] ^= 0xFF;

        assert_eq!(
            decrypt(&key, &sealed.nonce, &sealed.ciphertext, &sealed.tag, b""),
            Err(CryptoError::TamperDetected)
        );
    }

    #[test]
    fn test_tampered_aad_fails() {
        let key = generate_symmetric_key();
        let sealed = encrypt(&key, b"payload", b"v1").unwrap();
        assert!(decrypt(&key, &sealed.nonce, &sealed.ciphertext, &sealed.tag, b"v2").is_err());
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = generate_symmetric_key();
        let a = encrypt(&key, b"same", b"").unwrap();
        let b = encrypt(&key, b"same", b"").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_pbkdf2_deterministic() {
        let kdf = Pbkdf2Kdf::new(1_000).unwrap();
        let salt = [7u8; SALT_SIZE];
        let k1 = kdf.derive(b"passphrase", &salt).unwrap();
        let k2 = kdf.derive(b"passphrase", &salt).unwrap();
        assert_eq!(*k1, *k2);
    }

    #[test]
    fn test_salt_changes_key() {
        let kdf = Pbkdf2Kdf::new(1_000).unwrap();
        let k1 = kdf.derive(b"passphrase", &[1u8; SALT_SIZE]).unwrap();
        let k2 = kdf.derive(b"passphrase", &[2u8; SALT_SIZE]).unwrap();
        assert_ne!(*k1, *k2);

        let a1 = fast_argon().derive(b"passphrase", &[1u8; SALT_SIZE]).unwrap();
        let a2 = fast_argon().derive(b"passphrase", &[2u8; SALT_SIZE]).unwrap();
        assert_ne!(*a1, *a2);
    }

    #[test]
    fn test_argon2_deterministic() {
        let salt = [9u8; SALT_SIZE];
        let k1 = fast_argon().derive(b"pw", &salt).unwrap();
        let k2 = fast_argon().derive(b"pw", &salt).unwrap();
        assert_eq!(*k1, *k2);
    }

    #[test]
    fn test_algorithms_differ() {
        let salt = [3u8; SALT_SIZE];
        let p = Pbkdf2Kdf::new(1_000).unwrap().derive(b"pw", &salt).unwrap();
        let a = fast_argon().derive(b"pw", &salt).unwrap();
        assert_ne!(*p, *a);
    }

    #[test]
    fn test_short_salt_rejected() {
        assert!(Pbkdf2Kdf::default().derive(b"pw", &[0u8; 8]).is_err());
    }

    #[test]
    fn test_kdf_from_params_round_trip() {
        let kdf = fast_argon();
        let rebuilt = kdf_from_params(kdf.params()).unwrap();
        assert_eq!(rebuilt.algorithm(), KdfAlgorithm::Argon2id);
        let salt = generate_salt();
        assert_eq!(*kdf.derive(b"x", &salt).unwrap(), *rebuilt.derive(b"x", &salt).unwrap());
    }

    #[test]
    fn test_invalid_params_rejected() {
        assert!(kdf_from_params(KdfParams::Pbkdf2 { iterations: 0 }).is_err());
        assert!(kdf_from_params(KdfParams::Argon2id {
            memory_kib: 1,
            passes: 0,
            lanes: 0
        })
        .is_err());
    }

    #[test]
    fn test_probe_selects_argon2id() {
        assert_eq!(probe_kdf().algorithm(), KdfAlgorithm::Argon2id);
    }
}
