//! Binary container for passphrase-encrypted backups.
//!
//! ```text
//! version u8 | kdf u8 | kdf params | saltLen u8 | salt | nonceLen u8 | nonce
//!            | ctLen u32 | ciphertext | tag[16]
//! ```
//!
//! Integers are big-endian. PBKDF2 params are one u32 (iterations), Argon2id
//! params are three (memory KiB, passes, lanes). Everything up to and
//! including the salt is bound to the ciphertext as associated data.

use bytes::{Buf, BufMut, BytesMut};

use crate::constants::{
    ENVELOPE_VERSION, MAX_ARGON2_LANES, MAX_ARGON2_MEMORY_KIB, MAX_ARGON2_PASSES,
    MAX_PBKDF2_ITERATIONS, NONCE_SIZE, SALT_SIZE, TAG_SIZE,
};
use crate::crypto::{self, generate_salt, kdf_from_params, KdfAlgorithm, KdfParams, KeyDerivation};
use crate::error::CryptoError;

/// Decoded envelope fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub params: KdfParams,
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl Envelope {
    /// Header bytes authenticated alongside the ciphertext.
    fn associated_data(params: &KdfParams, salt: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let salt_len = u8::try_from(salt.len())
            .map_err(|_| CryptoError::MalformedEnvelope("salt too long".into()))?;

        let mut buf = BytesMut::with_capacity(16 + salt.len());
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_u8(params.algorithm() as u8);
        match *params {
            KdfParams::Pbkdf2 { iterations } => buf.put_u32(iterations),
            KdfParams::Argon2id {
                memory_kib,
                passes,
                lanes,
            } => {
                buf.put_u32(memory_kib);
                buf.put_u32(passes);
                buf.put_u32(lanes);
            }
        }
        buf.put_u8(salt_len);
        buf.put_slice(salt);
        Ok(buf.to_vec())
    }

    pub fn encode(&self) -> Result<Vec<u8>, CryptoError> {
        let header = Self::associated_data(&self.params, &self.salt)?;
        let nonce_len = u8::try_from(self.nonce.len())
            .map_err(|_| CryptoError::MalformedEnvelope("nonce too long".into()))?;
        let ct_len = u32::try_from(self.ciphertext.len())
            .map_err(|_| CryptoError::MalformedEnvelope("ciphertext too long".into()))?;

        let mut buf = BytesMut::with_capacity(
            header.len() + 1 + self.nonce.len() + 4 + self.ciphertext.len() + TAG_SIZE,
        );
        buf.put_slice(&header);
        buf.put_u8(nonce_len);
        buf.put_slice(&self.nonce);
        buf.put_u32(ct_len);
        buf.put_slice(&self.ciphertext);
        buf.put_slice(&self.tag);
        Ok(buf.to_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self, CryptoError> {
        let mut buf = data;

        need(&buf, 2, "header")?;
        let version = buf.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        let alg_byte = buf.get_u8();
        let params = match KdfAlgorithm::from_byte(alg_byte) {
            Some(KdfAlgorithm::Pbkdf2Sha256) => {
                need(&buf, 4, "pbkdf2 params")?;
                KdfParams::Pbkdf2 {
                    iterations: buf.get_u32(),
                }
            }
            Some(KdfAlgorithm::Argon2id) => {
                need(&buf, 12, "argon2id params")?;
                KdfParams::Argon2id {
                    memory_kib: buf.get_u32(),
                    passes: buf.get_u32(),
                    lanes: buf.get_u32(),
                }
            }
            None => return Err(CryptoError::UnsupportedKdf(alg_byte)),
        };
        check_cost(&params)?;

        let salt = read_prefixed(&mut buf, "salt")?;
        if salt.len() < SALT_SIZE {
            return Err(CryptoError::MalformedEnvelope(format!(
                "salt is {} bytes, need at least {SALT_SIZE}",
                salt.len()
            )));
        }

        let nonce = read_prefixed(&mut buf, "nonce")?;
        if nonce.len() < NONCE_SIZE {
            return Err(CryptoError::MalformedEnvelope(format!(
                "nonce is {} bytes, need at least {NONCE_SIZE}",
                nonce.len()
            )));
        }

        need(&buf, 4, "ciphertext length")?;
        let ct_len = buf.get_u32() as usize;
        need(&buf, ct_len, "ciphertext")?;
        let ciphertext = buf[..ct_len].to_vec();
        buf.advance(ct_len);

        need(&buf, TAG_SIZE, "tag")?;
        let mut tag = [0u8; TAG_SIZE];
        buf.copy_to_slice(&mut tag);

        if buf.has_remaining() {
            return Err(CryptoError::MalformedEnvelope(format!(
                "{} trailing bytes",
                buf.remaining()
            )));
        }

        Ok(Self {
            params,
            salt,
            nonce,
            ciphertext,
            tag,
        })
    }
}

/// Refuse KDF costs no honest exporter would pick.
fn check_cost(params: &KdfParams) -> Result<(), CryptoError> {
    let excessive = match *params {
        KdfParams::Pbkdf2 { iterations } => iterations > MAX_PBKDF2_ITERATIONS,
        KdfParams::Argon2id {
            memory_kib,
            passes,
            lanes,
        } => {
            memory_kib > MAX_ARGON2_MEMORY_KIB
                || passes > MAX_ARGON2_PASSES
                || lanes > MAX_ARGON2_LANES
        }
    };
    if excessive {
        return Err(CryptoError::MalformedEnvelope(format!(
            "kdf cost {params:?} exceeds limits"
        )));
    }
    Ok(())
}

fn need(buf: &&[u8], n: usize, what: &str) -> Result<(), CryptoError> {
    if buf.remaining() < n {
        return Err(CryptoError::MalformedEnvelope(format!("truncated {what}")));
    }
    Ok(())
}

fn read_prefixed(buf: &mut &[u8], what: &str) -> Result<Vec<u8>, CryptoError> {
    need(buf, 1, what)?;
    let len = buf.get_u8() as usize;
    need(buf, len, what)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

/// Derive a key from `passphrase` with `kdf` under a fresh salt and seal
/// `plaintext` into an encoded envelope.
pub fn seal(
    passphrase: &[u8],
    plaintext: &[u8],
    kdf: &dyn KeyDerivation,
) -> Result<Vec<u8>, CryptoError> {
    let salt = generate_salt();
    let params = kdf.params();
    let key = kdf.derive(passphrase, &salt)?;
    let aad = Envelope::associated_data(&params, &salt)?;
    let sealed = crypto::encrypt(&key, plaintext, &aad)?;

    Envelope {
        params,
        salt: salt.to_vec(),
        nonce: sealed.nonce.to_vec(),
        ciphertext: sealed.ciphertext,
        tag: sealed.tag,
    }
    .encode()
}

/// Decode an envelope, rebuild the recorded KDF, and decrypt.
pub fn open(data: &[u8], passphrase: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let envelope = Envelope::decode(data)?;
    let kdf = kdf_from_params(envelope.params)?;
    let key = kdf.derive(passphrase, &envelope.salt)?;
    let aad = Envelope::associated_data(&envelope.params, &envelope.salt)?;
    crypto::decrypt(
        &key,
        &envelope.nonce,
        &envelope.ciphertext,
        &envelope.tag,
        &aad,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Argon2idKdf, Pbkdf2Kdf};

    fn fast_pbkdf2() -> Pbkdf2Kdf {
        Pbkdf2Kdf::new(1_000).unwrap()
    }

    #[test]
    fn test_seal_open_pbkdf2() {
        let sealed = seal(b"hunter2", b"{\"users\":[]}", &fast_pbkdf2()).unwrap();
        assert_eq!(sealed[0], ENVELOPE_VERSION);
        assert_eq!(sealed[1], KdfAlgorithm::Pbkdf2Sha256 as u8);
        assert_eq!(open(&sealed, b"hunter2").unwrap(), b"{\"users\":[]}");
    }

    #[test]
    fn test_seal_open_argon2id() {
        let kdf = Argon2idKdf::new(64, 1, 1).unwrap();
        let sealed = seal(b"pw", b"payload", &kdf).unwrap();
        assert_eq!(sealed[1], KdfAlgorithm::Argon2id as u8);
        let decoded = Envelope::decode(&sealed).unwrap();
        assert_eq!(
            decoded.params,
            KdfParams::Argon2id {
                memory_kib: 64,
                passes: 1,
                lanes: 1
            }
        );
        assert_eq!(open(&sealed, b"pw").unwrap(), b"payload");
    }

    #[test]
    fn test_wrong_passphrase() {
        let sealed = seal(b"right", b"secret", &fast_pbkdf2()).unwrap();
        assert_eq!(open(&sealed, b"wrong"), Err(CryptoError::TamperDetected));
    }

    #[test]
    fn test_header_is_authenticated() {
        let sealed = seal(b"pw", b"secret", &fast_pbkdf2()).unwrap();
        // Flip a salt byte: salt starts after version, kdf, u32 params, len.
        let mut tampered = sealed.clone();
        tampered[7] ^= 0x01;
        assert_eq!(open(&tampered, b"pw"), Err(CryptoError::TamperDetected));
    }

    #[test]
    fn test_tampered_tag() {
        let mut sealed = seal(b"pw", b"secret", &fast_pbkdf2()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert_eq!(open(&sealed, b"pw"), Err(CryptoError::TamperDetected));
    }

    #[test]
    fn test_unknown_version_and_kdf() {
        let mut sealed = seal(b"pw", b"x", &fast_pbkdf2()).unwrap();
        sealed[0] = 9;
        assert_eq!(
            Envelope::decode(&sealed),
            Err(CryptoError::UnsupportedVersion(9))
        );

        let mut sealed = seal(b"pw", b"x", &fast_pbkdf2()).unwrap();
        sealed[1] = 7;
        assert_eq!(Envelope::decode(&sealed), Err(CryptoError::UnsupportedKdf(7)));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut sealed = seal(b"pw", b"x", &fast_pbkdf2()).unwrap();
        sealed.push(0);
        assert!(matches!(
            Envelope::decode(&sealed),
            Err(CryptoError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_truncation_rejected_at_every_length() {
        let sealed = seal(b"pw", b"some plaintext", &fast_pbkdf2()).unwrap();
        for len in 0..sealed.len() {
            assert!(Envelope::decode(&sealed[..len]).is_err(), "len {len}");
        }
    }

    #[test]
    fn test_short_salt_rejected() {
        let envelope = Envelope {
            params: KdfParams::Pbkdf2 { iterations: 1_000 },
            salt: vec![0u8; 8],
            nonce: vec![0u8; NONCE_SIZE],
            ciphertext: vec![1, 2, 3],
            tag: [0u8; TAG_SIZE],
        };
        let bytes = envelope.encode().unwrap();
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(CryptoError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_short_nonce_rejected() {
        let envelope = Envelope {
            params: KdfParams::Pbkdf2 { iterations: 1_000 },
            salt: vec![0u8; SALT_SIZE],
            nonce: vec![0u8; 8],
            ciphertext: vec![],
            tag: [0u8; TAG_SIZE],
        };
        let bytes = envelope.encode().unwrap();
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(CryptoError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_oversized_kdf_cost_rejected() {
        let costly = [
            KdfParams::Pbkdf2 {
                iterations: u32::MAX,
            },
            KdfParams::Argon2id {
                memory_kib: u32::MAX,
                passes: 1,
                lanes: 1,
            },
            KdfParams::Argon2id {
                memory_kib: 64,
                passes: MAX_ARGON2_PASSES + 1,
                lanes: 1,
            },
        ];
        for params in costly {
            let envelope = Envelope {
                params,
                salt: vec![0u8; SALT_SIZE],
                nonce: vec![0u8; NONCE_SIZE],
                ciphertext: vec![1, 2, 3],
                tag: [0u8; TAG_SIZE],
            };
            let bytes = envelope.encode().unwrap();
            assert!(
                matches!(Envelope::decode(&bytes), Err(CryptoError::MalformedEnvelope(_))),
                "{params:?}"
            );
            assert!(matches!(
                open(&bytes, b"pw"),
                Err(CryptoError::MalformedEnvelope(_))
            ));
        }
    }
}
