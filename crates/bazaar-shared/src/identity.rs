use p256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::IdentityError;

/// A device or user signing identity based on ECDSA over P-256.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Restore identity from secret scalar bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, IdentityError> {
        let signing_key =
            SigningKey::from_slice(secret).map_err(|_| IdentityError::InvalidKeyBytes)?;
        Ok(Self { signing_key })
    }

    /// Compressed SEC1 public key (33 bytes).
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    /// Public key as stored in `User.publicKey`.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&self.signing_key.to_bytes());
        out
    }

    /// Sign a message, returning the fixed-size `r || s` encoding.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signature: Signature = self.signing_key.sign(message);
        let mut out = [0u8; 64];
        out.copy_from_slice(&signature.to_bytes());
        out
    }

    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.sign(message))
    }
}

/// Check that `pubkey` decodes as a P-256 point.
pub fn parse_public_key(pubkey: &[u8]) -> Result<VerifyingKey, IdentityError> {
    VerifyingKey::from_sec1_bytes(pubkey).map_err(|_| IdentityError::InvalidKeyBytes)
}

/// Verify an `r || s` signature against a SEC1 public key
pub fn verify_signature(pubkey: &[u8], message: &[u8], signature: &[u8]) -> Result<(), IdentityError> {
    let verifying_key = parse_public_key(pubkey)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| IdentityError::InvalidSignatureBytes)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::SignatureMismatch)
}

/// Hex-encoded variant of [`verify_signature`] matching the record fields.
pub fn verify_signature_hex(
    pubkey_hex: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<(), IdentityError> {
    let pubkey = hex::decode(pubkey_hex).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let signature = hex::decode(signature_hex).map_err(|_| IdentityError::InvalidSignatureBytes)?;
    verify_signature(&pubkey, message, &signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let id = Identity::generate();
        assert_eq!(id.public_key_bytes().len(), crate::constants::PUBKEY_SIZE);
    }

    #[test]
    fn test_identity_roundtrip() {
        let id = Identity::generate();
        let restored = Identity::from_secret_bytes(&id.secret_bytes()).unwrap();
        assert_eq!(id.public_key_hex(), restored.public_key_hex());
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let message = b"booking hash";
        let signature = id.sign(message);

        assert!(verify_signature(&id.public_key_bytes(), message, &signature).is_ok());
        assert_eq!(
            verify_signature(&id.public_key_bytes(), b"wrong", &signature),
            Err(IdentityError::SignatureMismatch)
        );
    }

    #[test]
    fn test_other_key_rejected() {
        let host = Identity::generate();
        let mallory = Identity::generate();
        let sig = mallory.sign_hex(b"msg");
        assert!(verify_signature_hex(&host.public_key_hex(), b"msg", &sig).is_err());
        assert!(verify_signature_hex(&mallory.public_key_hex(), b"msg", &sig).is_ok());
    }

    #[test]
    fn test_garbage_key_rejected() {
        assert_eq!(
            parse_public_key(&[1u8; 33]).err(),
            Some(IdentityError::InvalidKeyBytes)
        );
    }
}
