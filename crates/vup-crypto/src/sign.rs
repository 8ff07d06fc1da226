//! Ed25519 address keys and detached signatures
//!
//! Block signatures are never stored in the clear: the 64-byte signature is
//! sealed under the node key so only holders of the node key can check who
//! signed a block.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::NodeKey;
use crate::seal::{open, seal};

const BLOCK_SIGNATURE_AAD: &[u8] = b"vaultup-block-signature";

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetachedSignature([u8; 64]);

impl DetachedSignature {
    pub fn from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; 64] = slice.try_into().map_err(|_| CryptoError::BadSignature)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

/// An address signing key together with the email it signs for.
#[derive(Clone)]
pub struct AddressKey {
    email: String,
    inner: ed25519_dalek::SigningKey,
}

impl AddressKey {
    pub fn generate(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            inner: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(email: impl Into<String>, seed: &[u8; 32]) -> Self {
        Self {
            email: email.into(),
            inner: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub(crate) fn seed(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.inner.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> DetachedSignature {
        DetachedSignature(self.inner.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for AddressKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressKey")
            .field("email", &self.email)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

pub fn verify(
    key: &ed25519_dalek::VerifyingKey,
    message: &[u8],
    signature: &DetachedSignature,
) -> CryptoResult<()> {
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    key.verify(message, &sig).map_err(|_| CryptoError::BadSignature)
}

/// Sign `cleartext` and seal the signature under the node key.
pub fn sign_sealed(
    address: &AddressKey,
    node_key: &NodeKey,
    cleartext: &[u8],
) -> CryptoResult<Vec<u8>> {
    let signature = address.sign(cleartext);
    seal(node_key.as_bytes(), BLOCK_SIGNATURE_AAD, signature.as_bytes())
}

/// Open a sealed signature and check it against `cleartext`.
pub fn verify_sealed(
    key: &ed25519_dalek::VerifyingKey,
    node_key: &NodeKey,
    cleartext: &[u8],
    sealed_signature: &[u8],
) -> CryptoResult<()> {
    let raw = open(node_key.as_bytes(), BLOCK_SIGNATURE_AAD, sealed_signature)?;
    verify(key, cleartext, &DetachedSignature::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let key = AddressKey::generate("alice@example.com");
        let sig = key.sign(b"message");
        verify(&key.verifying_key(), b"message", &sig).unwrap();
        assert!(verify(&key.verifying_key(), b"other", &sig).is_err());
    }

    #[test]
    fn test_sealed_signature_requires_node_key() {
        let key = AddressKey::generate("alice@example.com");
        let node_key = NodeKey::generate();
        let sealed = sign_sealed(&key, &node_key, b"block").unwrap();

        verify_sealed(&key.verifying_key(), &node_key, b"block", &sealed).unwrap();
        assert!(verify_sealed(&key.verifying_key(), &NodeKey::generate(), b"block", &sealed).is_err());
        assert!(verify_sealed(&key.verifying_key(), &node_key, b"blocc", &sealed).is_err());
    }

    #[test]
    fn test_seed_roundtrip() {
        let key = AddressKey::generate("bob@example.com");
        let again = AddressKey::from_seed("bob@example.com", &key.seed());
        assert_eq!(key.verifying_key(), again.verifying_key());
        assert!(!format!("{key:?}").contains(&format!("{:?}", key.seed())));
    }
}
