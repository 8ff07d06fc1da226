//! Resolved per-attempt encryption material.
//!
//! An [`EncryptionMetadata`] is unlocked once per upload attempt and shared
//! by every block, thumbnail and attribute encryption call in that attempt.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::SecretString;

use crate::block::{decrypt_block, encrypt_block};
use crate::error::{CryptoError, CryptoResult};
use crate::kdf::KdfParams;
use crate::keyring::AddressKeyring;
use crate::keys::{unlock_node_key, unwrap_content_key, ContentKey, NodeKey};
use crate::seal::{open, seal};
use crate::sign::{sign_sealed, verify, verify_sealed, AddressKey, DetachedSignature};

const XATTR_AAD: &[u8] = b"vaultup-xattr";
const THUMBNAIL_AAD: &[u8] = b"vaultup-thumbnail";

/// One encrypted block ready to be written to the local cache.
#[derive(Debug, Clone)]
pub struct EncryptedBlock {
    pub index: u32,
    pub ciphertext: Vec<u8>,
    /// BLAKE3 of `ciphertext` (hex)
    pub hash: String,
    pub clear_size: u64,
    /// Signature over the cleartext, sealed under the node key (base64)
    pub signature: String,
}

pub struct EncryptionMetadata {
    node_key: NodeKey,
    content_key: ContentKey,
    content_key_packet: Vec<u8>,
    node_passphrase: SecretString,
    address: AddressKey,
}

impl EncryptionMetadata {
    pub fn new(
        node_key: NodeKey,
        content_key: ContentKey,
        content_key_packet: Vec<u8>,
        node_passphrase: SecretString,
        address: AddressKey,
    ) -> Self {
        Self {
            node_key,
            content_key,
            content_key_packet,
            node_passphrase,
            address,
        }
    }

    /// Unlock a file's persisted key packets with the local keyring.
    pub fn unlock(
        keyring: &AddressKeyring,
        locked_node_key: &[u8],
        wrapped_passphrase: &[u8],
        content_key_packet: &[u8],
        params: &KdfParams,
    ) -> CryptoResult<Self> {
        let passphrase = keyring.unwrap_passphrase(wrapped_passphrase)?;
        let node_key = unlock_node_key(locked_node_key, &passphrase, params)?;
        let content_key = unwrap_content_key(&node_key, content_key_packet)?;
        Ok(Self::new(
            node_key,
            content_key,
            content_key_packet.to_vec(),
            passphrase,
            keyring.address_key().clone(),
        ))
    }

    pub fn signer_email(&self) -> &str {
        self.address.email()
    }

    pub fn content_key_packet(&self) -> &[u8] {
        &self.content_key_packet
    }

    pub fn node_passphrase(&self) -> &SecretString {
        &self.node_passphrase
    }

    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.address.verifying_key()
    }

    /// Encrypt one block and sign its cleartext.
    pub fn encrypt_block(
        &self,
        revision_id: &str,
        index: u32,
        cleartext: &[u8],
    ) -> CryptoResult<EncryptedBlock> {
        let ciphertext = encrypt_block(&self.content_key, revision_id, index, cleartext)?;
        let signature = sign_sealed(&self.address, &self.node_key, cleartext)?;
        let hash = blake3::hash(&ciphertext).to_hex().to_string();
        Ok(EncryptedBlock {
            index,
            hash,
            clear_size: cleartext.len() as u64,
            signature: STANDARD.encode(signature),
            ciphertext,
        })
    }

    /// Decrypt a block and check its sealed signature.
    pub fn decrypt_block(
        &self,
        revision_id: &str,
        index: u32,
        ciphertext: &[u8],
        signature_b64: &str,
    ) -> CryptoResult<Vec<u8>> {
        let cleartext = decrypt_block(&self.content_key, revision_id, index, ciphertext)?;
        let sealed = STANDARD
            .decode(signature_b64)
            .map_err(|_| CryptoError::BadSignature)?;
        verify_sealed(&self.verifying_key(), &self.node_key, &cleartext, &sealed)?;
        Ok(cleartext)
    }

    /// Encrypt-and-sign the extended attributes payload under the node key.
    pub fn encrypt_xattr(&self, revision_id: &str, payload: &[u8]) -> CryptoResult<Vec<u8>> {
        self.encrypt_and_sign(self.node_key.as_bytes(), XATTR_AAD, revision_id, payload)
    }

    pub fn decrypt_xattr(&self, revision_id: &str, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        self.decrypt_and_verify(self.node_key.as_bytes(), XATTR_AAD, revision_id, sealed)
    }

    /// Encrypt-and-sign a compressed thumbnail under the content key.
    pub fn encrypt_thumbnail(&self, revision_id: &str, image: &[u8]) -> CryptoResult<Vec<u8>> {
        self.encrypt_and_sign(self.content_key.as_bytes(), THUMBNAIL_AAD, revision_id, image)
    }

    pub fn decrypt_thumbnail(&self, revision_id: &str, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        self.decrypt_and_verify(self.content_key.as_bytes(), THUMBNAIL_AAD, revision_id, sealed)
    }

    /// Sign the revision manifest (thumbnail hashes then block hashes).
    pub fn sign_manifest(&self, manifest: &[u8]) -> String {
        self.address.sign(manifest).to_base64()
    }

    pub fn verify_manifest(&self, manifest: &[u8], signature_b64: &str) -> CryptoResult<()> {
        let raw = STANDARD
            .decode(signature_b64)
            .map_err(|_| CryptoError::BadSignature)?;
        verify(&self.verifying_key(), manifest, &DetachedSignature::from_slice(&raw)?)
    }

    // Plaintext layout: [64-byte signature][message]
    fn encrypt_and_sign(
        &self,
        key: &[u8; crate::KEY_SIZE],
        domain: &[u8],
        revision_id: &str,
        message: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let signature = self.address.sign(message);
        let mut plaintext = Vec::with_capacity(64 + message.len());
        plaintext.extend_from_slice(signature.as_bytes());
        plaintext.extend_from_slice(message);
        seal(key, &context_aad(domain, revision_id), &plaintext)
    }

    fn decrypt_and_verify(
        &self,
        key: &[u8; crate::KEY_SIZE],
        domain: &[u8],
        revision_id: &str,
        sealed: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let mut plaintext = open(key, &context_aad(domain, revision_id), sealed)?;
        if plaintext.len() < 64 {
            return Err(CryptoError::BadSignature);
        }
        let message = plaintext.split_off(64);
        verify(
            &self.verifying_key(),
            &message,
            &DetachedSignature::from_slice(&plaintext)?,
        )?;
        Ok(message)
    }
}

impl std::fmt::Debug for EncryptionMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionMetadata")
            .field("signer", &self.address.email())
            .finish_non_exhaustive()
    }
}

fn context_aad(domain: &[u8], revision_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(domain.len() + 32);
    aad.extend_from_slice(domain);
    aad.extend_from_slice(blake3::hash(revision_id.as_bytes()).as_bytes());
    aad
}
