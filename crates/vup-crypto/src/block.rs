//! Per-block XChaCha20-Poly1305 encryption/decryption
//!
//! Encrypted block format (binary):
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! AAD = block_index (8 bytes, big-endian) || BLAKE3(revision_id) (32 bytes)
//! ```
//!
//! The AAD binds each block to its position and revision, so blocks cannot
//! be reordered or moved to another revision without failing authentication.

use crate::error::CryptoResult;
use crate::keys::ContentKey;
use crate::seal::{open, seal};

pub fn encrypt_block(
    content_key: &ContentKey,
    revision_id: &str,
    index: u32,
    cleartext: &[u8],
) -> CryptoResult<Vec<u8>> {
    seal(content_key.as_bytes(), &build_aad(index, revision_id), cleartext)
}

pub fn decrypt_block(
    content_key: &ContentKey,
    revision_id: &str,
    index: u32,
    encrypted: &[u8],
) -> CryptoResult<Vec<u8>> {
    open(content_key.as_bytes(), &build_aad(index, revision_id), encrypted)
}

/// Build AAD: index (8 bytes BE) || BLAKE3(revision_id) (32 bytes)
fn build_aad(index: u32, revision_id: &str) -> [u8; 40] {
    let mut aad = [0u8; 40];
    aad[..8].copy_from_slice(&u64::from(index).to_be_bytes());
    aad[8..].copy_from_slice(blake3::hash(revision_id.as_bytes()).as_bytes());
    aad
}
