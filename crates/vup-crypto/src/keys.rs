//! Per-file key material: node key, content key, and their locked forms

use rand::RngCore;
use secrecy::SecretString;
use zeroize::Zeroize;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::{derive_lock_key, KdfParams};
use crate::keyring::AddressKeyring;
use crate::seal::{open, seal};
use crate::{KEY_SIZE, SALT_SIZE};

const NODE_KEY_AAD: &[u8] = b"vaultup-node-key";
const CONTENT_KEY_AAD: &[u8] = b"vaultup-content-key";

macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            bytes: [u8; KEY_SIZE],
        }

        impl $name {
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self { bytes }
            }

            pub fn generate() -> Self {
                let mut bytes = [0u8; KEY_SIZE];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self { bytes }
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }

            fn from_vec(mut plaintext: Vec<u8>) -> CryptoResult<Self> {
                if plaintext.len() != KEY_SIZE {
                    let len = plaintext.len();
                    plaintext.zeroize();
                    return Err(CryptoError::InvalidKey(format!(
                        "{} has wrong size: {len} bytes (expected {KEY_SIZE})",
                        stringify!($name)
                    )));
                }
                let mut bytes = [0u8; KEY_SIZE];
                bytes.copy_from_slice(&plaintext);
                plaintext.zeroize();
                Ok(Self { bytes })
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

secret_key!(
    /// Per-file key sealing the content key, attributes and block signatures.
    NodeKey
);

secret_key!(
    /// Per-file key encrypting block and thumbnail payloads.
    ContentKey
);

/// Random node passphrase: 32 random bytes, base64url.
pub fn generate_passphrase() -> SecretString {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let encoded = URL_SAFE_NO_PAD.encode(raw);
    raw.zeroize();
    SecretString::from(encoded)
}

/// Lock a node key under a passphrase.
///
/// Output: `[16-byte salt][24-byte nonce][ciphertext + 16-byte tag]`
pub fn lock_node_key(
    node_key: &NodeKey,
    passphrase: &SecretString,
    params: &KdfParams,
) -> CryptoResult<Vec<u8>> {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let lock_key = derive_lock_key(passphrase, &salt, params)?;
    let sealed = seal(&lock_key, NODE_KEY_AAD, node_key.as_bytes())?;

    let mut out = Vec::with_capacity(SALT_SIZE + sealed.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn unlock_node_key(
    locked: &[u8],
    passphrase: &SecretString,
    params: &KdfParams,
) -> CryptoResult<NodeKey> {
    if locked.len() <= SALT_SIZE {
        return Err(CryptoError::InvalidKey("locked node key too short".into()));
    }
    let (salt_bytes, sealed) = locked.split_at(SALT_SIZE);
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(salt_bytes);
    let lock_key = derive_lock_key(passphrase, &salt, params)?;
    NodeKey::from_vec(open(&lock_key, NODE_KEY_AAD, sealed)?)
}

/// Content key packet: the content key sealed by the node key.
pub fn wrap_content_key(node_key: &NodeKey, content_key: &ContentKey) -> CryptoResult<Vec<u8>> {
    seal(node_key.as_bytes(), CONTENT_KEY_AAD, content_key.as_bytes())
}

pub fn unwrap_content_key(node_key: &NodeKey, packet: &[u8]) -> CryptoResult<ContentKey> {
    ContentKey::from_vec(open(node_key.as_bytes(), CONTENT_KEY_AAD, packet)?)
}

/// The persisted key packets of a freshly created file node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeKeyBundle {
    pub locked_node_key: Vec<u8>,
    pub wrapped_passphrase: Vec<u8>,
    pub content_key_packet: Vec<u8>,
}

impl NodeKeyBundle {
    /// Generate node key, passphrase and content key for a new file.
    pub fn generate(keyring: &AddressKeyring, params: &KdfParams) -> CryptoResult<Self> {
        let node_key = NodeKey::generate();
        let content_key = ContentKey::generate();
        let passphrase = generate_passphrase();

        Ok(Self {
            locked_node_key: lock_node_key(&node_key, &passphrase, params)?,
            wrapped_passphrase: keyring.wrap_passphrase(&passphrase)?,
            content_key_packet: wrap_content_key(&node_key, &content_key)?,
        })
    }
}
