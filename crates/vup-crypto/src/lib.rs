//! vup-crypto: client-side encryption for vaultup uploads
//!
//! Key hierarchy:
//! ```text
//! Address keyring (per account, JSON on disk)
//!   ├── Ed25519 signing key: block, xattr, thumbnail and manifest signatures
//!   └── Storage key: wraps each node passphrase
//! Node passphrase (random, per file)
//!   └── Argon2id → lock key, seals the Node Key
//! Node Key (per file, 256-bit random)
//!   ├── seals the Content Key ("content key packet")
//!   ├── seals extended attributes and block signatures
//! Content Key (per file, 256-bit random)
//!   └── Block AEAD: XChaCha20-Poly1305 (nonce=random 192-bit, AAD=index||BLAKE3(revision id))
//! ```

pub mod block;
pub mod error;
pub mod kdf;
pub mod keyring;
pub mod keys;
pub mod metadata;
pub mod seal;
pub mod sign;

pub use block::{decrypt_block, encrypt_block};
pub use error::{CryptoError, CryptoResult};
pub use kdf::KdfParams;
pub use keyring::AddressKeyring;
pub use keys::{ContentKey, NodeKey, NodeKeyBundle};
pub use metadata::{EncryptedBlock, EncryptionMetadata};
pub use sign::{AddressKey, DetachedSignature};

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of an Argon2id salt
pub const SALT_SIZE: usize = 16;

/// Ciphertext overhead added by one sealing operation
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;
