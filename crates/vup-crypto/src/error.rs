use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: invalid key, corrupted data, or wrong context")]
    Decrypt,

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("block {0} does not open to the bytes that were sealed")]
    BlockMismatch(u32),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
