use thiserror::Error;

use vup_chunks::{ChunkError, IntegrityError};
use vup_crypto::CryptoError;
use vup_remote::RemoteError;
use vup_store::StoreError;

/// How the job loop reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient; retry the attempt after a backoff delay
    RetryableNetwork,
    /// Remote session gone; regenerate the draft, then retry from encryption
    RetryableExpiredResource,
    /// Bad state or rejected request; no retry
    FatalValidation,
    /// Remote storage is full; park the file until budget frees up
    FatalQuota,
    /// Bytes on disk disagree with the block layout; no retry
    FatalIntegrity,
    Cancelled,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureClass::RetryableNetwork | FailureClass::RetryableExpiredResource
        )
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("encryption error: {0}")]
    Encryption(#[from] CryptoError),

    #[error("network error: {0}")]
    Network(String),

    #[error("upload session expired: {0}")]
    ExpiredResource(String),

    #[error("insufficient remote storage: need {needed} bytes, {available} available")]
    Quota { needed: u64, available: u64 },

    #[error("upload cancelled")]
    Cancelled,

    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("thumbnail exceeds {max_weight} bytes at every quality")]
    ThumbnailTooLarge { max_weight: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn class(&self) -> FailureClass {
        match self {
            UploadError::Integrity(_) => FailureClass::FatalIntegrity,
            UploadError::Credential(_) | UploadError::Network(_) => FailureClass::RetryableNetwork,
            UploadError::ExpiredResource(_) => FailureClass::RetryableExpiredResource,
            UploadError::Quota { .. } => FailureClass::FatalQuota,
            UploadError::Cancelled => FailureClass::Cancelled,
            UploadError::Encryption(_)
            | UploadError::Store(_)
            | UploadError::Validation(_)
            | UploadError::ThumbnailTooLarge { .. }
            | UploadError::Io(_) => FailureClass::FatalValidation,
        }
    }

    /// Short user-facing category, free of protocol or key detail.
    pub fn category(&self) -> &'static str {
        match self {
            UploadError::Integrity(_) => "file changed during upload",
            UploadError::Credential(_) => "signing credentials unavailable",
            UploadError::Encryption(_) => "encryption failed",
            UploadError::Network(_) => "network unavailable",
            UploadError::ExpiredResource(_) => "upload session expired",
            UploadError::Quota { .. } => "not enough storage",
            UploadError::Cancelled => "cancelled",
            UploadError::Store(_) => "local database error",
            UploadError::Validation(_) => "upload rejected",
            UploadError::ThumbnailTooLarge { .. } => "thumbnail too large",
            UploadError::Io(_) => "file unreadable",
        }
    }
}

impl From<RemoteError> for UploadError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::ConnectionLost(msg) | RemoteError::Network(msg) => {
                UploadError::Network(msg)
            }
            RemoteError::ExpiredResource(msg) => UploadError::ExpiredResource(msg),
            // a session the remote no longer knows is as good as expired
            RemoteError::NotFound(msg) => UploadError::ExpiredResource(msg),
            RemoteError::Quota { needed, available } => UploadError::Quota { needed, available },
            RemoteError::AlreadyCommitted(msg) => {
                UploadError::Validation(format!("already committed: {msg}"))
            }
            RemoteError::Invalid(msg) => UploadError::Validation(msg),
        }
    }
}

impl From<ChunkError> for UploadError {
    fn from(e: ChunkError) -> Self {
        match e {
            ChunkError::Integrity(e) => UploadError::Integrity(e),
            ChunkError::Io(e) => UploadError::Io(e),
            other @ ChunkError::DigestOrder { .. } => UploadError::Validation(other.to_string()),
        }
    }
}
