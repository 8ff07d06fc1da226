//! The three revision encryptors and the job state they share.
//!
//! Each encryptor reads what it needs from the store, does its work off the
//! async workers, and persists its output in one store transaction. The
//! coordinator wires them together through a [`crate::graph::TaskGraph`].

pub mod blocks;
pub mod thumbnail;
pub mod xattr;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use vup_core::types::{FileRecord, RevisionRecord};
use vup_crypto::EncryptionMetadata;

use crate::context::{ProgressFn, UploadContext};
use crate::error::UploadError;

pub use blocks::BlockEncryptor;
pub use thumbnail::ThumbnailEncryptor;
pub use xattr::{ExtendedAttributes, XAttrEncryptor};

/// Everything one encryption attempt of one revision works from.
pub struct EncryptionJob {
    pub ctx: UploadContext,
    pub file: FileRecord,
    pub revision_id: String,
    pub metadata: Arc<EncryptionMetadata>,
    pub cancel: CancellationToken,
    /// Fraction of the block stage done, 0.0 to 1.0
    pub progress: ProgressFn,
    /// Whole-file SHA-1, set once the block stage has read every block
    pub digest: OnceLock<String>,
}

impl EncryptionJob {
    pub(crate) fn revision(&self) -> Result<RevisionRecord, UploadError> {
        self.ctx
            .store
            .read_revision(&self.revision_id)?
            .ok_or_else(|| {
                UploadError::Validation(format!("revision {} not found", self.revision_id))
            })
    }
}

#[async_trait]
pub trait Encryptor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, job: Arc<EncryptionJob>) -> Result<(), UploadError>;
}

pub(crate) fn join_error(stage: &str, e: tokio::task::JoinError) -> UploadError {
    UploadError::Validation(format!("{stage} task failed: {e}"))
}
