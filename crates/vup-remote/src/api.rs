use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vup_core::types::{RevisionSession, ThumbnailKind};

use crate::error::RemoteResult;

/// Declares one block before upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUploadRequest {
    pub index: u32,
    /// Ciphertext size in bytes
    pub size: u64,
    pub hash: String,
}

/// Where and with which credential one block is uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTarget {
    pub session_id: String,
    pub index: u32,
    pub key: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAck {
    pub index: u32,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitBlock {
    pub index: u32,
    pub hash: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitThumbnail {
    pub kind: ThumbnailKind,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub blocks: Vec<CommitBlock>,
    pub thumbnails: Vec<CommitThumbnail>,
    pub manifest_signature: String,
    pub signature_email: String,
    /// Encrypted extended attributes (base64)
    pub xattrs: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub file_id: String,
    pub revision_id: String,
    pub committed_bytes: u64,
}

/// Operations the upload pipeline needs from the remote side.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Open a new in-progress revision for `file_id`.
    async fn request_revision_session(&self, file_id: &str) -> RemoteResult<RevisionSession>;

    /// Fails with `ExpiredResource` if the session can no longer be used.
    async fn check_session(&self, session: &RevisionSession) -> RemoteResult<()>;

    /// One target per requested block, in request order.
    async fn request_block_upload_targets(
        &self,
        session: &RevisionSession,
        blocks: &[BlockUploadRequest],
    ) -> RemoteResult<Vec<UploadTarget>>;

    async fn upload_block(&self, target: &UploadTarget, ciphertext_path: &Path)
        -> RemoteResult<BlockAck>;

    async fn upload_thumbnail(
        &self,
        session: &RevisionSession,
        kind: ThumbnailKind,
        encrypted: &[u8],
    ) -> RemoteResult<()>;

    async fn commit_revision(
        &self,
        session: &RevisionSession,
        request: CommitRequest,
    ) -> RemoteResult<CommitResult>;

    /// Drop an uncommitted session and everything uploaded under it.
    async fn discard_revision_session(&self, session: &RevisionSession) -> RemoteResult<()>;

    /// Remaining storage budget; `None` when unlimited.
    async fn available_bytes(&self) -> RemoteResult<Option<u64>>;
}
