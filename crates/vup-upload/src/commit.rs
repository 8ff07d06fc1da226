//! Commit stage: re-check the block set, sign the manifest, finalize remotely.

use std::num::NonZeroU64;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vup_chunks::{block_sizes, check_layout, hash_from_hex};
use vup_core::types::{
    FileRecord, FileState, RevisionRecord, RevisionSession, RevisionUploadState, ThumbnailKind,
};
use vup_crypto::EncryptionMetadata;
use vup_remote::{CommitBlock, CommitRequest, CommitResult, CommitThumbnail};

use crate::context::UploadContext;
use crate::control::checkpoint;
use crate::encrypt::blocks::remove_block_files;
use crate::error::{FailureClass, UploadError};

/// Manifest bytes: thumbnail hashes (default, then photo) followed by
/// block hashes in index order.
pub fn manifest_bytes(revision: &RevisionRecord) -> Result<Vec<u8>, UploadError> {
    let mut thumbnails: Vec<_> = revision.thumbnails.iter().collect();
    thumbnails.sort_by_key(|t| match t.kind {
        ThumbnailKind::Default => 0,
        ThumbnailKind::Photo => 1,
    });
    let mut blocks: Vec<_> = revision.blocks.iter().collect();
    blocks.sort_by_key(|b| b.index);

    let hashes = thumbnails
        .iter()
        .map(|t| t.hash.as_str())
        .chain(blocks.iter().map(|b| b.hash.as_str()));

    let mut manifest = Vec::with_capacity((thumbnails.len() + blocks.len()) * 32);
    for hex in hashes {
        let hash = hash_from_hex(hex)
            .map_err(|e| UploadError::Validation(format!("building manifest: {e}")))?;
        manifest.extend_from_slice(hash.as_bytes());
    }
    Ok(manifest)
}

pub async fn commit_revision(
    ctx: &UploadContext,
    file: &FileRecord,
    revision_id: &str,
    session: &RevisionSession,
    metadata: &EncryptionMetadata,
    cancel: &CancellationToken,
) -> Result<CommitResult, UploadError> {
    let revision = ctx
        .store
        .read_revision(revision_id)?
        .ok_or_else(|| UploadError::Validation(format!("revision {revision_id} not found")))?;
    if revision.upload_state != RevisionUploadState::Encrypted {
        return Err(UploadError::Validation(format!(
            "revision {} is {:?}, expected encrypted",
            revision.id, revision.upload_state
        )));
    }

    let request = build_request(ctx, &revision, metadata)?;
    let signature = request.manifest_signature.clone();
    checkpoint(cancel)?;

    let result = match ctx.remote.commit_revision(session, request).await {
        Ok(result) => result,
        Err(e) => {
            let err = UploadError::from(e);
            if err.class() == FailureClass::FatalValidation {
                warn!(revision_id = %revision.id, error = %err, "commit rejected, resetting upload flags");
                ctx.store.transaction(|tx| {
                    let rev = tx.revision_mut(&revision.id)?;
                    rev.unset_uploaded();
                    rev.session = None;
                    Ok::<_, UploadError>(())
                })?;
                ctx.store.persist().await?;
            }
            return Err(err);
        }
    };

    ctx.store.transaction(|tx| {
        let rev = tx.revision_mut(&revision.id)?;
        if !rev.upload_state.can_advance_to(RevisionUploadState::Uploaded) {
            return Err(UploadError::Validation(format!(
                "revision {} cannot move from {:?} to uploaded",
                rev.id, rev.upload_state
            )));
        }
        rev.upload_state = RevisionUploadState::Uploaded;
        rev.manifest_signature = Some(signature);
        rev.session = None;

        let f = tx.file_mut(&file.id)?;
        f.state = FileState::Active;
        f.active_revision = Some(revision.id.clone());
        f.active_revision_draft = None;
        f.last_error = None;
        if !f.revisions.contains(&revision.id) {
            f.revisions.push(revision.id.clone());
        }
        Ok(())
    })?;
    ctx.store.persist().await?;

    remove_block_files(&revision.blocks);
    info!(
        file_id = %file.id,
        revision_id = %revision.id,
        remote_revision_id = %result.revision_id,
        bytes = result.committed_bytes,
        "revision committed"
    );
    Ok(result)
}

fn build_request(
    ctx: &UploadContext,
    revision: &RevisionRecord,
    metadata: &EncryptionMetadata,
) -> Result<CommitRequest, UploadError> {
    let max_block = NonZeroU64::new(ctx.config.max_block_size)
        .ok_or_else(|| UploadError::Validation("max_block_size is 0".into()))?;
    let layout = block_sizes(revision.size, max_block);
    check_layout(&layout, revision.blocks.iter().map(|b| (b.index, b.clear_size)))?;

    let mut blocks = Vec::with_capacity(revision.blocks.len());
    for block in &revision.blocks {
        let token = match (&block.upload_token, block.uploaded) {
            (Some(token), true) => token.clone(),
            _ => {
                return Err(UploadError::Validation(format!(
                    "block {} of revision {} was not acknowledged",
                    block.index, revision.id
                )))
            }
        };
        blocks.push(CommitBlock {
            index: block.index,
            hash: block.hash.clone(),
            token,
        });
    }
    blocks.sort_by_key(|b| b.index);

    let thumbnails = revision
        .thumbnails
        .iter()
        .filter(|t| t.uploaded)
        .map(|t| CommitThumbnail {
            kind: t.kind,
            hash: t.hash.clone(),
        })
        .collect();

    let xattrs = revision.xattrs.clone().ok_or_else(|| {
        UploadError::Validation(format!("revision {} has no extended attributes", revision.id))
    })?;

    Ok(CommitRequest {
        blocks,
        thumbnails,
        manifest_signature: metadata.sign_manifest(&manifest_bytes(revision)?),
        signature_email: metadata.signer_email().to_string(),
        xattrs,
    })
}
