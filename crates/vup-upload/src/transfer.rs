//! Transfer stage: send an encrypted revision's blocks and thumbnails.
//!
//! Resumable. Only blocks and thumbnails without an `uploaded` flag are
//! sent, and the remote session handle is persisted on the revision so a
//! restarted job keeps using it until it expires. Blocks go out in pages of
//! [`BLOCK_PAGE_SIZE`]; each page's acknowledgements are recorded and
//! flushed together.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vup_core::types::{BlockRecord, FileRecord, RevisionRecord, RevisionSession, RevisionUploadState};
use vup_remote::{BlockAck, BlockUploadRequest, RemoteApi, RemoteError, UploadTarget};

use crate::context::{ProgressFn, UploadContext};
use crate::control::checkpoint;
use crate::error::UploadError;

/// Times one block upload is re-sent after a dropped connection before the
/// failure reaches the job's retry policy.
pub const BLOCK_RESENDS: u32 = 3;

/// Most upload targets asked for in one request. Targets carry short-lived
/// tokens, so they are fetched just before their page is sent.
pub const BLOCK_PAGE_SIZE: usize = 50;

/// Upload everything still pending for `revision_id` and return the session
/// it was uploaded under.
pub async fn transfer_revision(
    ctx: &UploadContext,
    file: &FileRecord,
    revision_id: &str,
    cancel: &CancellationToken,
    progress: &ProgressFn,
) -> Result<RevisionSession, UploadError> {
    checkpoint(cancel)?;
    let revision = read_revision(ctx, revision_id)?;
    if revision.upload_state != RevisionUploadState::Encrypted {
        return Err(UploadError::Validation(format!(
            "revision {} is {:?}, expected encrypted",
            revision.id, revision.upload_state
        )));
    }

    let session = open_session(ctx, file, &revision).await?;
    upload_pages(ctx, &revision, &session, cancel, progress).await?;
    Ok(session)
}

async fn open_session(
    ctx: &UploadContext,
    file: &FileRecord,
    revision: &RevisionRecord,
) -> Result<RevisionSession, UploadError> {
    if let Some(session) = &revision.session {
        ctx.remote.check_session(session).await?;
        debug!(revision_id = %revision.id, session_id = %session.session_id, "reusing revision session");
        return Ok(session.clone());
    }

    let session = ctx.remote.request_revision_session(&file.id).await?;
    let persisted = session.clone();
    ctx.store.transaction(|tx| {
        tx.revision_mut(&revision.id)?.session = Some(persisted);
        Ok::<_, UploadError>(())
    })?;
    ctx.store.persist().await?;
    info!(revision_id = %revision.id, session_id = %session.session_id, "opened revision session");
    Ok(session)
}

/// Send pending blocks page by page; thumbnails ride along with the last page.
async fn upload_pages(
    ctx: &UploadContext,
    revision: &RevisionRecord,
    session: &RevisionSession,
    cancel: &CancellationToken,
    progress: &ProgressFn,
) -> Result<(), UploadError> {
    let total = revision.blocks.len();
    let mut done = revision.uploaded_blocks().count();
    let pending: Vec<&BlockRecord> = revision.blocks.iter().filter(|b| !b.uploaded).collect();
    let pages: Vec<&[&BlockRecord]> = pending.chunks(BLOCK_PAGE_SIZE).collect();
    let page_count = pages.len().max(1);
    if !pending.is_empty() {
        info!(revision_id = %revision.id, pending = pending.len(), total, pages = page_count, "uploading blocks");
    }

    for number in 0..page_count {
        let page = pages.get(number).copied().unwrap_or_default();
        let mut acks = Vec::with_capacity(page.len());
        let base = done;
        let report = |acked: usize| progress((base + acked) as f64 / total as f64);
        let mut sent = upload_page(ctx, revision, session, page, cancel, &mut acks, &report).await;
        done += acks.len();

        if sent.is_ok() && number + 1 == page_count {
            sent = upload_thumbnails(ctx, revision, session, cancel).await;
        }
        // acknowledged blocks are kept even when the rest of the page failed
        record_acks(ctx, &revision.id, &acks).await?;
        sent?;

        debug!(revision_id = %revision.id, page = number + 1, pages = page_count, done, total, "page uploaded");
    }
    progress(1.0);
    Ok(())
}

async fn upload_thumbnails(
    ctx: &UploadContext,
    revision: &RevisionRecord,
    session: &RevisionSession,
    cancel: &CancellationToken,
) -> Result<(), UploadError> {
    for thumb in revision.thumbnails.iter().filter(|t| !t.uploaded) {
        checkpoint(cancel)?;
        ctx.remote
            .upload_thumbnail(session, thumb.kind, &thumb.encrypted)
            .await?;
        let kind = thumb.kind;
        ctx.store.transaction(|tx| {
            let rev = tx.revision_mut(&revision.id)?;
            if let Some(t) = rev.thumbnails.iter_mut().find(|t| t.kind == kind) {
                t.uploaded = true;
            }
            Ok::<_, UploadError>(())
        })?;
        debug!(revision_id = %revision.id, kind = ?kind, "thumbnail uploaded");
    }
    Ok(())
}

/// Request targets for one page and send its blocks. Every ack received is
/// pushed to `acks`, including those that arrived before a failure, and
/// `report` sees the running count.
async fn upload_page(
    ctx: &UploadContext,
    revision: &RevisionRecord,
    session: &RevisionSession,
    page: &[&BlockRecord],
    cancel: &CancellationToken,
    acks: &mut Vec<BlockAck>,
    report: &(dyn Fn(usize) + Send + Sync),
) -> Result<(), UploadError> {
    if page.is_empty() {
        return Ok(());
    }
    let requests: Vec<BlockUploadRequest> = page
        .iter()
        .map(|b| BlockUploadRequest {
            index: b.index,
            size: b.size,
            hash: b.hash.clone(),
        })
        .collect();
    checkpoint(cancel)?;
    let targets = ctx
        .remote
        .request_block_upload_targets(session, &requests)
        .await?;
    if targets.len() != page.len() {
        return Err(UploadError::Validation(format!(
            "asked for {} upload targets, got {}",
            page.len(),
            targets.len()
        )));
    }

    let mut set = JoinSet::new();
    for (block, target) in page.iter().zip(targets) {
        if block.index != target.index {
            set.shutdown().await;
            return Err(UploadError::Validation(format!(
                "upload target for block {} answered for block {}",
                block.index, target.index
            )));
        }
        let remote = ctx.remote.clone();
        let slots = ctx.transfer_slots.clone();
        let path = block.local_path.clone();
        set.spawn(async move {
            let _permit = slots
                .acquire_owned()
                .await
                .map_err(|_| UploadError::Cancelled)?;
            upload_with_resend(remote, target, path).await
        });
    }

    loop {
        let joined = tokio::select! {
            _ = cancel.cancelled() => {
                set.shutdown().await;
                return Err(UploadError::Cancelled);
            }
            joined = set.join_next() => joined,
        };
        let Some(joined) = joined else {
            return Ok(());
        };

        match joined {
            Ok(Ok(ack)) => {
                debug!(revision_id = %revision.id, index = ack.index, "block uploaded");
                acks.push(ack);
                report(acks.len());
            }
            Ok(Err(e)) => {
                set.shutdown().await;
                return Err(e);
            }
            Err(e) => {
                set.shutdown().await;
                return Err(UploadError::Validation(format!("block upload task failed: {e}")));
            }
        }
    }
}

/// Mark a page's acknowledged blocks uploaded in one unit of work and flush.
async fn record_acks(ctx: &UploadContext, revision_id: &str, acks: &[BlockAck]) -> Result<(), UploadError> {
    if !acks.is_empty() {
        ctx.store.transaction(|tx| {
            let rev = tx.revision_mut(revision_id)?;
            for ack in acks {
                if let Some(b) = rev.blocks.iter_mut().find(|b| b.index == ack.index) {
                    b.uploaded = true;
                    b.upload_token = Some(ack.token.clone());
                }
            }
            Ok::<_, UploadError>(())
        })?;
    }
    ctx.store.persist().await?;
    Ok(())
}

async fn upload_with_resend(
    remote: Arc<dyn RemoteApi>,
    target: UploadTarget,
    path: PathBuf,
) -> Result<BlockAck, UploadError> {
    let mut resends = 0;
    loop {
        match remote.upload_block(&target, &path).await {
            Err(RemoteError::ConnectionLost(msg)) if resends < BLOCK_RESENDS => {
                resends += 1;
                warn!(index = target.index, resends, error = %msg, "connection lost, re-sending block");
            }
            other => return other.map_err(UploadError::from),
        }
    }
}

fn read_revision(ctx: &UploadContext, revision_id: &str) -> Result<RevisionRecord, UploadError> {
    ctx.store
        .read_revision(revision_id)?
        .ok_or_else(|| UploadError::Validation(format!("revision {revision_id} not found")))
}
