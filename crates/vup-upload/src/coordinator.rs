//! Revision encryption coordinator.
//!
//! One instance per attempt. Runs thumbnails and blocks side by side, the
//! extended attributes after blocks, then finalizes the revision to
//! `encrypted` in a single store transaction.

use std::num::NonZeroU64;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use vup_chunks::{block_sizes, check_layout};
use vup_core::types::RevisionUploadState;

use crate::control::checkpoint;
use crate::encrypt::blocks::remove_block_files;
use crate::encrypt::{BlockEncryptor, EncryptionJob, Encryptor, ThumbnailEncryptor, XAttrEncryptor};
use crate::error::UploadError;
use crate::graph::{FailurePolicy, TaskGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The revision is now `encrypted`
    Finalized,
    /// This coordinator already ran or is running; nothing was done
    Skipped,
}

pub struct RevisionEncryptionCoordinator {
    state: Mutex<CoordinatorState>,
}

impl Default for RevisionEncryptionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RevisionEncryptionCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CoordinatorState::Idle),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(CoordinatorState::Failed)
    }

    pub async fn run(&self, job: Arc<EncryptionJob>) -> Result<RunOutcome, UploadError> {
        if !self.transition(CoordinatorState::Idle, CoordinatorState::Running) {
            debug!(revision_id = %job.revision_id, state = ?self.state(), "coordinator already started");
            return Ok(RunOutcome::Skipped);
        }

        let result = execute(&job).await;
        let terminal = match &result {
            Ok(()) => CoordinatorState::Completed,
            Err(UploadError::Cancelled) => CoordinatorState::Cancelled,
            Err(_) => CoordinatorState::Failed,
        };
        self.transition(CoordinatorState::Running, terminal);

        match result {
            Ok(()) => Ok(RunOutcome::Finalized),
            Err(e) => {
                discard_unfinalized(&job);
                Err(e)
            }
        }
    }

    fn transition(&self, from: CoordinatorState, to: CoordinatorState) -> bool {
        match self.state.lock() {
            Ok(mut state) if *state == from => {
                *state = to;
                true
            }
            _ => false,
        }
    }
}

async fn execute(job: &Arc<EncryptionJob>) -> Result<(), UploadError> {
    let revision = job.revision()?;
    if revision.upload_state != RevisionUploadState::Created {
        return Err(UploadError::Validation(format!(
            "revision {} is {:?}, expected created",
            revision.id, revision.upload_state
        )));
    }
    info!(revision_id = %job.revision_id, size = revision.size, "encrypting revision");

    let mut graph = TaskGraph::new();
    // an empty layout still runs the block stage: it confirms the file is still empty
    let blocks = graph.add("blocks", &[], FailurePolicy::Fatal, stage(Arc::new(BlockEncryptor), job.clone()));
    let xattr = graph.add("xattr", &[blocks], FailurePolicy::Fatal, stage(Arc::new(XAttrEncryptor), job.clone()));
    if revision.size == 0 {
        graph.add("finalize", &[xattr], FailurePolicy::Fatal, finalize(job.clone()));
    } else {
        let thumbnails = graph.add(
            "thumbnails",
            &[],
            FailurePolicy::Optional,
            stage(Arc::new(ThumbnailEncryptor), job.clone()),
        );
        graph.add("finalize", &[thumbnails, xattr], FailurePolicy::Fatal, finalize(job.clone()));
    }
    graph.run(&job.cancel).await
}

async fn stage(encryptor: Arc<dyn Encryptor>, job: Arc<EncryptionJob>) -> Result<(), UploadError> {
    debug!(revision_id = %job.revision_id, stage = encryptor.name(), "stage started");
    encryptor.run(job).await
}

async fn finalize(job: Arc<EncryptionJob>) -> Result<(), UploadError> {
    checkpoint(&job.cancel)?;
    let max_block = NonZeroU64::new(job.ctx.config.max_block_size)
        .ok_or_else(|| UploadError::Validation("max_block_size is 0".into()))?;

    job.ctx.store.transaction(|tx| {
        let rev = tx.revision_mut(&job.revision_id)?;
        if !rev.upload_state.can_advance_to(RevisionUploadState::Encrypted) {
            return Err(UploadError::Validation(format!(
                "revision {} cannot move from {:?} to encrypted",
                rev.id, rev.upload_state
            )));
        }
        let layout = block_sizes(rev.size, max_block);
        check_layout(&layout, rev.blocks.iter().map(|b| (b.index, b.clear_size)))?;
        if rev.xattrs.is_none() {
            return Err(UploadError::Validation(format!(
                "revision {} has no extended attributes",
                rev.id
            )));
        }
        rev.upload_state = RevisionUploadState::Encrypted;
        rev.cleartext_path = None;
        Ok(())
    })?;
    job.ctx.store.persist().await?;
    info!(revision_id = %job.revision_id, "revision encrypted");
    Ok(())
}

/// Drop blocks persisted by a stage whose revision never reached `encrypted`.
fn discard_unfinalized(job: &EncryptionJob) {
    let taken = job.ctx.store.transaction(|tx| {
        let rev = tx.revision_mut(&job.revision_id)?;
        if rev.upload_state != RevisionUploadState::Created {
            return Ok::<_, UploadError>(Vec::new());
        }
        rev.encrypted_size = 0;
        Ok(std::mem::take(&mut rev.blocks))
    });
    match taken {
        Ok(blocks) => {
            if !blocks.is_empty() {
                debug!(revision_id = %job.revision_id, blocks = blocks.len(), "discarding unfinalized blocks");
            }
            remove_block_files(&blocks);
        }
        Err(e) => warn!(revision_id = %job.revision_id, error = %e, "failed to discard unfinalized blocks"),
    }
}
