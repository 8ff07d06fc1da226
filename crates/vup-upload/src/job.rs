//! One File's upload job: attempts, retries and terminal bookkeeping.

use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use vup_core::types::{FileRecord, FileState, RevisionRecord, RevisionUploadState};

use crate::commit::commit_revision;
use crate::context::{ProgressFn, UploadContext};
use crate::control::{checkpoint, JobControl, StopReason};
use crate::coordinator::RevisionEncryptionCoordinator;
use crate::encrypt::blocks::remove_block_files;
use crate::encrypt::EncryptionJob;
use crate::error::{FailureClass, UploadError};
use crate::events::{EventKind, JobOutcome, UploadEvent};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transfer::transfer_revision;

pub(crate) struct UploadJob {
    pub ctx: UploadContext,
    pub file_id: String,
    pub control: Arc<JobControl>,
    pub policy: RetryPolicy,
    pub events: broadcast::Sender<UploadEvent>,
}

impl UploadJob {
    pub async fn run(&self) -> JobOutcome {
        let mut failed = 0u32;
        loop {
            let err = match self.attempt().await {
                Ok(()) => return JobOutcome::Completed,
                Err(e) => e,
            };
            if let Some(reason) = self.control.reason() {
                return self.stopped(reason).await;
            }

            failed += 1;
            let class = err.class();
            if class == FailureClass::FatalQuota {
                info!(file_id = %self.file_id, error = %err, "waiting for storage budget");
                return match self.set_state(FileState::Waiting, None).await {
                    Ok(()) => JobOutcome::Waiting,
                    Err(e) => self.fail(&e).await,
                };
            }

            match self.policy.decide(class, failed) {
                RetryDecision::Retry { attempt, delay } => {
                    warn!(
                        file_id = %self.file_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "upload attempt failed, retrying"
                    );
                    if class == FailureClass::RetryableExpiredResource {
                        if let Err(e) = self.regenerate_draft().await {
                            return self.fail(&e).await;
                        }
                    }
                    self.emit(EventKind::Retrying { attempt, delay });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.control.token().cancelled() => {
                            let reason = self.control.reason().unwrap_or(StopReason::Pause);
                            return self.stopped(reason).await;
                        }
                    }
                }
                RetryDecision::GiveUp => return self.fail(&err).await,
            }
        }
    }

    async fn attempt(&self) -> Result<(), UploadError> {
        checkpoint(self.control.token())?;
        let file = self.file()?;
        let revision = draft_revision(&self.ctx, &file)?;
        let cancel = self.control.token().child_token();

        let metadata = Arc::new(self.ctx.keys.resolve(&file).await?);
        self.emit(EventKind::Progress { fraction: 0.0 });

        if revision.upload_state == RevisionUploadState::Created {
            let job = Arc::new(EncryptionJob {
                ctx: self.ctx.clone(),
                file: file.clone(),
                revision_id: revision.id.clone(),
                metadata: metadata.clone(),
                cancel: cancel.clone(),
                progress: self.scaled_progress(0.0, 0.5),
                digest: OnceLock::new(),
            });
            RevisionEncryptionCoordinator::new().run(job).await?;
        }

        let session = transfer_revision(
            &self.ctx,
            &file,
            &revision.id,
            &cancel,
            &self.scaled_progress(0.5, 0.95),
        )
        .await?;
        commit_revision(&self.ctx, &file, &revision.id, &session, &metadata, &cancel).await?;
        self.emit(EventKind::Progress { fraction: 1.0 });
        Ok(())
    }

    async fn stopped(&self, reason: StopReason) -> JobOutcome {
        match reason {
            StopReason::Pause => match self.set_state(FileState::PausedUpload, None).await {
                Ok(()) => {
                    info!(file_id = %self.file_id, "upload paused");
                    JobOutcome::Paused
                }
                Err(e) => self.fail(&e).await,
            },
            StopReason::Cancel => match discard_draft(&self.ctx, &self.file_id).await {
                Ok(()) => JobOutcome::Cancelled,
                Err(e) => self.fail(&e).await,
            },
        }
    }

    async fn fail(&self, err: &UploadError) -> JobOutcome {
        let category = err.category().to_string();
        error!(file_id = %self.file_id, error = %err, category = %category, "upload failed");
        if let Err(e) = self
            .set_state(FileState::PausedUpload, Some(category.clone()))
            .await
        {
            error!(file_id = %self.file_id, error = %e, "failed to record upload failure");
        }
        JobOutcome::Failed { category }
    }

    /// Fresh upload id and an empty `created` revision, for when the remote
    /// session behind the current draft has expired. The old session is
    /// discarded remotely in case the remote still holds it.
    async fn regenerate_draft(&self) -> Result<(), UploadError> {
        let upload_id = Uuid::new_v4();
        let new_id = upload_id.to_string();
        let file_id = self.file_id.clone();

        let old = self.ctx.store.transaction(|tx| {
            let file = tx.file(&file_id)?.clone();
            let source = file.source_path.clone().ok_or_else(|| {
                UploadError::Validation(format!("file {file_id} has no local source to re-read"))
            })?;
            let old = match &file.active_revision_draft {
                Some(id) => tx.remove_revision(id),
                None => None,
            };

            tx.put_revision(RevisionRecord {
                id: new_id.clone(),
                file_id: file_id.clone(),
                upload_state: RevisionUploadState::Created,
                size: file.size,
                encrypted_size: 0,
                cleartext_path: Some(source),
                modification_time: old.as_ref().and_then(|r| r.modification_time),
                xattrs: None,
                signature_address: None,
                manifest_signature: None,
                blocks: Vec::new(),
                thumbnails: Vec::new(),
                session: None,
                media: old.as_ref().and_then(|r| r.media.clone()),
            });
            let f = tx.file_mut(&file_id)?;
            f.upload_id = Some(upload_id);
            f.active_revision_draft = Some(new_id.clone());
            Ok::<_, UploadError>(old)
        })?;

        self.ctx.store.persist().await?;

        if let Some(old) = old {
            if let Some(session) = &old.session {
                if let Err(e) = self.ctx.remote.discard_revision_session(session).await {
                    warn!(file_id = %self.file_id, session_id = %session.session_id, error = %e, "failed to discard expired session");
                }
            }
            remove_block_files(&old.blocks);
        }
        info!(file_id = %self.file_id, upload_id = %upload_id, "regenerated draft after session expiry");
        Ok(())
    }

    fn file(&self) -> Result<FileRecord, UploadError> {
        self.ctx
            .store
            .read_file(&self.file_id)?
            .ok_or_else(|| UploadError::Validation(format!("file {} not found", self.file_id)))
    }

    async fn set_state(&self, state: FileState, last_error: Option<String>) -> Result<(), UploadError> {
        self.ctx.store.transaction(|tx| {
            let f = tx.file_mut(&self.file_id)?;
            f.state = state;
            f.last_error = last_error;
            Ok::<_, UploadError>(())
        })?;
        self.ctx.store.persist().await?;
        Ok(())
    }

    fn emit(&self, kind: EventKind) {
        let _ = self.events.send(UploadEvent {
            file_id: self.file_id.clone(),
            kind,
        });
    }

    /// Report stage progress as a slice `[from, to]` of the whole job.
    fn scaled_progress(&self, from: f64, to: f64) -> ProgressFn {
        let events = self.events.clone();
        let file_id = self.file_id.clone();
        Arc::new(move |fraction: f64| {
            let _ = events.send(UploadEvent {
                file_id: file_id.clone(),
                kind: EventKind::Progress {
                    fraction: from + (to - from) * fraction.clamp(0.0, 1.0),
                },
            });
        })
    }
}

fn draft_revision(ctx: &UploadContext, file: &FileRecord) -> Result<RevisionRecord, UploadError> {
    let id = file.active_revision_draft.as_deref().ok_or_else(|| {
        UploadError::Validation(format!("file {} has no revision draft", file.id))
    })?;
    ctx.store
        .read_revision(id)?
        .ok_or_else(|| UploadError::Validation(format!("revision {id} not found")))
}

/// Throw away a file's draft: remote session, cached ciphertext and records.
pub(crate) async fn discard_draft(ctx: &UploadContext, file_id: &str) -> Result<(), UploadError> {
    let Some(file) = ctx.store.read_file(file_id)? else {
        return Ok(());
    };
    let revision = match &file.active_revision_draft {
        Some(id) => ctx.store.read_revision(id)?,
        None => None,
    };

    if let Some(session) = revision.as_ref().and_then(|r| r.session.as_ref()) {
        if let Err(e) = ctx.remote.discard_revision_session(session).await {
            warn!(file_id, session_id = %session.session_id, error = %e, "failed to discard remote session");
        }
    }

    ctx.store.transaction(|tx| {
        if let Some(rev) = &revision {
            tx.remove_revision(&rev.id);
        }
        let f = tx.file_mut(file_id)?;
        f.state = if f.active_revision.is_some() {
            FileState::Active
        } else {
            FileState::Deleted
        };
        f.active_revision_draft = None;
        f.upload_id = None;
        Ok::<_, UploadError>(())
    })?;
    ctx.store.persist().await?;

    if let Some(rev) = &revision {
        remove_block_files(&rev.blocks);
    }
    info!(file_id, "draft discarded");
    Ok(())
}
