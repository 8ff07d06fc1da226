//! Upload scheduler: owns every in-flight job and the storage budget.
//!
//! All bookkeeping (running jobs, budget reservations) lives behind one
//! async mutex. A bounded pool caps how many files run at once; each job's
//! internal fan-out is bounded separately.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot, Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use vup_core::types::{FileRecord, FileState};

use crate::context::UploadContext;
use crate::control::{JobControl, StopReason};
use crate::encrypt::blocks::sweep_orphaned_blocks;
use crate::encrypt::join_error;
use crate::error::UploadError;
use crate::events::{EventKind, JobOutcome, UploadEvent};
use crate::job::{discard_draft, UploadJob};
use crate::retry::RetryPolicy;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub enum SubmitOutcome {
    Started(JobHandle),
    /// A job for this file is already in flight; nothing was started
    AlreadyUploading,
}

impl SubmitOutcome {
    pub fn into_handle(self) -> Option<JobHandle> {
        match self {
            SubmitOutcome::Started(handle) => Some(handle),
            SubmitOutcome::AlreadyUploading => None,
        }
    }
}

#[derive(Debug)]
pub struct JobHandle {
    file_id: String,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub async fn wait(self) -> JobOutcome {
        self.outcome.await.unwrap_or_else(|_| JobOutcome::Failed {
            category: "upload aborted".into(),
        })
    }
}

struct RunningJob {
    upload_id: Option<Uuid>,
    control: Arc<JobControl>,
    generation: u64,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<String, RunningJob>,
    /// Bytes admitted against the storage budget, per file
    reservations: HashMap<String, u64>,
    next_generation: u64,
}

struct Inner {
    ctx: UploadContext,
    pool: Arc<Semaphore>,
    state: Mutex<SchedulerState>,
    events: broadcast::Sender<UploadEvent>,
    policy: RetryPolicy,
}

#[derive(Clone)]
pub struct UploadScheduler {
    inner: Arc<Inner>,
}

impl UploadScheduler {
    pub fn new(ctx: UploadContext) -> Self {
        let policy = RetryPolicy::from_config(&ctx.config);
        Self::with_policy(ctx, policy)
    }

    pub fn with_policy(ctx: UploadContext, policy: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let pool = Arc::new(Semaphore::new(ctx.config.max_concurrent_files.max(1)));
        Self {
            inner: Arc::new(Inner {
                ctx,
                pool,
                state: Mutex::new(SchedulerState::default()),
                events,
                policy,
            }),
        }
    }

    pub fn context(&self) -> &UploadContext {
        &self.inner.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    pub async fn active_jobs(&self) -> usize {
        self.inner.state.lock().await.jobs.len()
    }

    /// Start uploading `file_id`, resuming from whatever state its draft is in.
    pub async fn submit(&self, file_id: &str) -> Result<SubmitOutcome, UploadError> {
        let file = self.read_file(file_id)?;
        let mut state = self.inner.state.lock().await;
        if state.jobs.contains_key(file_id) {
            debug!(file_id, "already uploading");
            return Ok(SubmitOutcome::AlreadyUploading);
        }
        self.start_locked(&mut state, file).map(SubmitOutcome::Started)
    }

    /// Suspend a running job, keeping its encrypted state. Returns whether
    /// a job was signalled.
    pub async fn pause(&self, file_id: &str) -> bool {
        let state = self.inner.state.lock().await;
        match state.jobs.get(file_id) {
            Some(job) => {
                job.control.stop(StopReason::Pause);
                true
            }
            None => false,
        }
    }

    /// Abort the upload identified by `upload_id` and discard its draft,
    /// whether or not a job is currently running for it.
    pub async fn cancel(&self, upload_id: Uuid) -> Result<bool, UploadError> {
        let Some(file) = self.inner.ctx.store.file_by_upload_id(upload_id)? else {
            return Ok(false);
        };
        let state = self.inner.state.lock().await;
        if let Some(job) = state.jobs.get(&file.id) {
            job.control.stop(StopReason::Cancel);
            return Ok(true);
        }
        drop(state);

        if file.state.is_committed() && file.active_revision_draft.is_none() {
            return Ok(false);
        }
        discard_draft(&self.inner.ctx, &file.id).await?;
        self.emit(&file.id, EventKind::Cancelled);
        Ok(true)
    }

    /// Resubmit every file a previous process left mid-upload, after
    /// clearing cached blocks that no revision refers to any more.
    pub async fn restart_interrupted_jobs(&self) -> Result<Vec<JobHandle>, UploadError> {
        self.sweep_block_cache().await?;
        let interrupted: Vec<FileRecord> = self
            .inner
            .ctx
            .store
            .files_in_states(&[FileState::Uploading])?
            .into_iter()
            .filter(|f| f.state.is_interrupted_upload())
            .collect();

        let mut handles = Vec::with_capacity(interrupted.len());
        for file in interrupted {
            info!(file_id = %file.id, "restarting interrupted upload");
            if let Some(handle) = self.submit(&file.id).await?.into_handle() {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    /// Remove orphaned ciphertext from the cache. Skipped while any job
    /// runs: a block stage writes its files before it records them.
    async fn sweep_block_cache(&self) -> Result<usize, UploadError> {
        let state = self.inner.state.lock().await;
        if !state.jobs.is_empty() {
            debug!(running = state.jobs.len(), "skipping block cache sweep");
            return Ok(0);
        }
        let referenced = self.inner.ctx.store.block_paths()?;
        let cache_dir = self.inner.ctx.cache_dir.clone();
        let orphans = tokio::task::spawn_blocking(move || sweep_orphaned_blocks(&cache_dir, &referenced))
            .await
            .map_err(|e| join_error("cache sweep", e))??;
        drop(state);

        if orphans > 0 {
            info!(orphans, "removed orphaned cached blocks");
        }
        Ok(orphans)
    }

    /// Re-admit `waiting` files, oldest first, while they fit in
    /// `available_bytes` minus what running jobs already reserved.
    pub async fn on_storage_budget_changed(
        &self,
        available_bytes: u64,
    ) -> Result<Vec<JobHandle>, UploadError> {
        let waiting = self
            .inner
            .ctx
            .store
            .files_in_states(&[FileState::Waiting])?;

        let mut state = self.inner.state.lock().await;
        let reserved: u64 = state.reservations.values().sum();
        let mut budget = available_bytes.saturating_sub(reserved);
        let mut handles = Vec::new();

        for file in waiting {
            if state.jobs.contains_key(&file.id) {
                continue;
            }
            if file.size > budget {
                debug!(file_id = %file.id, size = file.size, budget, "budget exhausted");
                break;
            }
            budget -= file.size;
            state.reservations.insert(file.id.clone(), file.size);
            let file_id = file.id.clone();
            match self.start_locked(&mut state, file) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    state.reservations.remove(&file_id);
                    return Err(e);
                }
            }
        }
        info!(available_bytes, admitted = handles.len(), "storage budget changed");
        Ok(handles)
    }

    fn start_locked(
        &self,
        state: &mut SchedulerState,
        file: FileRecord,
    ) -> Result<JobHandle, UploadError> {
        if !matches!(
            file.state,
            FileState::Uploading | FileState::Waiting | FileState::PausedUpload
        ) {
            return Err(UploadError::Validation(format!(
                "file {} is {:?}, nothing to upload",
                file.id, file.state
            )));
        }

        // another job still holding this draft is stale
        if let Some(upload_id) = file.upload_id {
            for (id, job) in state.jobs.iter() {
                if id != &file.id && job.upload_id == Some(upload_id) {
                    warn!(file_id = %id, upload_id = %upload_id, "cancelling stale job for draft");
                    job.control.stop(StopReason::Cancel);
                }
            }
        }

        self.inner.ctx.store.transaction(|tx| {
            let f = tx.file_mut(&file.id)?;
            f.state = FileState::Uploading;
            f.last_error = None;
            Ok::<_, UploadError>(())
        })?;

        let control = Arc::new(JobControl::new());
        let generation = state.next_generation;
        state.next_generation += 1;
        state.jobs.insert(
            file.id.clone(),
            RunningJob {
                upload_id: file.upload_id,
                control: control.clone(),
                generation,
            },
        );

        let (tx, rx) = oneshot::channel();
        let job = UploadJob {
            ctx: self.inner.ctx.clone(),
            file_id: file.id.clone(),
            control,
            policy: self.inner.policy.clone(),
            events: self.inner.events.clone(),
        };
        self.emit(&file.id, EventKind::Queued);

        let scheduler = self.clone();
        tokio::spawn(async move {
            let permit = tokio::select! {
                permit = scheduler.inner.pool.clone().acquire_owned() => permit.ok(),
                _ = job.control.token().cancelled() => None,
            };
            if permit.is_some() {
                scheduler.emit(&job.file_id, EventKind::Started);
                info!(file_id = %job.file_id, "upload started");
            }

            let outcome = job.run().await;
            drop(permit);

            scheduler.finish(&job.file_id, generation).await;
            scheduler.emit(&job.file_id, outcome.event());
            let _ = tx.send(outcome);
        });

        Ok(JobHandle {
            file_id: file.id,
            outcome: rx,
        })
    }

    async fn finish(&self, file_id: &str, generation: u64) {
        let mut state = self.inner.state.lock().await;
        if state.jobs.get(file_id).map(|j| j.generation) == Some(generation) {
            state.jobs.remove(file_id);
        }
        state.reservations.remove(file_id);
    }

    fn read_file(&self, file_id: &str) -> Result<FileRecord, UploadError> {
        self.inner
            .ctx
            .store
            .read_file(file_id)?
            .ok_or_else(|| UploadError::Validation(format!("file {file_id} not found")))
    }

    fn emit(&self, file_id: &str, kind: EventKind) {
        let _ = self.inner.events.send(UploadEvent {
            file_id: file_id.to_string(),
            kind,
        });
    }
}
