//! Cooperative stop signal for one upload job.

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::error::UploadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Keep finalized state; the file can be resubmitted later
    Pause,
    /// Discard the draft
    Cancel,
}

/// Level-triggered stop flag shared by every stage of a job.
#[derive(Debug, Default)]
pub struct JobControl {
    token: CancellationToken,
    reason: Mutex<Option<StopReason>>,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. The first reason wins; cancel upgrades a pending pause.
    pub fn stop(&self, reason: StopReason) {
        if let Ok(mut current) = self.reason.lock() {
            match (*current, reason) {
                (None, r) | (Some(StopReason::Pause), r @ StopReason::Cancel) => {
                    *current = Some(r)
                }
                _ => {}
            }
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.lock().ok().and_then(|r| *r)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Fail with `Cancelled` once `token` has fired.
pub fn checkpoint(token: &CancellationToken) -> Result<(), UploadError> {
    if token.is_cancelled() {
        Err(UploadError::Cancelled)
    } else {
        Ok(())
    }
}
