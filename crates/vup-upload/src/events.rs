//! Job progress and lifecycle notifications.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct UploadEvent {
    pub file_id: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Accepted, waiting for a worker slot
    Queued,
    Started,
    /// Fraction of the whole job done, 0.0 to 1.0
    Progress { fraction: f64 },
    /// Attempt `attempt` starts after `delay`
    Retrying { attempt: u32, delay: Duration },
    Completed,
    Waiting,
    Paused,
    Cancelled,
    Failed { category: String },
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Completed
                | EventKind::Waiting
                | EventKind::Paused
                | EventKind::Cancelled
                | EventKind::Failed { .. }
        )
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Parked on remote quota until budget frees up
    Waiting,
    Paused,
    Cancelled,
    Failed { category: String },
}

impl JobOutcome {
    pub fn event(&self) -> EventKind {
        match self {
            JobOutcome::Completed => EventKind::Completed,
            JobOutcome::Waiting => EventKind::Waiting,
            JobOutcome::Paused => EventKind::Paused,
            JobOutcome::Cancelled => EventKind::Cancelled,
            JobOutcome::Failed { category } => EventKind::Failed {
                category: category.clone(),
            },
        }
    }
}
