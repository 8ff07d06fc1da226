//! vup-upload: the client-side encrypted upload pipeline
//!
//! # Overview
//! - `draft`: File and Revision records plus fresh node keys for a local file
//! - `encrypt`: block, thumbnail and extended-attribute encryptors
//! - `coordinator`: runs the encryptors as a task graph and finalizes the revision
//! - `transfer` / `commit`: resumable upload and remote commit
//! - `retry`: failure classification and exponential backoff
//! - `scheduler`: bounded pool of per-file jobs, pause/cancel, storage budget
//!
//! A job walks a revision through `created → encrypted → uploaded`:
//! ```text
//! resolve keys → [thumbnails ∥ blocks → xattr] → finalize → transfer → commit
//! ```

pub mod commit;
pub mod context;
pub mod control;
pub mod coordinator;
pub mod draft;
pub mod encrypt;
pub mod error;
pub mod events;
pub mod graph;
mod job;
pub mod keys;
pub mod retry;
pub mod scheduler;
pub mod transfer;

pub use context::{no_progress, ProgressFn, UploadContext};
pub use control::{JobControl, StopReason};
pub use coordinator::{CoordinatorState, RevisionEncryptionCoordinator, RunOutcome};
pub use draft::DraftPreparer;
pub use encrypt::blocks::{BlockVerifier, DecryptingVerifier};
pub use encrypt::thumbnail::{Bitmap, ThumbnailCodec, ThumbnailSource};
pub use encrypt::{EncryptionJob, Encryptor};
pub use error::{FailureClass, UploadError};
pub use events::{EventKind, JobOutcome, UploadEvent};
pub use keys::{KeyResolver, KeyringResolver};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{JobHandle, SubmitOutcome, UploadScheduler};
