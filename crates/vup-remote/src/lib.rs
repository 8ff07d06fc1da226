//! vup-remote: the network transfer layer consumed by the upload pipeline
//!
//! `RemoteApi` is the contract; `OpendalRemote` implements it on top of any
//! OpenDAL operator (local fs for single-machine use, memory for tests), with
//! expiring revision sessions, per-block upload credentials, hash-checked
//! commits and an optional storage quota.

pub mod api;
pub mod error;
pub mod health;
pub mod operator;
pub mod opendal_remote;

pub use api::{
    BlockAck, BlockUploadRequest, CommitBlock, CommitRequest, CommitResult, CommitThumbnail,
    RemoteApi, UploadTarget,
};
pub use error::{RemoteError, RemoteResult};
pub use opendal_remote::OpendalRemote;
pub use health::{check_health, HealthReport};
pub use operator::build_operator;
