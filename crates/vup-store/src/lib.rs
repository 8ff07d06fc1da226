//! vup-store: local persistent metadata for uploads in progress.
//!
//! Records are held in memory and persisted as one JSON document, written
//! atomically (temp file, then rename). A unit of work only changes memory
//! and marks the store dirty; callers flush at their durability points,
//! from async code through the blocking pool. A unit of work that returns
//! an error is rolled back from its undo log.

mod store;

pub use store::{MetadataStore, StoreError, StoreResult, Transaction};
