use thiserror::Error;

/// The bytes on disk disagree with the block layout computed for the revision.
///
/// Never retried: re-reading a file that changed underneath us would upload
/// content that does not match the declared size.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("block {index}: expected {expected} cleartext bytes, got {actual}")]
    SizeMismatch { index: u32, expected: u64, actual: u64 },

    #[error("block {index}: end of file before {expected_count} expected blocks")]
    UnexpectedEof { index: u32, expected_count: usize },

    #[error("data remains after the {expected_count} expected blocks")]
    TrailingData { expected_count: usize },

    #[error("block {index} has zero cleartext size")]
    EmptyBlock { index: u32 },

    #[error("expected {expected} blocks, found {actual}")]
    CountMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("digest folded out of order: expected block {expected}, got {got}")]
    DigestOrder { expected: u32, got: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
