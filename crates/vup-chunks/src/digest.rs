//! Whole-file digest accumulated across blocks.

use sha1::{Digest, Sha1};

use crate::error::ChunkError;

/// Running SHA-1 over the cleartext, fed one block at a time.
///
/// Blocks must be folded in index order starting at 1 so the final digest
/// is the digest of the file, whatever order encryption later completes in.
#[derive(Clone)]
pub struct DigestAccumulator {
    hasher: Sha1,
    next_index: u32,
}

impl DigestAccumulator {
    pub fn new() -> Self {
        Self {
            hasher: Sha1::new(),
            next_index: 1,
        }
    }

    pub fn fold(&mut self, index: u32, cleartext: &[u8]) -> Result<(), ChunkError> {
        if index != self.next_index {
            return Err(ChunkError::DigestOrder {
                expected: self.next_index,
                got: index,
            });
        }
        self.hasher.update(cleartext);
        self.next_index += 1;
        Ok(())
    }

    /// Number of blocks folded so far.
    pub fn blocks_folded(&self) -> u32 {
        self.next_index - 1
    }

    /// Lowercase hex SHA-1 of everything folded.
    pub fn finalize_hex(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

impl Default for DigestAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DigestAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestAccumulator")
            .field("next_index", &self.next_index)
            .finish_non_exhaustive()
    }
}
