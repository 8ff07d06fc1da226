//! Oracle-checked block reader.
//!
//! Reads a cleartext file in windows of whole blocks, verifying every block
//! against the layout from [`crate::layout::block_sizes`] and folding it into
//! the whole-file digest as it goes. Serial encryption uses a window of one.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::digest::DigestAccumulator;
use crate::error::{ChunkError, IntegrityError};

/// One cleartext block as read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    /// 1-based
    pub index: u32,
    pub data: Vec<u8>,
}

pub struct BlockReader<R = BufReader<File>> {
    source: R,
    expected: Vec<u64>,
    position: usize,
    digest: DigestAccumulator,
}

impl BlockReader<BufReader<File>> {
    pub fn open(path: &Path, expected: Vec<u64>) -> Result<Self, ChunkError> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file), expected))
    }
}

impl<R: Read> BlockReader<R> {
    pub fn new(source: R, expected: Vec<u64>) -> Self {
        Self {
            source,
            expected,
            position: 0,
            digest: DigestAccumulator::new(),
        }
    }

    pub fn expected_count(&self) -> usize {
        self.expected.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.position >= self.expected.len()
    }

    /// Read up to `window` blocks. Returns an empty vec once every expected
    /// block has been read and the source is confirmed to be at EOF.
    pub fn next_window(&mut self, window: usize) -> Result<Vec<RawBlock>, ChunkError> {
        let window = window.max(1);
        let mut out = Vec::with_capacity(window);

        while out.len() < window && self.position < self.expected.len() {
            let index = (self.position + 1) as u32;
            let want = self.expected[self.position];
            let data = self.read_exact_or_short(want)?;

            if data.is_empty() {
                return Err(IntegrityError::UnexpectedEof {
                    index,
                    expected_count: self.expected.len(),
                }
                .into());
            }
            if data.len() as u64 != want {
                return Err(IntegrityError::SizeMismatch {
                    index,
                    expected: want,
                    actual: data.len() as u64,
                }
                .into());
            }

            self.digest.fold(index, &data)?;
            tracing::trace!(index, bytes = data.len(), "read block");
            out.push(RawBlock { index, data });
            self.position += 1;
        }

        if self.is_exhausted() {
            self.ensure_eof()?;
        }
        Ok(out)
    }

    /// Consume the reader, returning the whole-file digest. Fails if any
    /// expected block was not read.
    pub fn finish(mut self) -> Result<String, ChunkError> {
        if !self.is_exhausted() {
            return Err(IntegrityError::CountMismatch {
                expected: self.expected.len(),
                actual: self.position,
            }
            .into());
        }
        self.ensure_eof()?;
        Ok(self.digest.finalize_hex())
    }

    fn read_exact_or_short(&mut self, want: u64) -> Result<Vec<u8>, ChunkError> {
        let mut data = Vec::with_capacity(want as usize);
        (&mut self.source).take(want).read_to_end(&mut data)?;
        Ok(data)
    }

    fn ensure_eof(&mut self) -> Result<(), ChunkError> {
        let mut peek = [0u8; 1];
        loop {
            match self.source.read(&mut peek) {
                Ok(0) => return Ok(()),
                Ok(_) => {
                    return Err(IntegrityError::TrailingData {
                        expected_count: self.expected.len(),
                    }
                    .into())
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::block_sizes;
    use std::io::Cursor;
    use std::num::NonZeroU64;

    fn layout(total: u64, max: u64) -> Vec<u64> {
        block_sizes(total, NonZeroU64::new(max).unwrap())
    }

    #[test]
    fn reads_all_blocks_in_windows() {
        let data: Vec<u8> = (0..10u8).collect();
        let mut reader = BlockReader::new(Cursor::new(data.clone()), layout(10, 3));

        let first = reader.next_window(2).unwrap();
        assert_eq!(first.iter().map(|b| b.index).collect::<Vec<_>>(), vec![1, 2]);
        let second = reader.next_window(2).unwrap();
        assert_eq!(second.iter().map(|b| b.data.len()).collect::<Vec<_>>(), vec![3, 1]);
        assert!(reader.next_window(2).unwrap().is_empty());

        let mut whole = DigestAccumulator::new();
        whole.fold(1, &data).unwrap();
        assert_eq!(reader.finish().unwrap(), whole.finalize_hex());
    }

    #[test]
    fn short_file_is_integrity_error() {
        let mut reader = BlockReader::new(Cursor::new(vec![0u8; 5]), layout(10, 4));
        let err = reader.next_window(4).unwrap_err();
        assert!(matches!(
            err,
            ChunkError::Integrity(IntegrityError::SizeMismatch { index: 2, expected: 4, actual: 1 })
        ));
    }

    #[test]
    fn missing_block_is_unexpected_eof() {
        let mut reader = BlockReader::new(Cursor::new(vec![0u8; 4]), layout(8, 4));
        let err = reader.next_window(4).unwrap_err();
        assert!(matches!(
            err,
            ChunkError::Integrity(IntegrityError::UnexpectedEof { index: 2, .. })
        ));
    }

    #[test]
    fn grown_file_is_trailing_data() {
        let mut reader = BlockReader::new(Cursor::new(vec![0u8; 9]), layout(8, 4));
        let err = reader.next_window(4).unwrap_err();
        assert!(matches!(
            err,
            ChunkError::Integrity(IntegrityError::TrailingData { expected_count: 2 })
        ));
    }

    #[test]
    fn empty_layout_requires_empty_file() {
        let reader = BlockReader::new(Cursor::new(Vec::new()), vec![]);
        assert!(reader.finish().is_ok());

        let mut reader = BlockReader::new(Cursor::new(vec![1u8]), vec![]);
        assert!(reader.next_window(1).is_err());
    }

    #[test]
    fn finish_before_exhaustion_fails() {
        let mut reader = BlockReader::new(Cursor::new(vec![0u8; 8]), layout(8, 4));
        reader.next_window(1).unwrap();
        assert!(matches!(
            reader.finish(),
            Err(ChunkError::Integrity(IntegrityError::CountMismatch { expected: 2, actual: 1 }))
        ));
    }

    #[test]
    fn opens_files_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clear.bin");
        std::fs::write(&path, vec![7u8; 9]).unwrap();
        let mut reader = BlockReader::open(&path, layout(9, 4)).unwrap();
        let blocks = reader.next_window(8).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2].data, vec![7u8]);
    }
}
