//! Block encryptor: cleartext file to cached, signed ciphertext blocks.

use std::collections::HashSet;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vup_chunks::{block_sizes, BlockReader, IntegrityError, RawBlock};
use vup_core::types::{BlockRecord, RevisionUploadState};
use vup_crypto::{CryptoError, EncryptedBlock, EncryptionMetadata};

use crate::context::ProgressFn;
use crate::control::checkpoint;
use crate::encrypt::{join_error, EncryptionJob, Encryptor};
use crate::error::UploadError;

pub struct BlockEncryptor;

/// Check run on every sealed block before its ciphertext reaches the cache.
pub trait BlockVerifier: Send + Sync {
    fn verify(
        &self,
        metadata: &EncryptionMetadata,
        revision_id: &str,
        block: &EncryptedBlock,
        cleartext: &[u8],
    ) -> Result<(), UploadError>;
}

/// Opens the block again, signature included, and compares the result with
/// the cleartext that went in.
pub struct DecryptingVerifier;

impl BlockVerifier for DecryptingVerifier {
    fn verify(
        &self,
        metadata: &EncryptionMetadata,
        revision_id: &str,
        block: &EncryptedBlock,
        cleartext: &[u8],
    ) -> Result<(), UploadError> {
        let opened =
            metadata.decrypt_block(revision_id, block.index, &block.ciphertext, &block.signature)?;
        if opened.as_slice() != cleartext {
            return Err(CryptoError::BlockMismatch(block.index).into());
        }
        Ok(())
    }
}

/// Inputs of the blocking read-encrypt-write loop.
struct BlockRun {
    source: PathBuf,
    layout: Vec<u64>,
    window: usize,
    revision_id: String,
    cache_dir: PathBuf,
    metadata: Arc<EncryptionMetadata>,
    verifier: Arc<dyn BlockVerifier>,
    cancel: CancellationToken,
    progress: ProgressFn,
}

struct BlockOutput {
    blocks: Vec<BlockRecord>,
    digest: String,
}

#[async_trait]
impl Encryptor for BlockEncryptor {
    fn name(&self) -> &'static str {
        "blocks"
    }

    async fn run(&self, job: Arc<EncryptionJob>) -> Result<(), UploadError> {
        let revision = job.revision()?;
        if revision.upload_state != RevisionUploadState::Created {
            return Err(UploadError::Validation(format!(
                "revision {} is {:?}, expected created",
                revision.id, revision.upload_state
            )));
        }
        let source = revision.cleartext_path.clone().ok_or_else(|| {
            UploadError::Validation(format!("revision {} has no cleartext", revision.id))
        })?;
        let max_block = NonZeroU64::new(job.ctx.config.max_block_size)
            .ok_or_else(|| UploadError::Validation("max_block_size is 0".into()))?;

        let run = BlockRun {
            source,
            layout: block_sizes(revision.size, max_block),
            window: job.ctx.config.effective_workers(),
            revision_id: job.revision_id.clone(),
            cache_dir: job.ctx.cache_dir.clone(),
            metadata: job.metadata.clone(),
            verifier: job.ctx.verifier.clone(),
            cancel: job.cancel.clone(),
            progress: job.progress.clone(),
        };
        info!(revision_id = %job.revision_id, blocks = run.layout.len(), window = run.window, "encrypting blocks");

        let output = tokio::task::spawn_blocking(move || run.execute())
            .await
            .map_err(|e| join_error("block encryption", e))??;

        if let Err(e) = checkpoint(&job.cancel) {
            remove_block_files(&output.blocks);
            return Err(e);
        }

        let encrypted_size: u64 = output.blocks.iter().map(|b| b.size).sum();
        let count = output.blocks.len();
        let new_blocks = output.blocks.clone();
        let replaced = job.ctx.store.transaction(|tx| {
            let rev = tx.revision_mut(&job.revision_id)?;
            if rev.upload_state != RevisionUploadState::Created {
                return Err(UploadError::Validation(format!(
                    "revision {} left created state during encryption",
                    rev.id
                )));
            }
            rev.encrypted_size = encrypted_size;
            Ok(std::mem::replace(&mut rev.blocks, new_blocks))
        });

        match replaced {
            Ok(old) => {
                job.ctx.store.persist().await?;
                // the previous attempt's files are orphaned once the new set is durable
                remove_block_files(&old);
                let _ = job.digest.set(output.digest);
                info!(revision_id = %job.revision_id, blocks = count, bytes = encrypted_size, "blocks encrypted");
                Ok(())
            }
            Err(e) => {
                remove_block_files(&output.blocks);
                Err(e)
            }
        }
    }
}

impl BlockRun {
    fn execute(self) -> Result<BlockOutput, UploadError> {
        let mut written = Vec::with_capacity(self.layout.len());
        match self.encrypt_all(&mut written) {
            Ok(digest) => {
                written.sort_by_key(|b: &BlockRecord| b.index);
                Ok(BlockOutput {
                    blocks: written,
                    digest,
                })
            }
            Err(e) => {
                debug!(files = written.len(), "removing partial ciphertext");
                remove_block_files(&written);
                Err(e)
            }
        }
    }

    fn encrypt_all(&self, written: &mut Vec<BlockRecord>) -> Result<String, UploadError> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let mut reader = BlockReader::open(&self.source, self.layout.clone())?;
        let total = self.layout.len().max(1) as f64;

        while !reader.is_exhausted() {
            checkpoint(&self.cancel)?;
            let window = reader.next_window(self.window)?;

            let results: Vec<Result<BlockRecord, UploadError>> = if self.window > 1 {
                window.par_iter().map(|raw| self.encrypt_chunk(raw)).collect()
            } else {
                window.iter().map(|raw| self.encrypt_chunk(raw)).collect()
            };

            let mut first_error = None;
            for result in results {
                match result {
                    Ok(block) => written.push(block),
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
            (self.progress)(written.len() as f64 / total);
        }

        Ok(reader.finish()?)
    }

    fn encrypt_chunk(&self, raw: &RawBlock) -> Result<BlockRecord, UploadError> {
        let expected = (raw.index as usize)
            .checked_sub(1)
            .and_then(|i| self.layout.get(i))
            .copied()
            .ok_or(IntegrityError::CountMismatch {
                expected: self.layout.len(),
                actual: raw.index as usize,
            })?;
        if raw.data.len() as u64 != expected {
            return Err(IntegrityError::SizeMismatch {
                index: raw.index,
                expected,
                actual: raw.data.len() as u64,
            }
            .into());
        }

        let block = self
            .metadata
            .encrypt_block(&self.revision_id, raw.index, &raw.data)?;
        self.verifier
            .verify(&self.metadata, &self.revision_id, &block, &raw.data)?;
        let local_path = self.cache_dir.join(format!("{}.block", Uuid::new_v4()));
        std::fs::write(&local_path, &block.ciphertext)?;
        debug!(index = block.index, bytes = block.ciphertext.len(), "block sealed");

        Ok(BlockRecord {
            index: block.index,
            size: block.ciphertext.len() as u64,
            hash: block.hash,
            clear_size: block.clear_size,
            signature: block.signature,
            signature_email: self.metadata.signer_email().to_string(),
            local_path,
            uploaded: false,
            upload_token: None,
        })
    }
}

/// Best-effort removal of cached ciphertext.
pub(crate) fn remove_block_files(blocks: &[BlockRecord]) {
    for block in blocks {
        remove_cache_file(&block.local_path);
    }
}

pub(crate) fn remove_cache_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove cached block");
        }
    }
}

/// Delete `*.block` files under `cache_dir` that no revision refers to.
/// Returns how many were found.
pub(crate) fn sweep_orphaned_blocks(
    cache_dir: &Path,
    referenced: &HashSet<PathBuf>,
) -> Result<usize, UploadError> {
    let entries = match std::fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut orphans = 0;
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "block") && !referenced.contains(&path) {
            remove_cache_file(&path);
            orphans += 1;
        }
    }
    Ok(orphans)
}
