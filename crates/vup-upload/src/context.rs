//! Collaborators and shared resources handed to every upload job.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;

use vup_core::config::UploadConfig;
use vup_remote::RemoteApi;
use vup_store::MetadataStore;

use crate::encrypt::blocks::{BlockVerifier, DecryptingVerifier};
use crate::encrypt::thumbnail::{NoThumbnailSource, ThumbnailCodec, ThumbnailSource, ZstdThumbnailCodec};
use crate::keys::KeyResolver;

/// Progress callback type (fraction of the job done, 0.0 to 1.0)
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// A progress callback that discards every update.
pub fn no_progress() -> ProgressFn {
    Arc::new(|_| {})
}

#[derive(Clone)]
pub struct UploadContext {
    pub store: Arc<MetadataStore>,
    pub remote: Arc<dyn RemoteApi>,
    pub keys: Arc<dyn KeyResolver>,
    pub thumbnails: Arc<dyn ThumbnailSource>,
    pub codec: Arc<dyn ThumbnailCodec>,
    /// Run on every sealed block before it is cached
    pub verifier: Arc<dyn BlockVerifier>,
    pub config: UploadConfig,
    /// Root for ciphertext block files
    pub cache_dir: PathBuf,
    /// Shared across jobs; bounds concurrent block uploads
    pub transfer_slots: Arc<Semaphore>,
}

impl UploadContext {
    pub fn new(
        store: Arc<MetadataStore>,
        remote: Arc<dyn RemoteApi>,
        keys: Arc<dyn KeyResolver>,
        config: UploadConfig,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        let transfer_slots = Arc::new(Semaphore::new(config.transfer_concurrency.max(1)));
        Self {
            store,
            remote,
            keys,
            thumbnails: Arc::new(NoThumbnailSource),
            codec: Arc::new(ZstdThumbnailCodec),
            verifier: Arc::new(DecryptingVerifier),
            config,
            cache_dir: cache_dir.into(),
            transfer_slots,
        }
    }

    pub fn with_thumbnails(mut self, source: Arc<dyn ThumbnailSource>) -> Self {
        self.thumbnails = source;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn ThumbnailCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_block_verifier(mut self, verifier: Arc<dyn BlockVerifier>) -> Self {
        self.verifier = verifier;
        self
    }
}

impl std::fmt::Debug for UploadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadContext")
            .field("cache_dir", &self.cache_dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
