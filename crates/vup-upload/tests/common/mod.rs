//! Shared fixtures: an in-memory remote with fault injection, a temp
//! workspace and fast key derivation.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use opendal::Operator;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use vup_core::config::UploadConfig;
use vup_core::types::{FileKind, FileRecord, RevisionSession, ThumbnailKind};
use vup_crypto::{AddressKeyring, EncryptionMetadata, KdfParams};
use vup_remote::{
    BlockAck, BlockUploadRequest, CommitRequest, CommitResult, OpendalRemote, RemoteApi,
    RemoteError, RemoteResult, UploadTarget,
};
use vup_store::MetadataStore;
use vup_upload::{
    no_progress, Bitmap, DraftPreparer, EncryptionJob, EventKind, KeyResolver, KeyringResolver,
    RetryPolicy, ThumbnailSource, UploadContext, UploadError, UploadEvent, UploadScheduler,
};

pub fn fast_kdf() -> KdfParams {
    KdfParams {
        mem_cost_kib: 64,
        time_cost: 1,
        parallelism: 1,
    }
}

pub fn test_config() -> UploadConfig {
    UploadConfig {
        max_block_size: 1024,
        encryption_workers: 4,
        ..Default::default()
    }
}

/// Deterministic, non-repeating test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// `OpendalRemote` over the memory service, with injectable failures.
pub struct FlakyRemote {
    pub inner: OpendalRemote,
    /// Commits that fail with a network error before one is let through
    pub commit_failures: AtomicU32,
    pub commit_calls: AtomicU32,
    /// Next commit reports the session as expired
    pub expire_next_commit: AtomicBool,
    /// Every commit is refused as invalid while set
    pub reject_commits: AtomicBool,
    /// Size of every upload-target request, in order
    pub target_requests: Mutex<Vec<usize>>,
    pub discarded_sessions: Mutex<Vec<String>>,
    /// Block uploads that drop the connection before one is let through
    pub dropped_uploads: AtomicU32,
    pub upload_calls: AtomicU32,
    /// Target requests fail with a quota error while set
    pub quota_exceeded: AtomicBool,
    pub upload_delay: Mutex<Duration>,
    pub commits: Mutex<Vec<CommitResult>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FlakyRemote {
    pub fn new() -> Self {
        let op = Operator::new(opendal::services::Memory::default())
            .expect("memory operator")
            .finish();
        Self {
            inner: OpendalRemote::new(op, "test", Duration::from_secs(3600)),
            commit_failures: AtomicU32::new(0),
            commit_calls: AtomicU32::new(0),
            expire_next_commit: AtomicBool::new(false),
            reject_commits: AtomicBool::new(false),
            target_requests: Mutex::new(Vec::new()),
            discarded_sessions: Mutex::new(Vec::new()),
            dropped_uploads: AtomicU32::new(0),
            upload_calls: AtomicU32::new(0),
            quota_exceeded: AtomicBool::new(false),
            upload_delay: Mutex::new(Duration::ZERO),
            commits: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.lock().unwrap() = delay;
    }

    pub fn last_commit(&self) -> CommitResult {
        self.commits.lock().unwrap().last().cloned().expect("a commit")
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RemoteApi for FlakyRemote {
    async fn request_revision_session(&self, file_id: &str) -> RemoteResult<RevisionSession> {
        self.inner.request_revision_session(file_id).await
    }

    async fn check_session(&self, session: &RevisionSession) -> RemoteResult<()> {
        self.inner.check_session(session).await
    }

    async fn request_block_upload_targets(
        &self,
        session: &RevisionSession,
        blocks: &[BlockUploadRequest],
    ) -> RemoteResult<Vec<UploadTarget>> {
        self.target_requests.lock().unwrap().push(blocks.len());
        if self.quota_exceeded.load(Ordering::SeqCst) {
            let needed = blocks.iter().map(|b| b.size).sum();
            return Err(RemoteError::Quota {
                needed,
                available: 0,
            });
        }
        self.inner.request_block_upload_targets(session, blocks).await
    }

    async fn upload_block(
        &self,
        target: &UploadTarget,
        ciphertext_path: &Path,
    ) -> RemoteResult<BlockAck> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.upload_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        let result = if take_one(&self.dropped_uploads) {
            Err(RemoteError::ConnectionLost("injected".into()))
        } else {
            self.inner.upload_block(target, ciphertext_path).await
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn upload_thumbnail(
        &self,
        session: &RevisionSession,
        kind: ThumbnailKind,
        encrypted: &[u8],
    ) -> RemoteResult<()> {
        self.inner.upload_thumbnail(session, kind, encrypted).await
    }

    async fn commit_revision(
        &self,
        session: &RevisionSession,
        request: CommitRequest,
    ) -> RemoteResult<CommitResult> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        if self.expire_next_commit.swap(false, Ordering::SeqCst) {
            return Err(RemoteError::ExpiredResource(session.session_id.clone()));
        }
        if take_one(&self.commit_failures) {
            return Err(RemoteError::Network("injected".into()));
        }
        if self.reject_commits.load(Ordering::SeqCst) {
            return Err(RemoteError::Invalid("manifest rejected".into()));
        }
        let result = self.inner.commit_revision(session, request).await?;
        self.commits.lock().unwrap().push(result.clone());
        Ok(result)
    }

    async fn discard_revision_session(&self, session: &RevisionSession) -> RemoteResult<()> {
        self.discarded_sessions
            .lock()
            .unwrap()
            .push(session.session_id.clone());
        self.inner.discard_revision_session(session).await
    }

    async fn available_bytes(&self) -> RemoteResult<Option<u64>> {
        self.inner.available_bytes().await
    }
}

/// Keyring resolver whose next `failures` resolutions report the signing
/// credentials as unavailable.
pub struct FlakyResolver {
    pub inner: Arc<KeyringResolver>,
    pub failures: AtomicU32,
    pub calls: AtomicU32,
}

#[async_trait]
impl KeyResolver for FlakyResolver {
    async fn resolve(&self, file: &FileRecord) -> Result<EncryptionMetadata, UploadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failures) {
            return Err(UploadError::Credential("keychain locked".into()));
        }
        self.inner.resolve(file).await
    }

    fn keyring(&self) -> Arc<AddressKeyring> {
        self.inner.keyring()
    }

    fn kdf_params(&self) -> KdfParams {
        self.inner.kdf_params()
    }
}

/// Flat grey preview of whatever size is asked for.
pub struct FlatSource;

impl ThumbnailSource for FlatSource {
    fn bitmap(&self, _path: &Path, max_dimension: u32) -> anyhow::Result<Option<Bitmap>> {
        let side = max_dimension.min(64);
        Ok(Some(Bitmap {
            width: side,
            height: side,
            rgba: vec![0x80; (side * side * 4) as usize],
        }))
    }
}

pub struct BrokenSource;

impl ThumbnailSource for BrokenSource {
    fn bitmap(&self, path: &Path, _max_dimension: u32) -> anyhow::Result<Option<Bitmap>> {
        anyhow::bail!("cannot decode {}", path.display())
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: Arc<MetadataStore>,
    pub remote: Arc<FlakyRemote>,
    pub resolver: Arc<KeyringResolver>,
    pub ctx: UploadContext,
}

impl Harness {
    pub fn new(config: UploadConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(&dir.path().join("state.json")).unwrap());
        let remote = Arc::new(FlakyRemote::new());
        let keyring = Arc::new(AddressKeyring::generate("dana@example.com"));
        let resolver = Arc::new(KeyringResolver::new(keyring, fast_kdf()));
        let ctx = UploadContext::new(
            store.clone(),
            remote.clone(),
            resolver.clone(),
            config,
            dir.path().join("cache"),
        );
        Self {
            dir,
            store,
            remote,
            resolver,
            ctx,
        }
    }

    pub fn with_thumbnails(mut self, source: Arc<dyn ThumbnailSource>) -> Self {
        self.ctx = self.ctx.with_thumbnails(source);
        self
    }

    /// Route job key resolution through a [`FlakyResolver`] failing `failures` times.
    pub fn with_flaky_keys(mut self, failures: u32) -> (Self, Arc<FlakyResolver>) {
        let flaky = Arc::new(FlakyResolver {
            inner: self.resolver.clone(),
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        });
        self.ctx.keys = flaky.clone();
        (self, flaky)
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.path().join("state.json")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    /// Scheduler with millisecond backoff.
    pub fn scheduler(&self) -> UploadScheduler {
        let policy = RetryPolicy {
            max_retries: self.ctx.config.max_retries,
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
        };
        UploadScheduler::with_policy(self.ctx.clone(), policy)
    }

    pub fn write_file(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.dir.path().join("src").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        path
    }

    pub async fn draft(&self, name: &str, data: &[u8]) -> FileRecord {
        self.draft_kind(name, data, FileKind::Regular).await
    }

    pub async fn draft_kind(&self, name: &str, data: &[u8], kind: FileKind) -> FileRecord {
        let path = self.write_file(name, data);
        DraftPreparer::new(self.store.clone(), self.resolver.clone())
            .prepare(&path, kind, None)
            .await
            .unwrap()
    }

    pub async fn encryption_job(
        &self,
        file: &FileRecord,
        cancel: CancellationToken,
    ) -> Arc<EncryptionJob> {
        let metadata = self.resolver.resolve(file).await.unwrap();
        Arc::new(EncryptionJob {
            ctx: self.ctx.clone(),
            file: file.clone(),
            revision_id: file.active_revision_draft.clone().unwrap(),
            metadata: Arc::new(metadata),
            cancel,
            progress: no_progress(),
            digest: OnceLock::new(),
        })
    }

    pub fn cache_files(&self) -> usize {
        match std::fs::read_dir(self.dir.path().join("cache")) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    pub fn file(&self, id: &str) -> FileRecord {
        self.store.read_file(id).unwrap().unwrap()
    }
}

/// Drain events until `terminals` terminal events have been seen.
pub async fn collect_events(
    rx: &mut broadcast::Receiver<UploadEvent>,
    terminals: usize,
) -> Vec<UploadEvent> {
    let mut seen = Vec::new();
    let mut remaining = terminals;
    while remaining > 0 {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event stream closed");
        if event.kind.is_terminal() {
            remaining -= 1;
        }
        seen.push(event);
    }
    seen
}

pub fn position(events: &[UploadEvent], file_id: &str, kind: &EventKind) -> usize {
    events
        .iter()
        .position(|e| e.file_id == file_id && &e.kind == kind)
        .unwrap_or_else(|| panic!("no {kind:?} for {file_id} in {events:?}"))
}
