//! `RemoteApi` over an OpenDAL operator.
//!
//! Layout under `prefix`:
//! ```text
//! sessions/{session_id}/session.json     session document (targets, expiry)
//! sessions/{session_id}/blocks/{index}   uploaded ciphertext
//! sessions/{session_id}/thumbnails/{kind}
//! files/{file_id}/{revision_id}.json     committed revision manifest
//! usage.json                             committed bytes, checked against the quota
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use opendal::Operator;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use vup_core::config::StorageConfig;
use vup_core::types::{RevisionSession, ThumbnailKind};

use crate::api::{
    BlockAck, BlockUploadRequest, CommitBlock, CommitRequest, CommitResult, CommitThumbnail,
    RemoteApi, UploadTarget,
};
use crate::error::{RemoteError, RemoteResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TargetDoc {
    token: String,
    size: u64,
    hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionDoc {
    session_id: String,
    file_id: String,
    revision_id: String,
    created_ms: u64,
    expires_ms: u64,
    committed: bool,
    #[serde(default)]
    targets: BTreeMap<u32, TargetDoc>,
    #[serde(default)]
    thumbnails: Vec<ThumbnailKind>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsageDoc {
    used_bytes: u64,
}

/// A committed revision as stored remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedRevision {
    pub file_id: String,
    pub revision_id: String,
    pub session_id: String,
    pub blocks: Vec<CommitBlock>,
    pub block_keys: Vec<String>,
    pub thumbnails: Vec<CommitThumbnail>,
    pub manifest_signature: String,
    pub signature_email: String,
    pub xattrs: String,
    pub size: u64,
    pub committed_ms: u64,
}

pub struct OpendalRemote {
    op: Operator,
    prefix: String,
    session_ttl: Duration,
    quota_bytes: Option<u64>,
    /// Serializes read-modify-write of session and usage documents
    docs: Mutex<()>,
}

impl OpendalRemote {
    pub fn new(op: Operator, prefix: impl Into<String>, session_ttl: Duration) -> Self {
        Self {
            op,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            session_ttl,
            quota_bytes: None,
            docs: Mutex::new(()),
        }
    }

    pub fn from_config(op: Operator, cfg: &StorageConfig) -> Self {
        Self::new(op, cfg.prefix.clone(), Duration::from_secs(cfg.session_ttl_secs))
            .with_quota(cfg.quota_bytes)
    }

    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Read back a committed revision manifest.
    pub async fn committed_revision(
        &self,
        file_id: &str,
        revision_id: &str,
    ) -> RemoteResult<CommittedRevision> {
        self.read_json(&self.revision_key(file_id, revision_id)).await
    }

    /// Raw object bytes (committed blocks, thumbnails).
    pub async fn read_object(&self, key: &str) -> RemoteResult<Vec<u8>> {
        let buf = self
            .op
            .read(key)
            .await
            .map_err(|e| RemoteError::from_opendal(e, key))?;
        Ok(buf.to_vec())
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("{}/sessions/{}/session.json", self.prefix, session_id)
    }

    fn block_key(&self, session_id: &str, index: u32) -> String {
        format!("{}/sessions/{}/blocks/{:08}", self.prefix, session_id, index)
    }

    fn thumbnail_key(&self, session_id: &str, kind: ThumbnailKind) -> String {
        let name = match kind {
            ThumbnailKind::Default => "default",
            ThumbnailKind::Photo => "photo",
        };
        format!("{}/sessions/{}/thumbnails/{}", self.prefix, session_id, name)
    }

    fn revision_key(&self, file_id: &str, revision_id: &str) -> String {
        format!("{}/files/{}/{}.json", self.prefix, file_id, revision_id)
    }

    fn usage_key(&self) -> String {
        format!("{}/usage.json", self.prefix)
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> RemoteResult<T> {
        let bytes = self.read_object(key).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RemoteError::Invalid(format!("corrupt document {key}: {e}")))
    }

    async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> RemoteResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| RemoteError::Invalid(format!("serializing {key}: {e}")))?;
        self.op
            .write(key, bytes)
            .await
            .map_err(|e| RemoteError::from_opendal(e, key))?;
        Ok(())
    }

    async fn usage(&self) -> RemoteResult<UsageDoc> {
        match self.read_json(&self.usage_key()).await {
            Err(RemoteError::NotFound(_)) => Ok(UsageDoc::default()),
            other => other,
        }
    }

    async fn available(&self) -> RemoteResult<Option<u64>> {
        let Some(quota) = self.quota_bytes else {
            return Ok(None);
        };
        Ok(Some(quota.saturating_sub(self.usage().await?.used_bytes)))
    }

    /// Load a session that can still accept uploads.
    async fn live_session(&self, session_id: &str) -> RemoteResult<SessionDoc> {
        let doc: SessionDoc = self.read_json(&self.session_key(session_id)).await?;
        if doc.committed {
            return Err(RemoteError::AlreadyCommitted(doc.revision_id));
        }
        if now_ms() >= doc.expires_ms {
            return Err(RemoteError::ExpiredResource(session_id.to_string()));
        }
        Ok(doc)
    }
}

#[async_trait]
impl RemoteApi for OpendalRemote {
    async fn request_revision_session(&self, file_id: &str) -> RemoteResult<RevisionSession> {
        let created_ms = now_ms();
        let doc = SessionDoc {
            session_id: Uuid::new_v4().to_string(),
            file_id: file_id.to_string(),
            revision_id: Uuid::new_v4().to_string(),
            created_ms,
            expires_ms: created_ms.saturating_add(self.session_ttl.as_millis() as u64),
            committed: false,
            targets: BTreeMap::new(),
            thumbnails: Vec::new(),
        };
        self.write_json(&self.session_key(&doc.session_id), &doc).await?;
        tracing::debug!(file_id, session_id = %doc.session_id, "opened revision session");

        Ok(RevisionSession {
            session_id: doc.session_id,
            file_id: doc.file_id,
            remote_revision_id: doc.revision_id,
        })
    }

    async fn check_session(&self, session: &RevisionSession) -> RemoteResult<()> {
        self.live_session(&session.session_id).await.map(|_| ())
    }

    async fn request_block_upload_targets(
        &self,
        session: &RevisionSession,
        blocks: &[BlockUploadRequest],
    ) -> RemoteResult<Vec<UploadTarget>> {
        let _guard = self.docs.lock().await;
        let mut doc = self.live_session(&session.session_id).await?;

        for block in blocks {
            doc.targets.insert(
                block.index,
                TargetDoc {
                    token: Uuid::new_v4().to_string(),
                    size: block.size,
                    hash: block.hash.clone(),
                },
            );
        }

        if let Some(available) = self.available().await? {
            let needed: u64 = doc.targets.values().map(|t| t.size).sum();
            if needed > available {
                return Err(RemoteError::Quota { needed, available });
            }
        }

        self.write_json(&self.session_key(&doc.session_id), &doc).await?;

        Ok(blocks
            .iter()
            .filter_map(|b| {
                doc.targets.get(&b.index).map(|t| UploadTarget {
                    session_id: doc.session_id.clone(),
                    index: b.index,
                    key: self.block_key(&doc.session_id, b.index),
                    token: t.token.clone(),
                })
            })
            .collect())
    }

    async fn upload_block(
        &self,
        target: &UploadTarget,
        ciphertext_path: &Path,
    ) -> RemoteResult<BlockAck> {
        let doc = self.live_session(&target.session_id).await?;
        let declared = doc
            .targets
            .get(&target.index)
            .ok_or_else(|| RemoteError::Invalid(format!("block {} was not declared", target.index)))?;
        if declared.token != target.token {
            return Err(RemoteError::Invalid(format!(
                "stale upload credential for block {}",
                target.index
            )));
        }

        let data = tokio::fs::read(ciphertext_path).await.map_err(|e| {
            RemoteError::Invalid(format!("reading {}: {e}", ciphertext_path.display()))
        })?;
        if data.len() as u64 != declared.size {
            return Err(RemoteError::Invalid(format!(
                "block {}: declared {} bytes, sent {}",
                target.index,
                declared.size,
                data.len()
            )));
        }

        self.op
            .write(&target.key, data)
            .await
            .map_err(|e| RemoteError::from_opendal(e, &target.key))?;

        Ok(BlockAck {
            index: target.index,
            token: target.token.clone(),
        })
    }

    async fn upload_thumbnail(
        &self,
        session: &RevisionSession,
        kind: ThumbnailKind,
        encrypted: &[u8],
    ) -> RemoteResult<()> {
        let _guard = self.docs.lock().await;
        let mut doc = self.live_session(&session.session_id).await?;
        let key = self.thumbnail_key(&doc.session_id, kind);
        self.op
            .write(&key, encrypted.to_vec())
            .await
            .map_err(|e| RemoteError::from_opendal(e, &key))?;
        if !doc.thumbnails.contains(&kind) {
            doc.thumbnails.push(kind);
            self.write_json(&self.session_key(&doc.session_id), &doc).await?;
        }
        Ok(())
    }

    async fn commit_revision(
        &self,
        session: &RevisionSession,
        request: CommitRequest,
    ) -> RemoteResult<CommitResult> {
        let _guard = self.docs.lock().await;
        let mut doc = self.live_session(&session.session_id).await?;

        if request.blocks.len() != doc.targets.len() {
            return Err(RemoteError::Invalid(format!(
                "commit lists {} blocks, session declared {}",
                request.blocks.len(),
                doc.targets.len()
            )));
        }

        let mut size = 0u64;
        let mut block_keys = Vec::with_capacity(request.blocks.len());
        for block in &request.blocks {
            let declared = doc.targets.get(&block.index).ok_or_else(|| {
                RemoteError::Invalid(format!("block {} was not declared", block.index))
            })?;
            if declared.token != block.token || declared.hash != block.hash {
                return Err(RemoteError::Invalid(format!(
                    "block {} does not match its declaration",
                    block.index
                )));
            }
            let key = self.block_key(&doc.session_id, block.index);
            let stored = match self.read_object(&key).await {
                Err(RemoteError::NotFound(_)) => {
                    return Err(RemoteError::Invalid(format!(
                        "block {} was never uploaded",
                        block.index
                    )))
                }
                other => other?,
            };
            if blake3::hash(&stored).to_hex().as_str() != block.hash {
                return Err(RemoteError::Invalid(format!(
                    "block {} content hash mismatch",
                    block.index
                )));
            }
            size += stored.len() as u64;
            block_keys.push(key);
        }

        for thumb in &request.thumbnails {
            let stored = self
                .read_object(&self.thumbnail_key(&doc.session_id, thumb.kind))
                .await?;
            if blake3::hash(&stored).to_hex().as_str() != thumb.hash {
                return Err(RemoteError::Invalid("thumbnail content hash mismatch".into()));
            }
            size += stored.len() as u64;
        }

        let mut usage = self.usage().await?;
        if let Some(quota) = self.quota_bytes {
            let available = quota.saturating_sub(usage.used_bytes);
            if size > available {
                return Err(RemoteError::Quota {
                    needed: size,
                    available,
                });
            }
        }

        let committed = CommittedRevision {
            file_id: doc.file_id.clone(),
            revision_id: doc.revision_id.clone(),
            session_id: doc.session_id.clone(),
            blocks: request.blocks,
            block_keys,
            thumbnails: request.thumbnails,
            manifest_signature: request.manifest_signature,
            signature_email: request.signature_email,
            xattrs: request.xattrs,
            size,
            committed_ms: now_ms(),
        };
        self.write_json(&self.revision_key(&doc.file_id, &doc.revision_id), &committed)
            .await?;

        usage.used_bytes += size;
        self.write_json(&self.usage_key(), &usage).await?;

        doc.committed = true;
        self.write_json(&self.session_key(&doc.session_id), &doc).await?;

        tracing::info!(
            file_id = %doc.file_id,
            revision_id = %doc.revision_id,
            bytes = size,
            "revision committed"
        );
        Ok(CommitResult {
            file_id: doc.file_id,
            revision_id: doc.revision_id,
            committed_bytes: size,
        })
    }

    async fn discard_revision_session(&self, session: &RevisionSession) -> RemoteResult<()> {
        let _guard = self.docs.lock().await;
        let key = self.session_key(&session.session_id);
        let doc: SessionDoc = match self.read_json(&key).await {
            Err(RemoteError::NotFound(_)) => return Ok(()),
            other => other?,
        };
        if doc.committed {
            return Err(RemoteError::AlreadyCommitted(doc.revision_id));
        }

        for index in doc.targets.keys() {
            let block_key = self.block_key(&doc.session_id, *index);
            self.op
                .delete(&block_key)
                .await
                .map_err(|e| RemoteError::from_opendal(e, &block_key))?;
        }
        for kind in &doc.thumbnails {
            let thumb_key = self.thumbnail_key(&doc.session_id, *kind);
            self.op
                .delete(&thumb_key)
                .await
                .map_err(|e| RemoteError::from_opendal(e, &thumb_key))?;
        }
        self.op
            .delete(&key)
            .await
            .map_err(|e| RemoteError::from_opendal(e, &key))?;

        tracing::debug!(session_id = %doc.session_id, "discarded revision session");
        Ok(())
    }

    async fn available_bytes(&self) -> RemoteResult<Option<u64>> {
        self.available().await
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
