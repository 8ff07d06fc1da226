//! Draft preparation: the File and Revision records an upload starts from.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::info;
use uuid::Uuid;

use vup_core::types::{
    FileKind, FileRecord, FileState, MediaMetadata, NodeKeyPacket, RevisionRecord,
    RevisionUploadState,
};
use vup_crypto::NodeKeyBundle;
use vup_store::MetadataStore;

use crate::error::UploadError;
use crate::keys::KeyResolver;

pub struct DraftPreparer {
    store: Arc<MetadataStore>,
    keys: Arc<dyn KeyResolver>,
}

impl DraftPreparer {
    pub fn new(store: Arc<MetadataStore>, keys: Arc<dyn KeyResolver>) -> Self {
        Self { store, keys }
    }

    /// Create a File in `uploading` state and its `created` Revision draft.
    ///
    /// The locally generated upload id doubles as file id and revision id
    /// until the remote assigns its own on commit.
    pub async fn prepare(
        &self,
        path: &Path,
        kind: FileKind,
        media: Option<MediaMetadata>,
    ) -> Result<FileRecord, UploadError> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(UploadError::Validation(format!(
                "not a regular file: {}",
                path.display()
            )));
        }
        let modification_time = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let keyring = self.keys.keyring();
        let kdf = self.keys.kdf_params();
        let signer = keyring.email().to_string();
        let bundle = tokio::task::spawn_blocking(move || NodeKeyBundle::generate(&keyring, &kdf))
            .await
            .map_err(|e| UploadError::Credential(format!("key generation task failed: {e}")))??;

        let upload_id = Uuid::new_v4();
        let id = upload_id.to_string();

        let file = FileRecord {
            id: id.clone(),
            upload_id: Some(upload_id),
            state: FileState::Uploading,
            kind,
            name,
            source_path: Some(path.to_path_buf()),
            size: meta.len(),
            keys: Some(NodeKeyPacket {
                locked_node_key: STANDARD.encode(&bundle.locked_node_key),
                wrapped_passphrase: STANDARD.encode(&bundle.wrapped_passphrase),
                content_key_packet: STANDARD.encode(&bundle.content_key_packet),
            }),
            signature_email: Some(signer),
            active_revision_draft: Some(id.clone()),
            active_revision: None,
            revisions: Vec::new(),
            queued_at: now_millis(),
            last_error: None,
        };
        let revision = RevisionRecord {
            id: id.clone(),
            file_id: id.clone(),
            upload_state: RevisionUploadState::Created,
            size: meta.len(),
            encrypted_size: 0,
            cleartext_path: Some(path.to_path_buf()),
            modification_time,
            xattrs: None,
            signature_address: None,
            manifest_signature: None,
            blocks: Vec::new(),
            thumbnails: Vec::new(),
            session: None,
            media,
        };

        self.store.transaction(|tx| {
            tx.put_file(file.clone());
            tx.put_revision(revision);
            Ok::<_, UploadError>(())
        })?;
        self.store.persist().await?;

        info!(file_id = %id, upload_id = %upload_id, path = %path.display(), size = file.size, "prepared upload draft");
        Ok(file)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
