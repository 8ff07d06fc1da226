//! Resolution of per-attempt encryption material.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use vup_core::types::FileRecord;
use vup_crypto::{AddressKeyring, EncryptionMetadata, KdfParams};

use crate::error::UploadError;

/// Key-management collaborator: unlocks the node and content keys of a file.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, file: &FileRecord) -> Result<EncryptionMetadata, UploadError>;

    /// Keyring the draft preparer wraps new node passphrases with.
    fn keyring(&self) -> Arc<AddressKeyring>;

    fn kdf_params(&self) -> KdfParams;
}

/// Resolves keys from the local address keyring.
pub struct KeyringResolver {
    keyring: Arc<AddressKeyring>,
    kdf: KdfParams,
}

impl KeyringResolver {
    pub fn new(keyring: Arc<AddressKeyring>, kdf: KdfParams) -> Self {
        Self { keyring, kdf }
    }
}

#[async_trait]
impl KeyResolver for KeyringResolver {
    async fn resolve(&self, file: &FileRecord) -> Result<EncryptionMetadata, UploadError> {
        let packets = file
            .keys
            .as_ref()
            .ok_or_else(|| UploadError::Credential(format!("file {} has no key packets", file.id)))?;

        if let Some(email) = &file.signature_email {
            if email != self.keyring.email() {
                return Err(UploadError::Credential(format!(
                    "file {} was signed by {email}, keyring holds {}",
                    file.id,
                    self.keyring.email()
                )));
            }
        }

        let decode = |field: &str, value: &str| {
            STANDARD
                .decode(value)
                .map_err(|e| UploadError::Credential(format!("decoding {field}: {e}")))
        };
        let locked = decode("locked node key", &packets.locked_node_key)?;
        let wrapped = decode("wrapped passphrase", &packets.wrapped_passphrase)?;
        let content = decode("content key packet", &packets.content_key_packet)?;

        let keyring = self.keyring.clone();
        let kdf = self.kdf.clone();
        // argon2 is deliberately slow; keep it off the async workers
        let metadata = tokio::task::spawn_blocking(move || {
            EncryptionMetadata::unlock(&keyring, &locked, &wrapped, &content, &kdf)
        })
        .await
        .map_err(|e| UploadError::Credential(format!("key unlock task failed: {e}")))?
        .map_err(|e| UploadError::Credential(format!("unlocking node key: {e}")))?;

        Ok(metadata)
    }

    fn keyring(&self) -> Arc<AddressKeyring> {
        self.keyring.clone()
    }

    fn kdf_params(&self) -> KdfParams {
        self.kdf.clone()
    }
}
