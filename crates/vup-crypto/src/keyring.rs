//! Local address keyring: the signer identity and the key wrapping node passphrases

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::hkdf_derive;
use crate::seal::{open, seal};
use crate::sign::AddressKey;
use crate::KEY_SIZE;

const PASSPHRASE_WRAP_INFO: &[u8] = b"vaultup-passphrase-wrap";

/// On-disk JSON form; key bytes are base64.
#[derive(Serialize, Deserialize)]
struct KeyringFile {
    email: String,
    signing_seed: String,
    storage_key: String,
}

pub struct AddressKeyring {
    address: AddressKey,
    storage_key: Zeroizing<[u8; KEY_SIZE]>,
}

impl AddressKeyring {
    pub fn generate(email: impl Into<String>) -> Self {
        let mut storage_key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(storage_key.as_mut());
        Self {
            address: AddressKey::generate(email),
            storage_key,
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading keyring: {}", path.display()))?;
        let file: KeyringFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing keyring: {}", path.display()))?;
        Ok(Self::from_file(file)?)
    }

    /// Write the keyring as JSON, atomically via a temp file. On unix the
    /// file is readable by its owner only.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating keyring dir: {}", parent.display()))?;
        }
        let mut seed = self.address.seed();
        let file = KeyringFile {
            email: self.address.email().to_string(),
            signing_seed: STANDARD.encode(seed),
            storage_key: STANDARD.encode(*self.storage_key),
        };
        seed.zeroize();
        let json = serde_json::to_string_pretty(&file).context("serializing keyring")?;
        let tmp = path.with_extension("json.tmp");
        write_private(&tmp, json.as_bytes())
            .with_context(|| format!("writing keyring tmp: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming keyring: {}", path.display()))?;
        tracing::debug!(path = %path.display(), email = %self.address.email(), "keyring saved");
        Ok(())
    }

    fn from_file(file: KeyringFile) -> CryptoResult<Self> {
        let seed = decode_key(&file.signing_seed, "signing_seed")?;
        let storage_key = decode_key(&file.storage_key, "storage_key")?;
        Ok(Self {
            address: AddressKey::from_seed(file.email, &seed),
            storage_key,
        })
    }

    pub fn email(&self) -> &str {
        self.address.email()
    }

    pub fn address_key(&self) -> &AddressKey {
        &self.address
    }

    /// Seal a node passphrase for storage alongside the file record.
    pub fn wrap_passphrase(&self, passphrase: &SecretString) -> CryptoResult<Vec<u8>> {
        let key = hkdf_derive(&self.storage_key, PASSPHRASE_WRAP_INFO)?;
        seal(&key, PASSPHRASE_WRAP_INFO, passphrase.expose_secret().as_bytes())
    }

    pub fn unwrap_passphrase(&self, wrapped: &[u8]) -> CryptoResult<SecretString> {
        let key = hkdf_derive(&self.storage_key, PASSPHRASE_WRAP_INFO)?;
        let raw = open(&key, PASSPHRASE_WRAP_INFO, wrapped)?;
        match String::from_utf8(raw) {
            Ok(text) => Ok(SecretString::from(text)),
            Err(e) => {
                e.into_bytes().zeroize();
                Err(CryptoError::Keyring("passphrase is not UTF-8".into()))
            }
        }
    }
}

impl std::fmt::Debug for AddressKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressKeyring")
            .field("email", &self.email())
            .finish_non_exhaustive()
    }
}

/// Create (or truncate) `path` with owner-only permissions and write `bytes`.
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    // mode() only applies on creation; a leftover temp file keeps its bits
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(bytes)?;
    file.sync_all()
}

fn decode_key(b64: &str, field: &str) -> CryptoResult<Zeroizing<[u8; KEY_SIZE]>> {
    let mut raw = STANDARD
        .decode(b64)
        .map_err(|e| CryptoError::Keyring(format!("{field}: {e}")))?;
    if raw.len() != KEY_SIZE {
        raw.zeroize();
        return Err(CryptoError::Keyring(format!(
            "{field}: expected {KEY_SIZE} bytes"
        )));
    }
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&raw);
    raw.zeroize();
    Ok(key)
}
