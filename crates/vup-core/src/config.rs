use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{VupError, VupResult};

/// Top-level configuration (loaded from vaultup.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultupConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub store: StoreConfig,
    pub upload: UploadConfig,
    pub crypto: CryptoConfig,
}

impl VaultupConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> VupResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: VaultupConfig = toml::from_str(&text)
            .map_err(|e| VupError::Config(format!("{}: {e}", path.display())))?;
        config.upload.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// Key prefix under which revisions and blocks are stored
    pub prefix: String,
    /// Lifetime of an uncommitted revision session (default: 4h)
    pub session_ttl_secs: u64,
    /// Remote storage quota in bytes (None = unlimited)
    pub quota_bytes: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            root: PathBuf::from("~/.local/share/vaultup/remote"),
            prefix: "vaultup".into(),
            session_ttl_secs: 4 * 60 * 60,
            quota_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON metadata store path
    pub state_db: PathBuf,
    /// Ciphertext block cache directory
    pub cache_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_db: PathBuf::from("~/.local/share/vaultup/state.json"),
            cache_dir: PathBuf::from("~/.cache/vaultup/blocks"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    Serial,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum cleartext bytes per block (default: 4 MiB)
    pub max_block_size: u64,
    /// Files processed concurrently
    pub max_concurrent_files: usize,
    pub encryption_mode: EncryptionMode,
    /// Parallel encryption window (0 = available processors)
    pub encryption_workers: usize,
    /// Concurrent block uploads across all jobs
    pub transfer_concurrency: usize,
    /// Attempts per job before a retryable failure turns fatal
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub thumbnail_max_weight: usize,
    pub photo_thumbnail_max_weight: usize,
    pub thumbnail_max_dimension: u32,
    pub photo_thumbnail_max_dimension: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_block_size: 4 * 1024 * 1024,
            max_concurrent_files: 5,
            encryption_mode: EncryptionMode::Parallel,
            encryption_workers: 0,
            transfer_concurrency: 15,
            max_retries: 10,
            backoff_base_ms: 1000,
            backoff_max_ms: 60_000,
            thumbnail_max_weight: 60 * 1024,
            photo_thumbnail_max_weight: 1024 * 1024,
            thumbnail_max_dimension: 512,
            photo_thumbnail_max_dimension: 1920,
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> VupResult<()> {
        if self.max_block_size == 0 {
            return Err(VupError::Config("upload.max_block_size must be > 0".into()));
        }
        if self.max_concurrent_files == 0 {
            return Err(VupError::Config(
                "upload.max_concurrent_files must be > 0".into(),
            ));
        }
        if self.transfer_concurrency == 0 {
            return Err(VupError::Config(
                "upload.transfer_concurrency must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Encryption window size, resolving 0 to the processor count.
    pub fn effective_workers(&self) -> usize {
        match self.encryption_mode {
            EncryptionMode::Serial => 1,
            EncryptionMode::Parallel if self.encryption_workers > 0 => self.encryption_workers,
            EncryptionMode::Parallel => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

/// Key derivation and keyring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// Address keyring JSON file
    pub keyring_file: PathBuf,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            keyring_file: PathBuf::from("~/.config/vaultup/keyring.json"),
        }
    }
}
