//! OpenDAL Operator factory for vaultup storage backends

use anyhow::{Context, Result};
use opendal::Operator;

use vup_core::config::{StorageBackend, StorageConfig};

/// Build an OpenDAL Operator for the configured backend.
///
/// `root` must already have `~` expanded; the fs backend creates it on demand.
pub fn build_operator(cfg: &StorageConfig) -> Result<Operator> {
    let op = match cfg.backend {
        StorageBackend::Fs => {
            let root = cfg.root.to_string_lossy();
            let builder = opendal::services::Fs::default().root(&root);
            Operator::new(builder)
                .with_context(|| format!("creating OpenDAL fs operator at {root}"))?
                .layer(opendal::layers::LoggingLayer::default())
                .layer(
                    opendal::layers::RetryLayer::new()
                        .with_max_times(3)
                        .with_jitter(),
                )
                .finish()
        }
        StorageBackend::Memory => Operator::new(opendal::services::Memory::default())
            .context("creating OpenDAL memory operator")?
            .layer(opendal::layers::LoggingLayer::default())
            .finish(),
    };
    Ok(op)
}
