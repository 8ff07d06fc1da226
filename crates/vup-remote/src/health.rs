//! Startup health check for the remote object store

use anyhow::{Context, Result};

use crate::api::RemoteApi;
use crate::opendal_remote::OpendalRemote;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// OpenDAL scheme of the backing operator (`fs`, `memory`, ...)
    pub backend: String,
    /// Remaining quota; `None` when unlimited
    pub available_bytes: Option<u64>,
}

/// Verify the backend answers a listing and read the remaining budget.
pub async fn check_health(remote: &OpendalRemote) -> Result<HealthReport> {
    let op = remote.operator();
    let backend = op.info().scheme().to_string();
    op.list("/")
        .await
        .with_context(|| format!("listing {backend} storage root"))?;
    let available_bytes = remote
        .available_bytes()
        .await
        .context("reading storage usage")?;
    Ok(HealthReport {
        backend,
        available_bytes,
    })
}
