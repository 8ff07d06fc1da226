use thiserror::Error;

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The transport dropped mid-request; safe to resend as-is.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("revision session expired: {0}")]
    ExpiredResource(String),

    #[error("insufficient storage: need {needed} bytes, {available} available")]
    Quota { needed: u64, available: u64 },

    #[error("revision already committed: {0}")]
    AlreadyCommitted(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    pub(crate) fn from_opendal(e: opendal::Error, what: &str) -> Self {
        match e.kind() {
            opendal::ErrorKind::NotFound => RemoteError::NotFound(what.to_string()),
            _ if e.is_temporary() => RemoteError::ConnectionLost(format!("{what}: {e}")),
            _ => RemoteError::Network(format!("{what}: {e}")),
        }
    }
}
