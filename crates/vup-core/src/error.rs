use thiserror::Error;

pub type VupResult<T> = Result<T, VupError>;

#[derive(Debug, Error)]
pub enum VupError {
    #[error("store error: {0}")]
    Store(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("upload error: {0}")]
    Upload(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
