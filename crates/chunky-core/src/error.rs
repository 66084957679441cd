use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChunkyError>;

#[derive(Debug, Error)]
pub enum ChunkyError {
    #[error("not found: '{0}'")]
    NotFound(String),

    #[error("corrupt commit: {0}")]
    CorruptCommit(String),

    #[error("corrupt pack: {0}")]
    CorruptPack(String),

    #[error("content hash mismatch for '{0}'")]
    HashMismatch(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("operation canceled")]
    Canceled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("{0}")]
    Shared(Arc<ChunkyError>),

    #[error("{0}")]
    Other(String),
}

impl ChunkyError {
    /// Whether this error means "the object does not exist", as opposed to a
    /// transport or decode failure. Drives the revision resolver's tag
    /// fallback and tag reads that treat a missing file as empty history.
    pub fn is_not_found(&self) -> bool {
        match self {
            ChunkyError::NotFound(_) => true,
            ChunkyError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            ChunkyError::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }

    /// Whether this error is a decode failure of a stored object rather than
    /// an I/O problem. The local cache deletes-and-continues on these.
    pub fn is_corrupt_encoding(&self) -> bool {
        match self {
            ChunkyError::CorruptCommit(_)
            | ChunkyError::CorruptPack(_)
            | ChunkyError::Deserialization(_) => true,
            ChunkyError::Shared(inner) => inner.is_corrupt_encoding(),
            _ => false,
        }
    }
}
