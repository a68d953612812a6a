//! Error types for storage driver operations.

/// Result type for storage driver operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No value is stored under the key.
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// A value is already stored under the key. Writes never overwrite.
    #[error("key already exists: {key}")]
    AlreadyExists { key: String },

    /// The key cannot be mapped onto a backend object path.
    #[error("invalid storage key '{key}': {source}")]
    InvalidKey {
        key: String,
        source: object_store::path::Error,
    },

    #[error("invalid storage backend: {0}")]
    InvalidBackend(String),

    #[error("invalid storage configuration: {0}")]
    Config(String),

    /// Another process holds the lock file of a disk store.
    #[error("storage directory is locked by another process: {path}")]
    Locked { path: String },

    /// The caller's cancellation token fired before the operation finished.
    #[error("storage operation cancelled")]
    Cancelled,

    #[error("failed to presign url for key {key}: {source}")]
    Signing { key: String, source: anyhow::Error },

    /// Writing the throwaway object used to discover the presigned URL
    /// origin failed.
    #[error("error putting file in bucket at key {key}: {source}")]
    ProbeWrite { key: String, source: Box<Error> },

    #[error(transparent)]
    Store { source: object_store::Error },

    #[error(transparent)]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Maps a backend error for `key`, keeping the not-found and
    /// already-exists conditions distinguishable from generic failures.
    pub(crate) fn from_store(key: &str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => Error::NotFound {
                key: key.to_string(),
            },
            object_store::Error::AlreadyExists { .. } => Error::AlreadyExists {
                key: key.to_string(),
            },
            source => Error::Store { source },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

impl From<object_store::Error> for Error {
    fn from(source: object_store::Error) -> Self {
        Error::Store { source }
    }
}
