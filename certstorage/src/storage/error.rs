use thiserror::Error;

use crate::lock::MutexError;

/// Coarse classification of a [`StorageError`].
///
/// Callers branch on this instead of inspecting error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Init,
    NotFound,
    LockNotCached,
    Backend,
    MalformedMetadata,
    Lock,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("certstorage: initialization failed: {context}")]
    Init {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("certstorage: key does not exist: {key}")]
    NotFound { key: String },

    #[error("certstorage: mutex for {name} not exists")]
    LockNotCached { name: String },

    #[error("certstorage: {op} {key}: {source}")]
    Backend {
        op: &'static str,
        key: String,
        #[source]
        source: object_store::Error,
    },

    #[error("certstorage: malformed {field} for {key}: {value:?}: {reason}")]
    MalformedMetadata {
        key: String,
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("certstorage: lock {name}: {source}")]
    Lock {
        name: String,
        #[source]
        source: MutexError,
    },

    #[error("certstorage: operation cancelled")]
    Cancelled,
}

impl StorageError {
    /// Translates an object store failure. This is the only place where
    /// "not found" is recognized; everything above matches on the kind.
    pub(crate) fn from_store(op: &'static str, key: &str, source: object_store::Error) -> Self {
        match source {
            object_store::Error::NotFound { .. } => Self::NotFound {
                key: key.to_string(),
            },
            source => Self::Backend {
                op,
                key: key.to_string(),
                source,
            },
        }
    }

    pub(crate) fn init(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Init {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Init { .. } => ErrorKind::Init,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::LockNotCached { .. } => ErrorKind::LockNotCached,
            Self::Backend { .. } => ErrorKind::Backend,
            Self::MalformedMetadata { .. } => ErrorKind::MalformedMetadata,
            Self::Lock {
                source: MutexError::Cancelled,
                ..
            }
            | Self::Cancelled => ErrorKind::Cancelled,
            Self::Lock { .. } => ErrorKind::Lock,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
