//! Error types for the storage engine
//!
//! Every fallible engine operation returns [`Result`]. Callers that need the
//! coarse status classification (for example to build a protocol reply) use
//! [`Error::kind`].

use thiserror::Error;

/// Common result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse status classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    IoError,
    NotFound,
    InvalidArgument,
    Corruption,
    Busy,
}

/// Storage engine error
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open engine at {path}: {message}")]
    EngineOpen { path: String, message: String },

    #[error("redb database error: {0}")]
    Database(Box<redb::DatabaseError>),

    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    Table(Box<redb::TableError>),

    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),

    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("busy: {0}")]
    Busy(String),
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Database(Box::new(e))
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Self::Table(Box::new(e))
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a busy error
    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    /// Error returned when a command hits a key of another type
    #[must_use]
    pub fn wrong_type() -> Self {
        Self::InvalidArgument(
            "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
        )
    }

    /// Status classification
    #[must_use]
    pub fn kind(&self) -> StatusKind {
        match self {
            Self::NotFound(_) => StatusKind::NotFound,
            Self::InvalidArgument(_) => StatusKind::InvalidArgument,
            Self::Corruption(_) => StatusKind::Corruption,
            Self::Busy(_) => StatusKind::Busy,
            Self::EngineOpen { .. }
            | Self::Database(_)
            | Self::Storage(_)
            | Self::Table(_)
            | Self::Transaction(_)
            | Self::Commit(_)
            | Self::Io(_)
            | Self::Manifest(_) => StatusKind::IoError,
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == StatusKind::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        assert_eq!(Error::wrong_type().kind(), StatusKind::InvalidArgument);
        assert_eq!(Error::busy("closed").kind(), StatusKind::Busy);
        assert_eq!(Error::corruption("bad meta").kind(), StatusKind::Corruption);
        assert!(Error::NotFound("checkpoint".into()).is_not_found());

        let io = Error::from(std::io::Error::other("disk gone"));
        assert_eq!(io.kind(), StatusKind::IoError);
    }

    #[test]
    fn test_engine_open_message() {
        let e = Error::EngineOpen {
            path: "/tmp/db0".into(),
            message: "locked".into(),
        };
        assert_eq!(e.to_string(), "failed to open engine at /tmp/db0: locked");
    }
}
