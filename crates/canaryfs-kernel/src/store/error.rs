//! Store error types.

use std::io;
use thiserror::Error;

/// Store error type.
///
/// Every variant is recoverable: the dispatcher translates it into a protocol
/// errno and the session carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Operation would grow total content past the configured capacity.
    #[error("capacity exceeded: {requested} bytes requested, {available} available")]
    CapacityExceeded { requested: u64, available: u64 },

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Invalid path (relative, empty component, or moves a directory into itself).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// File name too long.
    #[error("file name too long: {0}")]
    NameTooLong(String),

    /// Operation not permitted on this node (e.g. removing the root).
    #[error("operation not permitted: {0}")]
    PermissionDenied(String),
}

impl StoreError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a NotEmpty error.
    pub fn not_empty(path: impl Into<String>) -> Self {
        Self::NotEmpty(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }
}

/// Convert StoreError to std::io::Error for compatibility.
impl From<StoreError> for io::Error {
    fn from(e: StoreError) -> Self {
        let kind = match &e {
            StoreError::NotFound(_) => io::ErrorKind::NotFound,
            StoreError::AlreadyExists(_) => io::ErrorKind::AlreadyExists,
            StoreError::NotEmpty(_) => io::ErrorKind::DirectoryNotEmpty,
            StoreError::CapacityExceeded { .. } => io::ErrorKind::StorageFull,
            StoreError::NotADirectory(_) => io::ErrorKind::NotADirectory,
            StoreError::IsADirectory(_) => io::ErrorKind::IsADirectory,
            StoreError::InvalidPath(_) | StoreError::NameTooLong(_) => {
                io::ErrorKind::InvalidInput
            }
            StoreError::PermissionDenied(_) => io::ErrorKind::PermissionDenied,
        };
        io::Error::new(kind, e.to_string())
    }
}

/// Store result type.
pub type StoreResult<T> = Result<T, StoreError>;
