use thiserror::Error;

#[derive(Debug, Error)]
pub enum HygieneError {
    #[error("invalid lab id: {0}")]
    InvalidLabId(String),

    #[error("path escapes base directory: {0}")]
    PathEscapesBase(String),

    #[error("path is not a safe relative path: {0}")]
    UnsafeRelativePath(String),

    #[error("evidence tree contains a symlink: {0}")]
    SymlinkInTree(String),

    #[error("filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),
}
