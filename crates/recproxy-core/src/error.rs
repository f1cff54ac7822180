//! Error types for capture and access logging.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while persisting captured traffic.
///
/// None of these ever reach a proxy client. Callers log them and carry on
/// relaying without persistence.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// IO error from the filesystem.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A path component that should be a directory is a regular file.
    #[error("capture directory blocked by a file at {0}")]
    Blocked(PathBuf),

    /// The capture target has no parent directory.
    #[error("capture target has no parent directory: {0}")]
    NoParent(PathBuf),

    /// Another exchange already owns the capture target.
    #[error("capture target already exists: {0}")]
    AlreadyExists(PathBuf),
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
