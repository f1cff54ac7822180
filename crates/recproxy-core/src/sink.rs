//! On-disk capture of one response body.
//!
//! A [`CaptureSink`] is owned by exactly one exchange. Capture is best effort:
//! if the directory cannot be prepared the sink is never opened, and if a
//! write fails the sink stops writing. Either way the exchange keeps relaying
//! to its client.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::error::{CaptureError, Result};

/// Result of a closed capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOutcome {
    /// Path of the capture file.
    pub path: PathBuf,
    /// Bytes successfully written.
    pub bytes_written: u64,
    /// Whether every chunk reached the file and it was flushed cleanly.
    pub persisted: bool,
}

/// Streaming writer for one capture file.
#[derive(Debug)]
pub struct CaptureSink {
    path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
    failed: bool,
}

impl CaptureSink {
    /// Creates the parent directories and the capture file.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let parent = path
            .parent()
            .ok_or_else(|| CaptureError::NoParent(path.clone()))?;

        prepare_dir(parent).await?;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => CaptureError::AlreadyExists(path.clone()),
                _ => CaptureError::Io(e),
            })?;

        Ok(Self {
            path,
            file: Some(file),
            bytes_written: 0,
            failed: false,
        })
    }

    /// Opens a capture, logging and returning `None` when it cannot be created.
    pub async fn open(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        match Self::create(&path).await {
            Ok(sink) => {
                debug!(path = %path.display(), "capture opened");
                Some(sink)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "capture disabled for this exchange");
                None
            }
        }
    }

    /// Returns the capture file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Returns true while the sink still accepts data.
    pub fn is_active(&self) -> bool {
        self.file.is_some()
    }

    /// Appends a chunk. The first failure closes the file and disables the sink.
    pub async fn write(&mut self, chunk: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };

        match file.write_all(chunk).await {
            Ok(()) => self.bytes_written += chunk.len() as u64,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "capture write failed, disabling capture");
                self.file = None;
                self.failed = true;
            }
        }
    }

    /// Flushes and closes the file.
    pub async fn close(mut self) -> CaptureOutcome {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                error!(path = %self.path.display(), error = %e, "capture flush failed");
                self.failed = true;
            }
        }

        debug!(
            path = %self.path.display(),
            bytes = self.bytes_written,
            failed = self.failed,
            "capture closed"
        );

        CaptureOutcome {
            path: std::mem::take(&mut self.path),
            bytes_written: self.bytes_written,
            persisted: !self.failed,
        }
    }
}

/// Creates `dir` and its ancestors. Concurrent creators are fine; a regular
/// file anywhere on the chain is reported as [`CaptureError::Blocked`].
async fn prepare_dir(dir: &Path) -> Result<()> {
    match fs::create_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) => match blocking_file(dir).await {
            Some(blocker) => Err(CaptureError::Blocked(blocker)),
            None => Err(CaptureError::Io(e)),
        },
    }
}

/// Finds the nearest existing ancestor of `dir` that is not a directory.
async fn blocking_file(dir: &Path) -> Option<PathBuf> {
    for ancestor in dir.ancestors() {
        if let Ok(meta) = fs::metadata(ancestor).await {
            return (!meta.is_dir()).then(|| ancestor.to_path_buf());
        }
    }
    None
}
