//! Per-client access log.
//!
//! Each completed exchange appends one line to
//! `{root}/{client}/access_log.txt`:
//!
//! ```text
//! [2024-03-05 07:08:09.042] - 200 - 5 - http://example.test/foo.txt - 10.1.2.3/http/example.test/80/foo.txt.2024-03-05T07-08-09-042
//! ```
//!
//! The size is read back from the closed capture file and is `unknown` when
//! nothing was persisted. Paths are relative to the capture root; an exchange
//! whose capture file was never created logs `-` instead.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::path_map::CaptureTarget;
use crate::target::ClientAddress;

/// Name of the per-client log file.
pub const ACCESS_LOG_FILE: &str = "access_log.txt";

/// `strftime` pattern of the line timestamp.
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Size column of an access-log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSize {
    /// Size of the capture file.
    Bytes(u64),
    /// Capture was disabled or the file could not be inspected.
    Unknown,
}

impl fmt::Display for ResponseSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(n) => write!(f, "{}", n),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// One completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogEntry {
    /// When the exchange completed.
    pub timestamp: DateTime<Local>,
    /// Upstream status code.
    pub status: u16,
    /// Captured response size.
    pub size: ResponseSize,
    /// Request URL as received from the client.
    pub url: String,
    /// Capture path relative to the capture root, if a capture was opened.
    pub capture_path: Option<PathBuf>,
}

impl fmt::Display for AccessLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] - {} - {} - {} - ",
            self.timestamp.format(LOG_TIMESTAMP_FORMAT),
            self.status,
            self.size,
            self.url,
        )?;
        match &self.capture_path {
            Some(path) => write!(f, "{}", path.display()),
            None => f.write_str("-"),
        }
    }
}

/// Appends access-log lines under a capture root.
#[derive(Debug, Clone)]
pub struct AccessLogger {
    root: PathBuf,
}

impl AccessLogger {
    /// Creates a logger writing under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the log file of one client.
    pub fn log_path(&self, client: &ClientAddress) -> PathBuf {
        self.root.join(client.as_str()).join(ACCESS_LOG_FILE)
    }

    /// Records a completed exchange, reading the captured size from disk.
    ///
    /// `capture` is `None` when the exchange never opened its capture file.
    pub async fn record(
        &self,
        client: &ClientAddress,
        status: u16,
        url: &str,
        capture: Option<&CaptureTarget>,
        persisted: bool,
    ) -> Result<AccessLogEntry> {
        let size = match capture {
            Some(target) if persisted => captured_size(&target.path).await,
            _ => ResponseSize::Unknown,
        };

        let entry = AccessLogEntry {
            timestamp: Local::now(),
            status,
            size,
            url: url.to_string(),
            capture_path: capture.map(|target| target.relative.clone()),
        };

        self.append(client, &entry).await?;
        Ok(entry)
    }

    /// Appends one entry as a single line.
    ///
    /// The whole line goes out in one append-mode write, so lines from
    /// concurrent exchanges never interleave.
    pub async fn append(&self, client: &ClientAddress, entry: &AccessLogEntry) -> Result<()> {
        let path = self.log_path(client);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let line = format!("{}\n", entry);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        tracing::debug!(log = %path.display(), "access log appended");
        Ok(())
    }
}

async fn captured_size(path: &Path) -> ResponseSize {
    match fs::metadata(path).await {
        Ok(meta) => ResponseSize::Bytes(meta.len()),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not stat capture file");
            ResponseSize::Unknown
        }
    }
}
