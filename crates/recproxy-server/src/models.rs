//! Admin response models.

use chrono::{DateTime, Local};
use serde::Serialize;

/// Response body for the clear operation.
#[derive(Debug, Serialize)]
pub struct ClearResponse {
    /// Client whose captures were targeted.
    pub client: String,
    /// False when the client had nothing recorded.
    pub cleared: bool,
}

/// One row of a directory listing.
#[derive(Debug, Clone)]
pub struct ListingEntry {
    pub name: String,
    pub is_dir: bool,
    /// File size in bytes; `None` for directories.
    pub size: Option<u64>,
    pub modified: Option<DateTime<Local>>,
}

impl ListingEntry {
    /// Sort key: directories first, then by name.
    pub fn sort_key(&self) -> (bool, &str) {
        (!self.is_dir, self.name.as_str())
    }
}
