//! Shared state for the admin server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use recproxy_core::{ClientAddress, PathMapper};

/// Shared admin state.
#[derive(Debug, Clone)]
pub struct AdminState {
    /// Layout of the capture root, shared with the proxy's naming rules.
    pub mapper: Arc<PathMapper>,
}

impl AdminState {
    /// Creates state serving `mapper`'s capture root.
    pub fn new(mapper: PathMapper) -> Self {
        Self {
            mapper: Arc::new(mapper),
        }
    }

    /// Returns the capture root.
    pub fn root(&self) -> &Path {
        self.mapper.root()
    }

    /// Returns the directory holding everything recorded for `client`.
    pub fn client_dir(&self, client: &ClientAddress) -> PathBuf {
        self.mapper.client_dir(client)
    }
}
