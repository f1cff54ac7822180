//! Error types for the proxy.

use std::net::SocketAddr;

use thiserror::Error;

/// Boxed error carried by proxied bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to bind the proxy listener.
    #[error("failed to bind to {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Request target the proxy cannot forward.
    #[error("invalid request target: {0}")]
    InvalidTarget(String),

    /// Could not reach the origin.
    #[error("upstream connect to {addr} failed: {source}")]
    Connect {
        /// `host:port` of the origin.
        addr: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The origin went quiet for longer than the configured timeout.
    #[error("upstream timed out waiting for {0}")]
    Timeout(&'static str),

    /// The client went away before its request body was complete.
    #[error("client closed the connection before the request body completed")]
    ClientAborted,

    /// Upstream transport error.
    #[error("upstream error: {0}")]
    Upstream(BoxError),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
