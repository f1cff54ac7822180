//! recproxy proxy - recording forward HTTP proxy.
//!
//! Clients send absolute-form requests (`GET http://host/path HTTP/1.1`).
//! Each request is forwarded to its origin over plain TCP or TLS, and the
//! response is streamed back to the client while the same bytes are written
//! to a per-request capture file.
//!
//! ## Features
//!
//! - One capture file per response, laid out by client, scheme, host and port
//! - Per-client access log, one line per completed exchange
//! - Capture failures never affect what the client receives
//! - Client disconnects tear down the upstream connection promptly
//!
//! ## Architecture
//!
//! ```text
//! Client ──► ProxyServer ──► Exchange ──► UpstreamTransport ──► Origin
//!                               │
//!                               ▼ (relay task)
//!                 ┌─────────────┴─────────────┐
//!                 ▼                           ▼
//!          client response              CaptureSink
//!                                             │
//!                                             ▼
//!                                        AccessLogger
//! ```

mod error;
pub mod exchange;
mod proxy;
pub mod transport;

pub use error::{BoxError, ProxyError, Result};
pub use exchange::{Exchange, ExchangeContext, ExchangeState, ProxyRequest};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer, DEFAULT_CAPTURE_ROOT};
pub use transport::{
    PlainTransport, ProxyBody, Timeouts, TlsTransport, Transports, UpstreamResponse,
    UpstreamTransport,
};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;
