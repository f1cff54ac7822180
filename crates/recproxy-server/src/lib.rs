//! recproxy admin server - browse and clear recorded captures.
//!
//! Serves the capture root over HTTP on its own port.
//!
//! ## Endpoints
//!
//! - Any path or query containing `clear` - delete the caller's captures
//! - `GET /{dir}/` - HTML index of a capture directory
//! - `GET /{file}` - download a capture file or access log
//!
//! ## Example
//!
//! ```no_run
//! use recproxy_server::{AdminConfig, AdminServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = AdminServer::new(AdminConfig::default()).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::info;

use recproxy_core::PathMapper;

pub use error::{AdminError, Result};
pub use handlers::CLEAR_TOKEN;
pub use state::AdminState;

/// Default admin port.
pub const DEFAULT_ADMIN_PORT: u16 = 8081;

/// Default admin host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Admin server configuration.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Address to bind to.
    pub addr: SocketAddr,
    /// Capture root to serve.
    pub root: PathBuf,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_ADMIN_PORT)),
            root: PathBuf::from("work"),
        }
    }
}

impl AdminConfig {
    /// Sets the bind address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }

    /// Sets the capture root.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Capture root could not be resolved.
    #[error("invalid capture root {0}: {1}")]
    Root(PathBuf, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// The admin HTTP server.
pub struct AdminServer {
    router: Router,
    addr: SocketAddr,
}

impl AdminServer {
    /// Creates a server for the given configuration.
    pub fn new(config: AdminConfig) -> std::result::Result<Self, ServerError> {
        let mapper =
            PathMapper::new(&config.root).map_err(|e| ServerError::Root(config.root.clone(), e))?;
        Ok(Self::with_state(config.addr, AdminState::new(mapper)))
    }

    /// Creates a server with prepared state.
    pub fn with_state(addr: SocketAddr, state: AdminState) -> Self {
        Self {
            router: router(state),
            addr,
        }
    }

    /// Returns the configured address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the router for testing.
    ///
    /// Handlers extract `ConnectInfo<SocketAddr>`; in-process callers must
    /// supply it, e.g. with `MockConnectInfo`.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Runs the server until it fails.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        let listener = bind_listener(self.addr)?;
        info!("Admin server listening on {}", self.addr);

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| ServerError::Runtime(e.to_string()))?;

        Ok(())
    }

    /// Binds and serves in the background.
    pub async fn start(self) -> std::result::Result<AdminHandle, ServerError> {
        let listener = bind_listener(self.addr)?;
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        info!("Admin server listening on {}", addr);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let router = self.router;

        let handle = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Admin server shutdown signal received");
            })
            .await;

            if let Err(e) = result {
                tracing::error!("Admin server error: {}", e);
            }
        });

        Ok(AdminHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running admin server.
#[derive(Debug)]
pub struct AdminHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl AdminHandle {
    /// Returns the bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the server to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Shuts down and waits for in-flight requests to finish.
    pub async fn stop(self) {
        self.shutdown();
        let _ = self.handle.await;
    }
}

fn router(state: AdminState) -> Router {
    Router::new()
        .fallback(handlers::browse)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Binds with SO_REUSEADDR so restarts are not blocked by TIME_WAIT sockets.
fn bind_listener(addr: SocketAddr) -> std::result::Result<TcpListener, ServerError> {
    let bind_err = |e| ServerError::BindError(addr, e);

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(128).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(bind_err)
}
