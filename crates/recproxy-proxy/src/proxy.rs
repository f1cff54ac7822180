//! Recording proxy server.
//!
//! Accepts client connections, serves HTTP/1.x on each and runs every request
//! through an [`Exchange`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::Instrument;

use recproxy_core::{ClientAddress, PathMapper};

use crate::error::{ProxyError, Result};
use crate::exchange::{Exchange, ExchangeContext};
use crate::transport::{Timeouts, Transports, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT};
use crate::DEFAULT_PROXY_PORT;

/// Default capture root, relative to the working directory.
pub const DEFAULT_CAPTURE_ROOT: &str = "work";

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// Directory captures and access logs are written under.
    pub capture_root: PathBuf,
    /// Upstream connect timeout.
    pub connect_timeout: Duration,
    /// Idle limit on client uploads and on the origin.
    pub idle_timeout: Duration,
}

impl ProxyConfig {
    /// Sets the bind address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port, keeping the bind IP.
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }

    /// Sets the capture root.
    pub fn with_capture_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.capture_root = root.into();
        self
    }

    /// Sets the upstream connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the idle limit on client uploads and on the origin.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: self.connect_timeout,
            idle: self.idle_timeout,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            capture_root: PathBuf::from(DEFAULT_CAPTURE_ROOT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Recording forward proxy.
#[derive(Debug)]
pub struct ProxyServer {
    addr: SocketAddr,
    ctx: Arc<ExchangeContext>,
}

impl ProxyServer {
    /// Creates a proxy with the default plaintext and TLS transports.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let transports = Transports::new(config.timeouts())?;
        Self::with_transports(config, transports)
    }

    /// Creates a proxy with custom upstream transports.
    pub fn with_transports(config: ProxyConfig, transports: Transports) -> Result<Self> {
        let mapper = PathMapper::new(&config.capture_root)?;
        let ctx = ExchangeContext::new(mapper, transports, config.idle_timeout);

        Ok(Self {
            addr: config.addr,
            ctx: Arc::new(ctx),
        })
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the absolute capture root.
    pub fn capture_root(&self) -> &Path {
        self.ctx.mapper().root()
    }

    /// Binds and serves until the task is dropped.
    pub async fn run(self) -> Result<()> {
        let listener = bind(self.addr).await?;
        serve(listener, self.ctx).await;
        Ok(())
    }

    /// Binds the listener and serves in the background.
    ///
    /// Bind errors are returned here rather than from the spawned task.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = bind(self.addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let ctx = self.ctx;

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = serve(listener, ctx) => {}
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
#[derive(Debug)]
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to stop accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the accept loop to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Bind(addr, e))?;
    tracing::info!("Recording proxy listening on {}", listener.local_addr()?);
    Ok(listener)
}

async fn serve(listener: TcpListener, ctx: Arc<ExchangeContext>) {
    let next_id = AtomicU64::new(1);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Typically fd exhaustion; back off instead of spinning.
                tracing::error!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let client = ClientAddress::from(peer);
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("conn", id, client = %client);
        tokio::spawn(serve_connection(stream, client, ctx.clone()).instrument(span));
    }
}

async fn serve_connection(stream: TcpStream, client: ClientAddress, ctx: Arc<ExchangeContext>) {
    tracing::debug!("client connected");
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
    }

    let service = service_fn(move |request| {
        Exchange::new(ctx.clone(), client.clone()).handle(request)
    });

    let result = http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(TokioIo::new(stream), service)
        .await;

    match result {
        Ok(()) => tracing::debug!("client connection closed"),
        Err(e) if e.is_incomplete_message() => {
            tracing::debug!("client closed connection mid-request")
        }
        Err(e) => tracing::debug!(error = %e, "client connection ended with error"),
    }
}
