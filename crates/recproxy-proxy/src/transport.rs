//! Upstream transports.
//!
//! The exchange engine hands a prepared request to an [`UpstreamTransport`]
//! and gets the origin's response head plus a streaming body back. The
//! plaintext and TLS variants differ only in how the byte stream is set up;
//! both speak HTTP/1.1 over a dedicated connection per exchange.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, Sleep};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use recproxy_core::{Scheme, TargetUrl};

use crate::error::{BoxError, ProxyError, Result};

/// Body type used on both sides of the proxy.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Default time allowed to establish an upstream connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default gap allowed between upload frames, before the response head, and
/// between response body chunks.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upstream timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Limit on TCP connect plus TLS handshake.
    pub connect: Duration,
    /// Limit on silence from the client while uploading, or from the origin.
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            idle: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Aborts the upstream connection task when dropped.
#[derive(Debug)]
pub struct ConnectionGuard(JoinHandle<()>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Response from an origin, tied to the connection that carries its body.
#[derive(Debug)]
pub struct UpstreamResponse {
    /// Response head and streaming body.
    pub response: Response<ProxyBody>,
    /// Connection driver; dropping it tears the connection down.
    pub connection: Option<ConnectionGuard>,
}

/// Sends one request to an origin.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Connects to `target` and sends `request` (already in origin form).
    ///
    /// Resolves once the response head has arrived.
    async fn dispatch(
        &self,
        target: &TargetUrl,
        request: Request<ProxyBody>,
    ) -> Result<UpstreamResponse>;
}

/// Plain TCP transport for `http://` targets.
#[derive(Debug, Clone, Default)]
pub struct PlainTransport {
    timeouts: Timeouts,
}

impl PlainTransport {
    /// Creates a plaintext transport.
    pub fn new(timeouts: Timeouts) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl UpstreamTransport for PlainTransport {
    async fn dispatch(
        &self,
        target: &TargetUrl,
        request: Request<ProxyBody>,
    ) -> Result<UpstreamResponse> {
        let stream = connect_tcp(target, self.timeouts.connect).await?;
        send_request(stream, request, self.timeouts.idle).await
    }
}

/// TLS transport for `https://` targets.
///
/// The proxy originates its own TLS session to the origin, verified against
/// the platform's root certificates.
#[derive(Clone)]
pub struct TlsTransport {
    connector: TlsConnector,
    timeouts: Timeouts,
}

impl fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsTransport")
            .field("connector", &"TlsConnector")
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl TlsTransport {
    /// Creates a TLS transport trusting the native root store.
    pub fn new(timeouts: Timeouts) -> Result<Self> {
        Ok(Self::with_config(native_client_config()?, timeouts))
    }

    /// Creates a TLS transport from a prepared rustls client config.
    pub fn with_config(config: ClientConfig, timeouts: Timeouts) -> Self {
        Self {
            connector: TlsConnector::from(Arc::new(config)),
            timeouts,
        }
    }
}

#[async_trait]
impl UpstreamTransport for TlsTransport {
    async fn dispatch(
        &self,
        target: &TargetUrl,
        request: Request<ProxyBody>,
    ) -> Result<UpstreamResponse> {
        let server_name = ServerName::try_from(target.connect_host().to_string())
            .map_err(|e| ProxyError::Tls(e.to_string()))?;

        let handshake = async {
            let stream = connect_tcp(target, self.timeouts.connect).await?;
            self.connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ProxyError::Tls(e.to_string()))
        };
        let stream = timeout(self.timeouts.connect, handshake)
            .await
            .map_err(|_| ProxyError::Timeout("TLS handshake"))??;

        send_request(stream, request, self.timeouts.idle).await
    }
}

/// Transport selection by scheme.
#[derive(Clone)]
pub struct Transports {
    http: Arc<dyn UpstreamTransport>,
    https: Arc<dyn UpstreamTransport>,
}

impl fmt::Debug for Transports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transports").finish_non_exhaustive()
    }
}

impl Transports {
    /// Creates the default plaintext and TLS transports.
    pub fn new(timeouts: Timeouts) -> Result<Self> {
        Ok(Self::with(
            PlainTransport::new(timeouts),
            TlsTransport::new(timeouts)?,
        ))
    }

    /// Uses custom transports.
    pub fn with(
        http: impl UpstreamTransport + 'static,
        https: impl UpstreamTransport + 'static,
    ) -> Self {
        Self {
            http: Arc::new(http),
            https: Arc::new(https),
        }
    }

    /// Returns the transport for `scheme`.
    pub fn for_scheme(&self, scheme: Scheme) -> &dyn UpstreamTransport {
        match scheme {
            Scheme::Http => self.http.as_ref(),
            Scheme::Https => self.https.as_ref(),
        }
    }
}

fn native_client_config() -> Result<ClientConfig> {
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!(error = %e, "failed to load a native root certificate");
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!(added, ignored, "loaded native root certificates");
    if added == 0 {
        warn!("no root certificates available, https origins will fail verification");
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

async fn connect_tcp(target: &TargetUrl, limit: Duration) -> Result<TcpStream> {
    let host = target.connect_host();
    let port = target.effective_port();

    let stream = timeout(limit, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ProxyError::Timeout("connect"))?
        .map_err(|source| ProxyError::Connect {
            addr: format!("{}:{}", target.host(), port),
            source,
        })?;
    stream.set_nodelay(true)?;

    debug!(host, port, "upstream connected");
    Ok(stream)
}

async fn send_request<S>(
    stream: S,
    request: Request<ProxyBody>,
    idle: Duration,
) -> Result<UpstreamResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::Builder::new()
        .preserve_header_case(true)
        .handshake::<_, ProxyBody>(TokioIo::new(stream))
        .await?;

    let guard = ConnectionGuard(tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "upstream connection ended with error");
        }
    }));

    let (request, uploaded) = UploadBody::wrap(request, idle);
    let response = sender.send_request(request);
    tokio::pin!(response);

    // The head timer only starts once the request body is fully sent.
    let response = tokio::select! {
        response = &mut response => response,
        _ = uploaded => timeout(idle, &mut response)
            .await
            .map_err(|_| ProxyError::Timeout("response headers"))?,
    };
    let response = response.map_err(upload_error)?;

    Ok(UpstreamResponse {
        response: response.map(|body| body.map_err(BoxError::from).boxed_unsync()),
        connection: Some(guard),
    })
}

/// Request body that fails when the client stays silent for longer than
/// `idle` between frames. The paired receiver resolves once the body has
/// ended or been dropped by the connection.
struct UploadBody {
    inner: ProxyBody,
    idle: Duration,
    stall: Pin<Box<Sleep>>,
    waiting: bool,
    sent: Option<oneshot::Sender<()>>,
}

impl UploadBody {
    fn wrap(
        request: Request<ProxyBody>,
        idle: Duration,
    ) -> (Request<ProxyBody>, oneshot::Receiver<()>) {
        let (sent, uploaded) = oneshot::channel();
        let request = request.map(|inner| {
            UploadBody {
                inner,
                idle,
                stall: Box::pin(tokio::time::sleep(idle)),
                waiting: false,
                sent: Some(sent),
            }
            .boxed_unsync()
        });
        (request, uploaded)
    }

    fn finish(&mut self) {
        if let Some(sent) = self.sent.take() {
            let _ = sent.send(());
        }
    }
}

impl Body for UploadBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(frame)) => {
                this.waiting = false;
                if frame.is_err() || this.inner.is_end_stream() {
                    this.finish();
                }
                Poll::Ready(Some(frame))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => {
                if !this.waiting {
                    this.waiting = true;
                    this.stall.as_mut().reset(Instant::now() + this.idle);
                }
                match this.stall.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        debug!(timeout = ?this.idle, "client stalled mid-upload");
                        this.finish();
                        Poll::Ready(Some(Err(ProxyError::Timeout("request body").into())))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Surfaces our own request-body timeout instead of hyper's wrapper error.
fn upload_error(e: hyper::Error) -> ProxyError {
    match std::error::Error::source(&e).and_then(|s| s.downcast_ref::<ProxyError>()) {
        Some(&ProxyError::Timeout(what)) => ProxyError::Timeout(what),
        _ => ProxyError::Http(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(uri: &str) -> TargetUrl {
        TargetUrl::from_uri(&uri.parse().unwrap()).unwrap()
    }

    fn empty_request() -> Request<ProxyBody> {
        Request::new(
            http_body_util::Empty::<Bytes>::new()
                .map_err(|never| match never {})
                .boxed_unsync(),
        )
    }

    fn trickle(chunks: usize, every: Duration) -> ProxyBody {
        let stream = futures::stream::unfold(0, move |sent| async move {
            if sent == chunks {
                return None;
            }
            tokio::time::sleep(every).await;
            let frame: std::result::Result<_, BoxError> = Ok(Frame::data(Bytes::from_static(b"x")));
            Some((frame, sent + 1))
        });
        http_body_util::StreamBody::new(stream).boxed_unsync()
    }

    #[test]
    fn test_default_timeouts() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.connect, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(timeouts.idle, DEFAULT_IDLE_TIMEOUT);
    }

    #[test]
    fn test_tls_transport_builds() {
        let transport = TlsTransport::new(Timeouts::default());
        assert!(transport.is_ok());
        assert!(format!("{:?}", transport.unwrap()).contains("TlsTransport"));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        // Grab a free port, then close it so nothing listens there.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = PlainTransport::new(Timeouts::default());
        let err = transport
            .dispatch(&target(&format!("http://127.0.0.1:{port}/")), empty_request())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Connect { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_silent_origin_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let transport = PlainTransport::new(Timeouts {
            connect: Duration::from_secs(1),
            idle: Duration::from_millis(100),
        });
        let mut request = empty_request();
        *request.uri_mut() = "/".parse().unwrap();
        let err = transport
            .dispatch(&target(&format!("http://{addr}/")), request)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout("response headers")), "{err:?}");
        accept.abort();
    }

    // ==================== Upload Tests ====================

    #[tokio::test]
    async fn test_slow_upload_within_idle_limit_completes() {
        // 6 x 50ms is well past the 120ms limit, but no single gap is.
        let request = Request::new(trickle(6, Duration::from_millis(50)));
        let (request, uploaded) = UploadBody::wrap(request, Duration::from_millis(120));

        let body = request.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "xxxxxx");
        assert!(uploaded.await.is_ok());
    }

    #[tokio::test]
    async fn test_stalled_upload_times_out() {
        let (tx, rx) = tokio::sync::mpsc::channel::<std::result::Result<Frame<Bytes>, BoxError>>(1);
        tx.send(Ok(Frame::data(Bytes::from_static(b"x")))).await.unwrap();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        let request = Request::new(http_body_util::StreamBody::new(stream).boxed_unsync());
        let (request, uploaded) = UploadBody::wrap(request, Duration::from_millis(100));

        let err = request.into_body().collect().await.unwrap_err();
        assert!(
            matches!(err.downcast_ref::<ProxyError>(), Some(ProxyError::Timeout("request body"))),
            "{err:?}"
        );
        assert!(uploaded.await.is_ok());
        drop(tx);
    }

    #[tokio::test]
    async fn test_dropped_upload_releases_head_timer() {
        let request = Request::new(trickle(1, Duration::from_secs(5)));
        let (request, uploaded) = UploadBody::wrap(request, Duration::from_secs(5));
        drop(request);
        assert!(uploaded.await.is_err());
    }
}
