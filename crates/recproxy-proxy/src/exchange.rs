//! The proxy exchange engine.
//!
//! One [`Exchange`] drives one client request through
//!
//! ```text
//! Received -> Dispatched -> RelayingResponse -> Completed
//!                 │                 │
//!                 └──── Aborted ◄───┘
//! ```
//!
//! Once the origin's response head arrives, a relay task owns the upstream
//! body. For every chunk it first hands the chunk to the client, then mirrors
//! the very same bytes into the [`CaptureSink`]. The client side is a bounded
//! channel: when the client goes away the channel closes, the relay notices,
//! drops the upstream connection and closes the capture. When the upstream
//! body ends (cleanly or not) the capture is closed and the access-log line is
//! written, exactly once. Responses without a body (HEAD, 204, 304, an empty
//! `Content-Length`) skip the relay and are completed before returning.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Local;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Body, Frame};
use hyper::{Request, Response};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use recproxy_core::{AccessLogger, CaptureSink, CaptureTarget, ClientAddress, PathMapper, TargetUrl};

use crate::error::{BoxError, ProxyError, Result};
use crate::transport::{ConnectionGuard, ProxyBody, Transports};

/// Chunks buffered between the relay task and the client connection.
const CLIENT_BUFFER: usize = 16;

/// Lifecycle of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Request parsed, client address known.
    Received,
    /// Upstream request issued, waiting for the response head.
    Dispatched,
    /// Streaming the response body to client and capture.
    RelayingResponse,
    /// Upstream finished; capture closed and access log written.
    Completed,
    /// Client went away; resources released without an access-log line.
    Aborted,
}

impl ExchangeState {
    /// Returns true for `Completed` and `Aborted`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// Returns the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Dispatched => "dispatched",
            Self::RelayingResponse => "relaying_response",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable collaborators shared by all exchanges of one proxy.
#[derive(Debug)]
pub struct ExchangeContext {
    mapper: PathMapper,
    logger: AccessLogger,
    transports: Transports,
    idle_timeout: Duration,
}

impl ExchangeContext {
    /// Creates a context capturing under the mapper's root.
    pub fn new(mapper: PathMapper, transports: Transports, idle_timeout: Duration) -> Self {
        let logger = AccessLogger::new(mapper.root());
        Self {
            mapper,
            logger,
            transports,
            idle_timeout,
        }
    }

    /// Returns the path mapper.
    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    /// Returns the access logger.
    pub fn logger(&self) -> &AccessLogger {
        &self.logger
    }
}

/// An inbound request addressed to the proxy.
#[derive(Debug)]
pub struct ProxyRequest<B> {
    /// Client that sent the request.
    pub client: ClientAddress,
    /// Destination parsed from the absolute-form target.
    pub target: TargetUrl,
    /// Request URL exactly as received.
    pub url: String,
    request: Request<B>,
}

impl<B> ProxyRequest<B> {
    /// Parses an inbound request. Fails unless the target is an absolute
    /// http or https URL.
    pub fn parse(request: Request<B>, client: ClientAddress) -> Result<Self> {
        let url = request.uri().to_string();
        let target = TargetUrl::from_uri(request.uri())
            .ok_or_else(|| ProxyError::InvalidTarget(url.clone()))?;

        Ok(Self {
            client,
            target,
            url,
            request,
        })
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        self.request.method()
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }
}

impl<B> ProxyRequest<B>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    /// Rewrites the target to origin form and wraps the body so it streams
    /// upstream. Method, headers and extensions pass through untouched.
    ///
    /// `client_aborted` is raised if the inbound body fails midway.
    fn into_upstream(self, client_aborted: Arc<AtomicBool>) -> Result<Request<ProxyBody>> {
        let origin_form = self.target.origin_form();
        let (mut parts, body) = self.request.into_parts();

        parts.uri = origin_form
            .parse::<Uri>()
            .map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
        if parts.version != Version::HTTP_10 {
            parts.version = Version::HTTP_11;
        }

        let body = body
            .map_err(move |e| -> BoxError {
                client_aborted.store(true, Ordering::SeqCst);
                e.into()
            })
            .boxed_unsync();

        Ok(Request::from_parts(parts, body))
    }
}

/// One request/response cycle proxied on behalf of one client.
#[derive(Debug)]
pub struct Exchange {
    ctx: Arc<ExchangeContext>,
    client: ClientAddress,
    state: ExchangeState,
}

impl Exchange {
    /// Creates an exchange for a request from `client`.
    pub fn new(ctx: Arc<ExchangeContext>, client: ClientAddress) -> Self {
        Self {
            ctx,
            client,
            state: ExchangeState::Received,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Proxies `request` and returns the response to send to the client.
    ///
    /// An `Err` means no response head was obtained from the origin; the
    /// connection is then closed without a response.
    pub async fn handle<B>(self, request: Request<B>) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let span = info_span!(
            "exchange",
            client = %self.client,
            method = %request.method(),
            url = %request.uri()
        );
        self.run(request).instrument(span).await
    }

    async fn run<B>(mut self, request: Request<B>) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if request.method() == Method::CONNECT {
            warn!("CONNECT tunneling is not supported");
            return Ok(status_response(StatusCode::NOT_IMPLEMENTED));
        }

        let request = match ProxyRequest::parse(request, self.client.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "rejecting request");
                return Ok(status_response(StatusCode::BAD_REQUEST));
            }
        };

        let target = request.target.clone();
        let url = request.url.clone();
        let head_only = request.method() == Method::HEAD;
        let client_aborted = Arc::new(AtomicBool::new(false));
        let upstream_request = request.into_upstream(client_aborted.clone())?;

        self.transition(ExchangeState::Dispatched);
        let upstream = match self
            .ctx
            .transports
            .for_scheme(target.scheme())
            .dispatch(&target, upstream_request)
            .await
        {
            Ok(upstream) => upstream,
            Err(e) if client_aborted.load(Ordering::SeqCst) => {
                self.transition(ExchangeState::Aborted);
                error!(error = %e, "client terminated connection before end of request body");
                return Err(ProxyError::ClientAborted);
            }
            Err(e) => {
                warn!(error = %e, "upstream request failed");
                return Err(e);
            }
        };

        let (parts, body) = upstream.response.into_parts();
        let capture = self.ctx.mapper.map(&target, &self.client, &Local::now());
        debug!(capture = %capture.path.display(), "mapped capture target");
        let sink = CaptureSink::open(&capture.path).await;

        self.transition(ExchangeState::RelayingResponse);

        // The server never polls an empty body, so these exchanges are
        // finished here rather than by a relay task.
        if head_only || has_no_body(parts.status, &body) {
            drop(body);
            drop(upstream.connection);
            self.transition(ExchangeState::Completed);
            let opened = sink.is_some();
            let persisted = close_sink(sink).await;
            record_completion(
                &self.ctx,
                &self.client,
                parts.status,
                &url,
                opened.then_some(&capture),
                persisted,
            )
            .await;
            return Ok(Response::from_parts(parts, empty_body()));
        }

        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let relay = Relay {
            ctx: self.ctx.clone(),
            client: self.client.clone(),
            url,
            status: parts.status,
            capture,
            sink,
            body,
            connection: upstream.connection,
            tx,
            state: self.state,
        };
        tokio::spawn(relay.run().in_current_span());

        Ok(Response::from_parts(parts, channel_body(rx)))
    }

    fn transition(&mut self, next: ExchangeState) {
        debug!(from = %self.state, to = %next, "exchange state");
        self.state = next;
    }
}

type ClientFrame = std::result::Result<Frame<Bytes>, BoxError>;

/// Owns the upstream body for the `RelayingResponse` phase.
struct Relay {
    ctx: Arc<ExchangeContext>,
    client: ClientAddress,
    url: String,
    status: StatusCode,
    capture: CaptureTarget,
    sink: Option<CaptureSink>,
    body: ProxyBody,
    connection: Option<ConnectionGuard>,
    tx: mpsc::Sender<ClientFrame>,
    state: ExchangeState,
}

impl Relay {
    async fn run(mut self) {
        loop {
            let idle = self.ctx.idle_timeout;
            let next = tokio::select! {
                biased;
                _ = self.tx.closed() => None,
                next = tokio::time::timeout(idle, self.body.frame()) => Some(next),
            };
            let Some(next) = next else {
                // The client side may close only because nothing was left to send.
                if self.body.is_end_stream() {
                    break;
                }
                return self.abort().await;
            };

            match next {
                Ok(Some(Ok(frame))) => match frame.into_data() {
                    Ok(chunk) => {
                        if self.tx.send(Ok(Frame::data(chunk.clone()))).await.is_err() {
                            return self.abort().await;
                        }
                        if let Some(sink) = self.sink.as_mut() {
                            sink.write(&chunk).await;
                        }
                    }
                    Err(frame) => {
                        if self.tx.send(Ok(frame)).await.is_err() {
                            return self.abort().await;
                        }
                    }
                },
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "upstream failed mid-response, truncating");
                    let _ = self.tx.send(Err(e)).await;
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(timeout = ?idle, "upstream idle timeout, truncating");
                    let _ = self
                        .tx
                        .send(Err(ProxyError::Timeout("response body").into()))
                        .await;
                    break;
                }
            }
        }

        self.complete().await
    }

    async fn complete(mut self) {
        self.transition(ExchangeState::Completed);
        let Relay {
            ctx,
            client,
            url,
            status,
            capture,
            sink,
            connection,
            tx,
            ..
        } = self;

        let opened = sink.is_some();
        let persisted = close_sink(sink).await;
        drop(tx);
        drop(connection);

        record_completion(&ctx, &client, status, &url, opened.then_some(&capture), persisted).await;
    }

    async fn abort(mut self) {
        self.transition(ExchangeState::Aborted);
        drop(self.connection.take());
        if let Some(sink) = self.sink.take() {
            sink.close().await;
        }
        debug!("client disconnected before the response completed");
    }

    fn transition(&mut self, next: ExchangeState) {
        debug!(from = %self.state, to = %next, "exchange state");
        self.state = next;
    }
}

/// Responses that carry no body regardless of their headers.
fn has_no_body(status: StatusCode, body: &ProxyBody) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || body.is_end_stream()
        || body.size_hint().exact() == Some(0)
}

async fn close_sink(sink: Option<CaptureSink>) -> bool {
    match sink {
        Some(sink) => sink.close().await.persisted,
        None => false,
    }
}

async fn record_completion(
    ctx: &ExchangeContext,
    client: &ClientAddress,
    status: StatusCode,
    url: &str,
    capture: Option<&CaptureTarget>,
    persisted: bool,
) {
    match ctx
        .logger
        .record(client, status.as_u16(), url, capture, persisted)
        .await
    {
        Ok(entry) => info!(status = entry.status, size = %entry.size, "exchange completed"),
        Err(e) => error!(error = %e, "failed to write access log"),
    }
}

fn channel_body(rx: mpsc::Receiver<ClientFrame>) -> ProxyBody {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    });
    StreamBody::new(stream).boxed_unsync()
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use http_body_util::Full;
    use tempfile::TempDir;

    use crate::transport::{UpstreamResponse, UpstreamTransport};

    type Seen = Arc<Mutex<Vec<(Method, Uri, HeaderMap, Bytes)>>>;

    /// Answers every request with a prepared response and remembers what it saw.
    struct MockTransport {
        response: Mutex<Option<Result<Response<ProxyBody>>>>,
        seen: Seen,
    }

    impl MockTransport {
        fn new(response: Result<Response<ProxyBody>>) -> (Self, Seen) {
            let seen = Seen::default();
            let transport = Self {
                response: Mutex::new(Some(response)),
                seen: seen.clone(),
            };
            (transport, seen)
        }
    }

    #[async_trait]
    impl UpstreamTransport for MockTransport {
        async fn dispatch(
            &self,
            _target: &TargetUrl,
            request: Request<ProxyBody>,
        ) -> Result<UpstreamResponse> {
            let (parts, body) = request.into_parts();
            let body = body.collect().await.map_err(ProxyError::Upstream)?.to_bytes();
            self.seen
                .lock()
                .unwrap()
                .push((parts.method, parts.uri, parts.headers, body));

            let response = self.response.lock().unwrap().take().expect("one request per mock")?;
            Ok(UpstreamResponse {
                response,
                connection: None,
            })
        }
    }

    fn full(bytes: &'static str) -> ProxyBody {
        Full::new(Bytes::from_static(bytes.as_bytes()))
            .map_err(|never| match never {})
            .boxed_unsync()
    }

    fn streamed(rx: mpsc::Receiver<ClientFrame>) -> ProxyBody {
        channel_body(rx)
    }

    fn context(root: &std::path::Path, transport: MockTransport) -> Arc<ExchangeContext> {
        let mapper = PathMapper::new(root).unwrap();
        let transports = Transports::with(transport, crate::transport::PlainTransport::default());
        Arc::new(ExchangeContext::new(mapper, transports, Duration::from_secs(5)))
    }

    fn client(ip: &str) -> ClientAddress {
        ClientAddress::from_ip(ip.parse().unwrap())
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(uri)
            .header("Host", "example.test")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn wait_for_log(ctx: &ExchangeContext, client: &ClientAddress) -> String {
        let path = ctx.logger().log_path(client);
        for _ in 0..100 {
            if let Ok(log) = std::fs::read_to_string(&path) {
                if !log.is_empty() {
                    return log;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no access log at {}", path.display());
    }

    fn captured_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    // ==================== State Tests ====================

    #[test]
    fn test_terminal_states() {
        assert!(ExchangeState::Completed.is_terminal());
        assert!(ExchangeState::Aborted.is_terminal());
        assert!(!ExchangeState::Received.is_terminal());
        assert!(!ExchangeState::Dispatched.is_terminal());
        assert!(!ExchangeState::RelayingResponse.is_terminal());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ExchangeState::RelayingResponse.to_string(), "relaying_response");
    }

    #[test]
    fn test_proxy_request_parse() {
        let request = ProxyRequest::parse(get("http://example.test/a?b=1"), client("10.0.0.1")).unwrap();
        assert_eq!(request.target.path(), "/a");
        assert_eq!(request.url, "http://example.test/a?b=1");
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.headers()["host"], "example.test");

        assert!(ProxyRequest::parse(get("/relative"), client("10.0.0.1")).is_err());
    }

    // ==================== Exchange Tests ====================

    #[tokio::test]
    async fn test_relays_and_captures_response() {
        let temp = TempDir::new().unwrap();
        let response = Response::builder()
            .status(200)
            .header("X-Origin", "yes")
            .body(full("hello"))
            .unwrap();
        let (transport, _) = MockTransport::new(Ok(response));
        let ctx = context(temp.path(), transport);
        let client = client("10.0.0.1");

        let exchange = Exchange::new(ctx.clone(), client.clone());
        assert_eq!(exchange.state(), ExchangeState::Received);
        let response = exchange.handle(get("http://example.test/foo.txt")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-origin"], "yes");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "hello");

        let log = wait_for_log(&ctx, &client).await;
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains(" - 200 - 5 - http://example.test/foo.txt - 10.0.0.1/http/example.test/80/foo.txt."));

        let files = captured_files(&ctx.mapper().root().join("10.0.0.1/http/example.test/80"));
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(&files[0]).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_request_forwarded_unmodified_in_origin_form() {
        let temp = TempDir::new().unwrap();
        let (transport, seen) = MockTransport::new(Ok(Response::new(full(""))));
        let ctx = context(temp.path(), transport);

        let request = Request::builder()
            .method("POST")
            .uri("http://example.test:8080/submit?x=1")
            .header("Host", "example.test:8080")
            .header("Cookie", "a=b")
            .body(Full::new(Bytes::from_static(b"payload")))
            .unwrap();
        let response = Exchange::new(ctx, client("10.0.0.1")).handle(request).await.unwrap();
        response.into_body().collect().await.unwrap();

        let seen = seen.lock().unwrap();
        let (method, uri, headers, body) = &seen[0];
        assert_eq!(method, Method::POST);
        assert_eq!(uri, "/submit?x=1");
        assert_eq!(headers["host"], "example.test:8080");
        assert_eq!(headers["cookie"], "a=b");
        assert_eq!(body, "payload");
    }

    #[tokio::test]
    async fn test_blocked_capture_still_relays() {
        let temp = TempDir::new().unwrap();
        let (transport, _) = MockTransport::new(Ok(Response::new(full("hello"))));
        let ctx = context(temp.path(), transport);
        let client = client("10.0.0.2");

        let client_dir = ctx.mapper().client_dir(&client);
        std::fs::create_dir_all(&client_dir).unwrap();
        std::fs::write(client_dir.join("http"), b"in the way").unwrap();

        let response = Exchange::new(ctx.clone(), client.clone())
            .handle(get("http://example.test/foo.txt"))
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "hello");

        let log = wait_for_log(&ctx, &client).await;
        assert!(
            log.trim_end().ends_with(" - 200 - unknown - http://example.test/foo.txt - -"),
            "{log}"
        );
        assert!(client_dir.join("http").is_file());
    }

    #[tokio::test]
    async fn test_client_disconnect_aborts_upstream() {
        let temp = TempDir::new().unwrap();
        let (origin_tx, origin_rx) = mpsc::channel(4);
        let (transport, _) = MockTransport::new(Ok(Response::new(streamed(origin_rx))));
        let ctx = context(temp.path(), transport);
        let client = client("10.0.0.3");

        origin_tx.send(Ok(Frame::data(Bytes::from_static(b"part")))).await.unwrap();
        let response = Exchange::new(ctx.clone(), client.clone())
            .handle(get("http://example.test/stream"))
            .await
            .unwrap();

        let mut body = response.into_body();
        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(first, "part");
        drop(body);

        // The relay drops the upstream body, which closes the origin side.
        tokio::time::timeout(Duration::from_secs(5), origin_tx.closed())
            .await
            .expect("upstream body was not released");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!ctx.logger().log_path(&client).exists());

        let files = captured_files(&ctx.mapper().root().join("10.0.0.3/http/example.test/80"));
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(&files[0]).unwrap(), b"part");
    }

    #[tokio::test]
    async fn test_upstream_error_truncates_and_completes() {
        let temp = TempDir::new().unwrap();
        let (origin_tx, origin_rx) = mpsc::channel(4);
        let (transport, _) = MockTransport::new(Ok(Response::new(streamed(origin_rx))));
        let ctx = context(temp.path(), transport);
        let client = client("10.0.0.4");

        origin_tx.send(Ok(Frame::data(Bytes::from_static(b"abc")))).await.unwrap();
        origin_tx.send(Err("connection reset".into())).await.unwrap();

        let response = Exchange::new(ctx.clone(), client.clone())
            .handle(get("http://example.test/broken"))
            .await
            .unwrap();
        assert!(response.into_body().collect().await.is_err());

        let log = wait_for_log(&ctx, &client).await;
        assert!(log.contains(" - 200 - 3 - http://example.test/broken - "));
    }

    #[tokio::test]
    async fn test_no_content_completes_without_relay() {
        let temp = TempDir::new().unwrap();
        let response = Response::builder().status(204).body(empty_body()).unwrap();
        let (transport, _) = MockTransport::new(Ok(response));
        let ctx = context(temp.path(), transport);
        let client = client("10.0.0.8");

        let response = Exchange::new(ctx.clone(), client.clone())
            .handle(get("http://example.test/ping"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Logged before the response is handed back; the body is never polled.
        let log = std::fs::read_to_string(ctx.logger().log_path(&client)).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains(" - 204 - 0 - http://example.test/ping - 10.0.0.8/http/example.test/80/ping."));
        drop(response);

        let files = captured_files(&ctx.mapper().root().join("10.0.0.8/http/example.test/80"));
        assert_eq!(files.len(), 1);
        assert!(std::fs::read(&files[0]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_head_request_completes_without_relay() {
        let temp = TempDir::new().unwrap();
        let response = Response::builder()
            .status(200)
            .header("Content-Length", "5")
            .body(full("hello"))
            .unwrap();
        let (transport, seen) = MockTransport::new(Ok(response));
        let ctx = context(temp.path(), transport);
        let client = client("10.0.0.9");

        let request = Request::builder()
            .method(Method::HEAD)
            .uri("http://example.test/foo.txt")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = Exchange::new(ctx.clone(), client.clone())
            .handle(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-length"], "5");
        assert!(response.body().is_end_stream());
        assert_eq!(seen.lock().unwrap()[0].0, Method::HEAD);

        let log = std::fs::read_to_string(ctx.logger().log_path(&client)).unwrap();
        assert!(log.contains(" - 200 - 0 - http://example.test/foo.txt - "));
    }

    #[tokio::test]
    async fn test_dropped_client_after_last_chunk_still_completes() {
        let temp = TempDir::new().unwrap();
        let (transport, _) = MockTransport::new(Ok(Response::new(full("done"))));
        let ctx = context(temp.path(), transport);
        let client = client("10.0.0.10");

        let response = Exchange::new(ctx.clone(), client.clone())
            .handle(get("http://example.test/last"))
            .await
            .unwrap();
        let mut body = response.into_body();
        let chunk = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(chunk, "done");
        drop(body);

        let log = wait_for_log(&ctx, &client).await;
        assert!(log.contains(" - 200 - 4 - http://example.test/last - "));
    }

    #[tokio::test]
    async fn test_dispatch_failure_returns_error_without_log() {
        let temp = TempDir::new().unwrap();
        let (transport, _) = MockTransport::new(Err(ProxyError::Timeout("connect")));
        let ctx = context(temp.path(), transport);
        let client = client("10.0.0.5");

        let result = Exchange::new(ctx.clone(), client.clone())
            .handle(get("http://example.test/"))
            .await;
        assert!(matches!(result, Err(ProxyError::Timeout("connect"))));
        assert!(!ctx.mapper().client_dir(&client).exists());
    }

    #[tokio::test]
    async fn test_connect_is_not_implemented() {
        let temp = TempDir::new().unwrap();
        let (transport, seen) = MockTransport::new(Ok(Response::new(full(""))));
        let ctx = context(temp.path(), transport);

        let request = Request::builder()
            .method(Method::CONNECT)
            .uri("example.test:443")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = Exchange::new(ctx, client("10.0.0.6")).handle(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_origin_form_target_is_bad_request() {
        let temp = TempDir::new().unwrap();
        let (transport, _) = MockTransport::new(Ok(Response::new(full(""))));
        let ctx = context(temp.path(), transport);

        let response = Exchange::new(ctx, client("10.0.0.7"))
            .handle(get("/not-a-proxy-request"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_clients_are_isolated() {
        let temp = TempDir::new().unwrap();
        let mut handles = Vec::new();
        let mut contexts = Vec::new();

        for (ip, body) in [("10.0.1.1", "first"), ("10.0.1.2", "second")] {
            let (transport, _) = MockTransport::new(Ok(Response::new(full(body))));
            let ctx = context(temp.path(), transport);
            contexts.push((ctx.clone(), client(ip), body));
            handles.push(tokio::spawn(async move {
                let response = Exchange::new(ctx, client(ip))
                    .handle(get("http://example.test/same.txt"))
                    .await
                    .unwrap();
                response.into_body().collect().await.unwrap().to_bytes()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for (ctx, client, body) in contexts {
            wait_for_log(&ctx, &client).await;
            let dir = ctx
                .mapper()
                .client_dir(&client)
                .join("http/example.test/80");
            let files = captured_files(&dir);
            assert_eq!(files.len(), 1);
            assert_eq!(std::fs::read(&files[0]).unwrap(), body.as_bytes());
        }
    }
}
