//! The transport contract and the default hyper-based transport.
//!
//! A transport performs the actual network exchange. It receives the request
//! with a [`ClientTrace`] in its extensions and is expected to fire the
//! trace's events at the matching milestones, start events before their end
//! events, each end event at most once.

use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::{Request, Response, Uri};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use once_cell::sync::OnceCell;
use tokio::runtime::Runtime;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::connect::{self, Connection, Pool, Target};
use crate::error::TransportError;
use crate::trace::ClientTrace;

/// Body type of requests and responses.
pub type Body = Vec<u8>;

/// Performs one HTTP exchange.
pub trait Transport: Send + Sync + 'static {
    /// Sends `request` and returns the complete response.
    fn send(&self, request: Request<Body>) -> Result<Response<Body>, TransportError>;
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;
const DEFAULT_MAX_IDLE_PER_HOST: usize = 2;

/// HTTP/1.1 transport on hyper with keep-alive pooling and TLS.
///
/// `send` blocks the calling thread while the exchange runs on a small
/// Tokio runtime owned by the transport, started on first use. Idle
/// connections are reused, in which case the request goes through no
/// resolution, dial or handshake. `https` uses rustls with the Mozilla
/// root store unless [`with_tls_config`](Self::with_tls_config) says
/// otherwise.
pub struct HyperTransport {
    timeout: Duration,
    max_body_size: usize,
    tls_config: Option<Arc<ClientConfig>>,
    tls: OnceCell<TlsConnector>,
    runtime: OnceCell<Runtime>,
    pool: Arc<Pool>,
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HyperTransport {
    /// Creates a transport with a 30 second timeout, a 16 MiB response
    /// body limit and up to two idle connections per host.
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            tls_config: None,
            tls: OnceCell::new(),
            runtime: OnceCell::new(),
            pool: Arc::new(Pool::new(DEFAULT_MAX_IDLE_PER_HOST)),
        }
    }

    /// Sets the deadline for a whole exchange, from acquiring the
    /// connection to the end of the response body.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the largest response body accepted. Longer bodies fail with
    /// [`TransportError::Protocol`].
    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    /// Sets how many idle connections are kept per host. Zero disables
    /// reuse.
    pub fn with_max_idle_per_host(mut self, max: usize) -> Self {
        self.pool = Arc::new(Pool::new(max));
        self
    }

    /// Uses `config` for `https` instead of the built-in root store.
    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self.tls = OnceCell::new();
        self
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Configured response body limit.
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    fn runtime(&self) -> Result<&Runtime, TransportError> {
        self.runtime
            .get_or_try_init(|| {
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("thc-transport")
                    .enable_all()
                    .build()
            })
            .map_err(TransportError::Io)
    }

    fn tls_connector(&self) -> Result<TlsConnector, TransportError> {
        self.tls
            .get_or_try_init(|| {
                let config = match &self.tls_config {
                    Some(config) => Arc::clone(config),
                    None => default_tls_config()?,
                };
                Ok(TlsConnector::from(config))
            })
            .cloned()
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: Request<Body>) -> Result<Response<Body>, TransportError> {
        let target = Target::from_uri(request.uri())?;
        let tls = if target.tls {
            Some(self.tls_connector()?)
        } else {
            None
        };

        let trip = RoundTrip {
            pool: Arc::clone(&self.pool),
            target,
            tls,
            max_body_size: self.max_body_size,
        };
        let timeout = self.timeout;
        let (tx, rx) = mpsc::sync_channel(1);

        self.runtime()?.spawn(async move {
            let result = match tokio::time::timeout(timeout, trip.run(request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            let _ = tx.send(result);
        });

        rx.recv()
            .map_err(|_| TransportError::Other("transport runtime stopped".into()))?
    }
}

impl Drop for HyperTransport {
    fn drop(&mut self) {
        // May run inside an async context, where blocking is not allowed.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperTransport")
            .field("timeout", &self.timeout)
            .field("max_body_size", &self.max_body_size)
            .field("custom_tls", &self.tls_config.is_some())
            .field("idle_connections", &self.pool.idle_count())
            .finish()
    }
}

/// One request's trip through the pool and over the wire.
struct RoundTrip {
    pool: Arc<Pool>,
    target: Target,
    tls: Option<TlsConnector>,
    max_body_size: usize,
}

impl RoundTrip {
    async fn run(self, request: Request<Body>) -> Result<Response<Body>, TransportError> {
        let trace = ClientTrace::from_request(&request).cloned();
        let mut request = into_origin_form(request, &self.target)?;

        if let Some(t) = &trace {
            t.get_conn();
        }

        let (conn, response) = loop {
            let mut conn = self.acquire(trace.as_ref()).await?;
            if let Some(t) = &trace {
                t.got_conn();
            }

            match conn.send(request, trace.clone()).await {
                Ok(response) => break (conn, response),
                Err(mut e) => match e.take_message() {
                    // A pooled connection closed under us before the
                    // request went out; another one may still work.
                    Some(unsent) if conn.is_reused() => {
                        tracing::debug!(
                            authority = %self.target.authority,
                            error = %e.error(),
                            "Pooled connection closed, retrying on another"
                        );
                        request = unsent;
                    }
                    _ => return Err(e.into_error().into()),
                },
            }
        };

        let (parts, body) = response.into_parts();
        let body = read_body(body, self.max_body_size).await;
        conn.finish();
        let body = body?;

        self.pool.checkin(self.target, conn);
        Ok(Response::from_parts(parts, body))
    }

    async fn acquire(&self, trace: Option<&ClientTrace>) -> Result<Connection, TransportError> {
        while let Some(mut conn) = self.pool.checkout(&self.target) {
            if conn.ready().await.is_ok() {
                return Ok(conn);
            }
        }

        let mut conn = connect::connect(&self.target, self.tls.as_ref(), trace).await?;
        conn.ready().await?;
        Ok(conn)
    }
}

/// Rewrites the URI to the `/path?query` form sent on the request line and
/// fills in `Host`.
fn into_origin_form(
    request: Request<Body>,
    target: &Target,
) -> Result<Request<Full<Bytes>>, TransportError> {
    let (mut parts, body) = request.into_parts();

    if !parts.headers.contains_key(HOST) {
        let host = HeaderValue::from_str(&target.authority)
            .map_err(|e| TransportError::InvalidUri(e.to_string()))?;
        parts.headers.insert(HOST, host);
    }

    let origin: Uri = parts
        .uri
        .path_and_query()
        .map_or("/", |p| p.as_str())
        .parse()
        .map_err(|e: http::uri::InvalidUri| TransportError::InvalidUri(e.to_string()))?;
    parts.uri = origin;

    Ok(Request::from_parts(parts, Full::new(Bytes::from(body))))
}

async fn read_body(body: Incoming, limit: usize) -> Result<Body, TransportError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes().to_vec()),
        Err(e) if e.is::<LengthLimitError>() => Err(TransportError::Protocol(format!(
            "response body exceeds {} bytes",
            limit
        ))),
        Err(e) => match e.downcast::<hyper::Error>() {
            Ok(e) => Err((*e).into()),
            Err(e) => Err(TransportError::Other(e)),
        },
    }
}

fn default_tls_config() -> Result<Arc<ClientConfig>, TransportError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Other(Box::new(e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// Accepts connections and answers each request read from them with
    /// `raw`. With `keep_alive` a connection serves requests until the peer
    /// closes it.
    fn serve(raw: &'static [u8], keep_alive: bool) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);

        thread::spawn(move || {
            for mut stream in listener.incoming().flatten() {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                        if stream.write_all(raw).is_err() || !keep_alive {
                            return;
                        }
                    }
                });
            }
        });

        (addr, accepted)
    }

    fn get(addr: SocketAddr) -> Request<Body> {
        Request::get(format!("http://{}/", addr))
            .body(Vec::new())
            .unwrap()
    }

    #[test]
    fn origin_form_and_host() {
        let request = Request::post("http://localhost:1234/submit?x=1")
            .header("content-type", "text/plain")
            .body(b"hello".to_vec())
            .unwrap();
        let target = Target::from_uri(request.uri()).unwrap();
        let request = into_origin_form(request, &target).unwrap();

        assert_eq!(request.uri(), "/submit?x=1");
        assert_eq!(request.headers()[HOST], "localhost:1234");
        assert_eq!(request.headers()["content-type"], "text/plain");
    }

    #[test]
    fn explicit_host_is_kept() {
        let request = Request::get("http://127.0.0.1:1234")
            .header(HOST, "example.com")
            .body(Vec::new())
            .unwrap();
        let target = Target::from_uri(request.uri()).unwrap();
        let request = into_origin_form(request, &target).unwrap();

        assert_eq!(request.uri(), "/");
        assert_eq!(request.headers()[HOST], "example.com");
    }

    #[test]
    fn reads_chunked_response() {
        let (addr, _) = serve(
            b"HTTP/1.1 500 Internal Server Error\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n4\r\nFAIL\r\n1;ext=1\r\n!\r\n0\r\n\r\n",
            false,
        );
        let response = HyperTransport::new().send(get(addr)).unwrap();

        assert_eq!(response.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.body(), b"FAIL!");
    }

    #[test]
    fn huge_content_length_is_a_protocol_error() {
        let (addr, _) = serve(
            b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\nOK",
            false,
        );
        let result = HyperTransport::new().send(get(addr));
        assert!(matches!(result, Err(TransportError::Protocol(_))), "{:?}", result);
    }

    #[test]
    fn huge_chunk_size_is_a_protocol_error() {
        let (addr, _) = serve(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n1\r\nA\r\nffffffffffffffff\r\nB\r\n0\r\n\r\n",
            false,
        );
        let result = HyperTransport::new().send(get(addr));
        assert!(matches!(result, Err(TransportError::Protocol(_))), "{:?}", result);
    }

    #[test]
    fn body_over_limit_is_a_protocol_error() {
        let (addr, _) = serve(
            b"HTTP/1.1 200 OK\r\nContent-Length: 32\r\n\r\n0123456789abcdef0123456789abcdef",
            false,
        );
        let transport = HyperTransport::new().with_max_body_size(16);
        let result = transport.send(get(addr));
        assert!(matches!(result, Err(TransportError::Protocol(_))), "{:?}", result);
    }

    #[test]
    fn idle_connection_is_reused() {
        let (addr, accepted) = serve(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK", true);
        let transport = HyperTransport::new();
        let metrics = Arc::new(Metrics::new());

        for _ in 0..3 {
            let mut request = get(addr);
            let trace = ClientTrace::new(Arc::clone(&metrics));
            trace.attach(&mut request);
            let response = transport.send(request).unwrap();
            assert_eq!(response.body(), b"OK");
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.tcp_connection.hits(), 1);
        assert_eq!(metrics.get_connection.hits(), 3);
        assert_eq!(metrics.write_request.hits(), 3);
        assert_eq!(metrics.get_response.hits(), 3);
    }

    #[test]
    fn pooling_can_be_disabled() {
        let (addr, accepted) = serve(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK", true);
        let transport = HyperTransport::new().with_max_idle_per_host(0);

        transport.send(get(addr)).unwrap();
        transport.send(get(addr)).unwrap();

        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn slow_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let held: Vec<_> = listener.incoming().take(1).flatten().collect();
            thread::sleep(Duration::from_secs(2));
            drop(held);
        });

        let transport = HyperTransport::new().with_timeout(Duration::from_millis(100));
        assert!(matches!(transport.send(get(addr)), Err(TransportError::Timeout)));
    }
}
