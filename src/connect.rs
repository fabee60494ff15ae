//! Connection setup and keep-alive pooling for [`HyperTransport`].
//!
//! Dialing is done here rather than through a connector service so that
//! every phase (resolution, TCP dial, TLS handshake) can be reported to the
//! request's [`ClientTrace`]. Established connections are handed to hyper's
//! HTTP/1 client and kept in a [`Pool`] between requests.
//!
//! [`HyperTransport`]: crate::HyperTransport

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use ahash::AHashMap;
use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::client::conn::TrySendError;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::error::TransportError;
use crate::trace::ClientTrace;

/// Where a request is dialed to. Connections are pooled per target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Target {
    pub(crate) tls: bool,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) authority: String,
}

impl Target {
    pub(crate) fn from_uri(uri: &Uri) -> Result<Self, TransportError> {
        let tls = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            Some(other) => return Err(TransportError::UnsupportedScheme(other.to_string())),
            None => return Err(TransportError::InvalidUri(uri.to_string())),
        };

        let authority = uri
            .authority()
            .ok_or_else(|| TransportError::InvalidUri(uri.to_string()))?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if host.is_empty() {
            return Err(TransportError::InvalidUri(uri.to_string()));
        }

        Ok(Self {
            tls,
            host,
            port: authority.port_u16().unwrap_or(if tls { 443 } else { 80 }),
            authority: authority.as_str().to_string(),
        })
    }
}

/// Progress of the exchange currently running on a connection, as seen
/// from its socket.
#[derive(Debug, Default)]
struct Exchange {
    trace: Option<ClientTrace>,
    written: bool,
    sent: bool,
    answered: bool,
}

impl Exchange {
    fn begin(&mut self, trace: Option<ClientTrace>) {
        *self = Exchange {
            trace,
            ..Exchange::default()
        };
    }

    fn end(&mut self) {
        self.trace = None;
    }

    fn flushed(&mut self) {
        if !self.written || self.sent {
            return;
        }
        self.sent = true;
        if let Some(trace) = &self.trace {
            trace.wrote_request();
        }
    }

    fn read(&mut self) {
        if self.answered || self.trace.is_none() {
            return;
        }
        // Some writers never flush explicitly; the answer implies the send.
        self.flushed();
        self.answered = true;
        if let Some(trace) = &self.trace {
            trace.got_first_response_byte();
        }
    }
}

/// Socket wrapper reporting the first flush after a write and the first
/// byte read back to the running exchange.
struct TracedIo<T> {
    inner: T,
    exchange: Arc<Mutex<Exchange>>,
}

impl<T: AsyncRead + Unpin> AsyncRead for TracedIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(polled, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.exchange.lock().read();
        }
        polled
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TracedIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(polled, Poll::Ready(Ok(n)) if n > 0) {
            this.exchange.lock().written = true;
        }
        polled
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if matches!(polled, Poll::Ready(Ok(n)) if n > 0) {
            this.exchange.lock().written = true;
        }
        polled
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_flush(cx);
        if matches!(polled, Poll::Ready(Ok(()))) {
            this.exchange.lock().flushed();
        }
        polled
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A plain or TLS-wrapped TCP stream.
enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Stream::Tls(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Stream::Plain(s) => s.is_write_vectored(),
            Stream::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// An HTTP/1 connection driven by a background task.
pub(crate) struct Connection {
    sender: SendRequest<Full<Bytes>>,
    exchange: Arc<Mutex<Exchange>>,
    reused: bool,
}

impl Connection {
    /// Whether the connection came out of the pool.
    pub(crate) fn is_reused(&self) -> bool {
        self.reused
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Waits until the connection can take a request.
    pub(crate) async fn ready(&mut self) -> Result<(), hyper::Error> {
        self.sender.ready().await
    }

    /// Sends `request`, reporting write and first-byte events to `trace`.
    ///
    /// If the connection closed before anything was written, the request
    /// is handed back inside the error.
    pub(crate) async fn send(
        &mut self,
        request: Request<Full<Bytes>>,
        trace: Option<ClientTrace>,
    ) -> Result<Response<Incoming>, TrySendError<Request<Full<Bytes>>>> {
        self.exchange.lock().begin(trace);
        let sent = self.sender.try_send_request(request).await;
        if sent.is_err() {
            self.finish();
        }
        sent
    }

    /// Detaches the current request's trace.
    pub(crate) fn finish(&self) {
        self.exchange.lock().end();
    }
}

/// Idle keep-alive connections, grouped by target.
pub(crate) struct Pool {
    idle: Mutex<AHashMap<Target, Vec<Connection>>>,
    max_idle_per_host: usize,
}

impl Pool {
    pub(crate) fn new(max_idle_per_host: usize) -> Self {
        Self {
            idle: Mutex::new(AHashMap::new()),
            max_idle_per_host,
        }
    }

    /// Takes the most recently used open connection to `target`.
    pub(crate) fn checkout(&self, target: &Target) -> Option<Connection> {
        let mut idle = self.idle.lock();
        let conns = idle.get_mut(target)?;

        let mut found = None;
        while let Some(mut conn) = conns.pop() {
            if !conn.is_closed() {
                conn.reused = true;
                found = Some(conn);
                break;
            }
        }
        if conns.is_empty() {
            idle.remove(target);
        }
        found
    }

    /// Returns a connection whose exchange completed.
    pub(crate) fn checkin(&self, target: Target, conn: Connection) {
        if conn.is_closed() || self.max_idle_per_host == 0 {
            return;
        }

        let mut idle = self.idle.lock();
        let conns = idle.entry(target).or_default();
        conns.retain(|c| !c.is_closed());
        if conns.len() < self.max_idle_per_host {
            conns.push(conn);
        }
    }

    /// Number of idle connections across all targets.
    pub(crate) fn idle_count(&self) -> usize {
        self.idle.lock().values().map(Vec::len).sum()
    }
}

/// Resolves, dials and (for `https`) secures a new connection, then starts
/// hyper's HTTP/1 connection task on the current runtime.
pub(crate) async fn connect(
    target: &Target,
    tls: Option<&TlsConnector>,
    trace: Option<&ClientTrace>,
) -> Result<Connection, TransportError> {
    let addrs = resolve(target, trace).await?;
    let tcp = dial(&addrs, trace).await?;

    let stream = if target.tls {
        let tls = tls.ok_or_else(|| TransportError::UnsupportedScheme("https".to_string()))?;
        Stream::Tls(Box::new(handshake(tls, target, tcp, trace).await?))
    } else {
        Stream::Plain(tcp)
    };

    let exchange = Arc::new(Mutex::new(Exchange::default()));
    let io = TokioIo::new(TracedIo {
        inner: stream,
        exchange: Arc::clone(&exchange),
    });
    let (sender, connection) = http1::handshake(io).await?;

    let authority = target.authority.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(%authority, error = %e, "Connection closed with error");
        }
    });
    tracing::debug!(authority = %target.authority, tls = target.tls, "Opened connection");

    Ok(Connection {
        sender,
        exchange,
        reused: false,
    })
}

async fn resolve(
    target: &Target,
    trace: Option<&ClientTrace>,
) -> Result<Vec<SocketAddr>, TransportError> {
    if let Ok(ip) = target.host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, target.port)]);
    }

    if let Some(t) = trace {
        t.dns_start();
    }
    let resolved = tokio::net::lookup_host((target.host.as_str(), target.port)).await;
    if let Some(t) = trace {
        t.dns_done();
    }

    let addrs: Vec<SocketAddr> = resolved?.collect();
    if addrs.is_empty() {
        return Err(TransportError::InvalidUri(format!(
            "no addresses for {}",
            target.host
        )));
    }

    Ok(addrs)
}

async fn dial(
    addrs: &[SocketAddr],
    trace: Option<&ClientTrace>,
) -> Result<TcpStream, TransportError> {
    let mut last_err = None;

    for addr in addrs {
        if let Some(t) = trace {
            t.connect_start();
        }
        let attempt = TcpStream::connect(*addr).await;
        if let Some(t) = trace {
            t.connect_done();
        }

        match attempt {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.map(TransportError::from).unwrap_or_else(|| {
        TransportError::InvalidUri("no address to connect to".to_string())
    }))
}

async fn handshake(
    tls: &TlsConnector,
    target: &Target,
    tcp: TcpStream,
    trace: Option<&ClientTrace>,
) -> Result<TlsStream<TcpStream>, TransportError> {
    let name = ServerName::try_from(target.host.as_str())
        .map_err(|e| TransportError::InvalidUri(format!("{}: {}", target.host, e)))?
        .to_owned();

    if let Some(t) = trace {
        t.tls_handshake_start();
    }
    let secured = tls.connect(name, tcp).await;
    if let Some(t) = trace {
        t.tls_handshake_done();
    }

    Ok(secured?)
}
