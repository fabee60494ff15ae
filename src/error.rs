//! Error types for the timed HTTP client.

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::io;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, Error>;

/// Error returned by [`TimedClient`](crate::TimedClient) operations.
#[derive(Debug)]
pub enum Error {
    /// The maximum number of consecutive errors has been reached and no
    /// request was performed.
    OutOfService,

    /// The underlying transport failed. The value is the transport's error
    /// exactly as it was produced.
    Transport(TransportError),

    /// A convenience helper could not build the request.
    Request(http::Error),
}

/// Errors produced by a [`Transport`](crate::Transport).
#[derive(Debug)]
pub enum TransportError {
    /// I/O failure while resolving, connecting, writing or reading.
    Io(io::Error),

    /// The connect, write or read deadline expired.
    Timeout,

    /// The transport does not speak the request's scheme.
    UnsupportedScheme(String),

    /// The request URI cannot be dialed.
    InvalidUri(String),

    /// The peer sent something that is not valid HTTP/1.x, or a body over
    /// the configured limit.
    Protocol(String),

    /// Any other failure, for transports outside this crate.
    Other(Box<dyn StdError + Send + Sync>),
}

impl Error {
    /// Returns true if this is the fail-fast error of an open breaker.
    pub fn is_out_of_service(&self) -> bool {
        matches!(self, Error::OutOfService)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfService => write!(f, "HTTP client out of service"),
            Error::Transport(e) => write!(f, "Transport error: {}", e),
            Error::Request(e) => write!(f, "Invalid request: {}", e),
        }
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "I/O error: {}", e),
            TransportError::Timeout => write!(f, "Request timed out"),
            TransportError::UnsupportedScheme(s) => write!(f, "Unsupported scheme: {}", s),
            TransportError::InvalidUri(u) => write!(f, "Invalid URI: {}", u),
            TransportError::Protocol(msg) => write!(f, "Malformed response: {}", msg),
            TransportError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::OutOfService => None,
            Error::Transport(e) => Some(e),
            Error::Request(e) => Some(e),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Other(e) => Some(e.as_ref() as &(dyn StdError + 'static)),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::Request(e)
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
            _ => TransportError::Io(e),
        }
    }
}

impl From<hyper::Error> for TransportError {
    fn from(e: hyper::Error) -> Self {
        if e.is_timeout() {
            return TransportError::Timeout;
        }
        if e.is_parse() || e.is_parse_status() || e.is_incomplete_message() {
            return TransportError::Protocol(describe(&e));
        }

        match io_cause(&e).map(io::Error::kind) {
            Some(io::ErrorKind::TimedOut) => TransportError::Timeout,
            // Framing errors in the body surface as I/O errors.
            Some(
                io::ErrorKind::InvalidData
                | io::ErrorKind::InvalidInput
                | io::ErrorKind::UnexpectedEof,
            ) => TransportError::Protocol(describe(&e)),
            _ => TransportError::Other(Box::new(e)),
        }
    }
}

fn describe(e: &hyper::Error) -> String {
    match e.source() {
        Some(cause) => format!("{}: {}", e, cause),
        None => e.to_string(),
    }
}

fn io_cause(e: &hyper::Error) -> Option<&io::Error> {
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            return Some(io);
        }
        source = err.source();
    }
    None
}
