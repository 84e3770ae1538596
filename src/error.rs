use std::fmt;
use std::io;

/// Errors returned synchronously from engine, prototype and stream calls.
///
/// Everything that goes wrong with a running stream is instead delivered
/// asynchronously as a [`StreamError`] through the stream's error callback.
#[derive(Debug)]
pub enum Error {
    /// The engine configuration is structurally invalid. Fatal at build time.
    Configuration(String),
    /// The engine is terminated and accepts no new work.
    EngineTerminated,
    /// The stream already reached its terminal event.
    StreamClosed,
    /// A user/usage problem such as sending request headers twice.
    User(String),
    /// A wrapped std::io::Error, i.e. failure to start the engine runtime.
    Io(io::Error),
    /// Http errors from the `http` crate (invalid header names, values or URI parts).
    Http(http::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Configuration(v) => write!(f, "configuration: {}", v),
            Error::EngineTerminated => write!(f, "Engine is terminated"),
            Error::StreamClosed => write!(f, "Stream is closed"),
            Error::User(v) => write!(f, "{}", v),
            Error::Io(v) => fmt::Display::fmt(v, f),
            Error::Http(v) => write!(f, "http api: {}", v),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::Http(e)
    }
}

impl From<http::uri::InvalidUri> for Error {
    fn from(e: http::uri::InvalidUri) -> Self {
        Error::Http(e.into())
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(e: http::header::InvalidHeaderName) -> Self {
        Error::Http(e.into())
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Error::Http(e.into())
    }
}

/// Classification of a stream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// DNS, connect or TLS failure.
    Connectivity,
    /// No (complete) response within the configured deadline.
    Timeout,
    /// Malformed response or event sequence from the transport.
    Protocol,
    /// The engine was terminated while the stream was in flight.
    EngineTerminated,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::EngineTerminated => "engine terminated",
        };
        write!(f, "{}", s)
    }
}

/// A stream failure, delivered through the `on_error` callback.
///
/// Transports report their failures with the same type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    kind: ErrorKind,
    message: String,
}

impl StreamError {
    /// Failure of the given kind with a human readable reason.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        StreamError {
            kind,
            message: message.into(),
        }
    }

    /// `ErrorKind::Connectivity` failure.
    pub fn connectivity(message: impl Into<String>) -> Self {
        StreamError::new(ErrorKind::Connectivity, message)
    }

    /// `ErrorKind::Timeout` failure.
    pub fn timeout(message: impl Into<String>) -> Self {
        StreamError::new(ErrorKind::Timeout, message)
    }

    /// `ErrorKind::Protocol` failure.
    pub fn protocol(message: impl Into<String>) -> Self {
        StreamError::new(ErrorKind::Protocol, message)
    }

    pub(crate) fn engine_terminated() -> Self {
        StreamError::new(ErrorKind::EngineTerminated, "Engine terminated")
    }

    /// Classification of the failure.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The reason, as given by the engine or transport.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StreamError {}
