//! The boundary to the transport layer.
//!
//! The engine does no socket, TLS or wire-level work itself. It drives any
//! [`Transport`] through connect, send request and shutdown, and consumes the
//! events the transport produces for each exchange.

use crate::config::EngineConfig;
use crate::headers::{HeaderList, RequestHeaders, ResponseHeaders, ResponseTrailers, Scheme};
use crate::Error;
use crate::StreamError;
use futures_channel::mpsc;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use http::uri::Authority;
use std::fmt;

/// Where a connection goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    #[allow(missing_docs)]
    pub scheme: Scheme,
    /// Host and optional port.
    pub authority: Authority,
}

impl Target {
    /// Target from its parts. See also [`RequestHeaders::target`].
    ///
    /// [`RequestHeaders::target`]: ../struct.RequestHeaders.html#method.target
    pub fn new(scheme: Scheme, authority: Authority) -> Self {
        Target { scheme, authority }
    }

    /// Port, explicit or scheme default.
    pub fn port(&self) -> u16 {
        self.authority
            .port_u16()
            .unwrap_or_else(|| self.scheme.default_port())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

/// Opaque handle of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    /// Handle with a transport chosen id, reported in `StreamIntel`.
    pub fn new(id: u64) -> Self {
        ConnectionHandle(id)
    }

    /// The transport chosen id.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Outgoing request body pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyFrame {
    /// Body bytes, possibly the last.
    #[allow(missing_docs)]
    Data { data: Vec<u8>, end_stream: bool },
    /// Trailers always end the request.
    Trailers(HeaderList),
}

impl BodyFrame {
    /// Whether this frame ends the request.
    pub fn is_end(&self) -> bool {
        match self {
            BodyFrame::Data { end_stream, .. } => *end_stream,
            BodyFrame::Trailers(_) => true,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            BodyFrame::Data { data, .. } => data.len(),
            BodyFrame::Trailers(_) => 0,
        }
    }
}

/// Request body as handed to the transport. Closes when the engine abandons
/// the exchange or the request ended.
pub type RequestBody = mpsc::UnboundedReceiver<BodyFrame>;

/// Response events of one exchange.
pub type EventStream = BoxStream<'static, TransportEvent>;

/// An event produced by the transport for one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum TransportEvent {
    /// Response headers. Informational (1xx) headers are skipped by the engine.
    HeadersReceived {
        headers: ResponseHeaders,
        end_stream: bool,
    },
    DataReceived {
        data: Vec<u8>,
        end_stream: bool,
    },
    /// Trailers end the response.
    TrailersReceived {
        trailers: ResponseTrailers,
    },
    /// The exchange failed. Ends the event stream.
    Failed {
        reason: StreamError,
    },
    /// The transport is done with the exchange.
    Closed,
}

/// Performs the actual network I/O on behalf of an engine.
///
/// All methods are called from the engine's worker threads except `start`,
/// which runs on the thread building the engine, and `shutdown`, which runs on
/// the thread terminating it. Dropping an [`EventStream`] means the engine has
/// abandoned the exchange (cancel, redirect, shutdown).
pub trait Transport: Send + Sync + 'static {
    /// Configure the transport. Rejecting the config fails the engine build.
    fn start(&self, config: &EngineConfig) -> Result<(), Error>;

    /// Open, or reuse, a connection to the target.
    fn connect(&self, target: &Target) -> BoxFuture<'static, Result<ConnectionHandle, StreamError>>;

    /// Issue a request on a connection.
    ///
    /// `end_stream` means there is no request body; `body` yields nothing.
    fn send_request(
        &self,
        conn: ConnectionHandle,
        headers: RequestHeaders,
        body: RequestBody,
        end_stream: bool,
    ) -> EventStream;

    /// Stop accepting new connections and streams.
    fn shutdown(&self);
}
