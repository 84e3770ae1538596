#![warn(missing_docs, missing_debug_implementations)]
#![warn(clippy::all)]

//! An embeddable, callback driven HTTP streaming engine.
//!
//! An [`Engine`] owns a transport and the worker threads driving it. Requests
//! are made as [`Stream`]s, created from a [`StreamPrototype`] holding the
//! callbacks that receive the response events.
//!
//! ## In scope
//!
//! * Engine lifecycle: build, run, terminate while streams are in flight.
//! * Per stream event ordering: headers once, data any number of times,
//!   trailers at most once, then exactly one of complete, error or cancel.
//! * Following redirects, including scheme changes such as http to https,
//!   without the callbacks seeing the intermediate responses.
//! * Timeouts, cancellation and transport failures delivered as stream errors.
//!
//! ## Out of scope
//!
//! Everything about the wire. Connecting, TLS, DNS and HTTP/1.1, 2 or 3
//! framing belong to the [`Transport`], which the engine configures and
//! delegates to. [`mem::MemTransport`] is an in-process transport answering
//! from scripts.
//!
//! # Threads
//!
//! None of the calls block on network I/O. Callbacks run on the engine's
//! worker threads, never concurrently for the same stream. Callbacks of
//! different streams may run concurrently.
//!
//! # Example
//!
//! ```no_run
//! use hreq_engine::mem::{MemTransport, Script};
//! use hreq_engine::{Engine, RequestHeadersBuilder, Scheme};
//! use http::Method;
//!
//! # fn main() -> Result<(), hreq_engine::Error> {
//! let transport = MemTransport::new()
//!     .route(Scheme::Https, "api.example.com", |_| Script::ok("pong"));
//!
//! let engine = Engine::builder(transport).build()?;
//!
//! let headers =
//!     RequestHeadersBuilder::new(Method::GET, Scheme::Https, "api.example.com", "/ping")
//!         .build()?;
//!
//! engine
//!     .stream_client()
//!     .new_stream_prototype()
//!     .set_on_response_headers(|headers, _, _| println!("status: {}", headers.http_status()))
//!     .set_on_error(|err, _| eprintln!("failed: {}", err))
//!     .start()?
//!     .send_headers(headers, true)?;
//!
//! engine.terminate();
//! # Ok(())
//! # }
//! ```
//!
//! [`Engine`]: struct.Engine.html
//! [`Stream`]: struct.Stream.html
//! [`StreamPrototype`]: struct.StreamPrototype.html
//! [`Transport`]: transport/trait.Transport.html
//! [`mem::MemTransport`]: mem/struct.MemTransport.html

#[macro_use]
extern crate log;

/// `log!` that also honors an engine's own level, leaving the global
/// `log` filter to the host application.
macro_rules! elog {
    ($filter:expr, $lvl:ident, $($arg:tt)+) => {
        if log::Level::$lvl <= $filter {
            log!(log::Level::$lvl, $($arg)+);
        }
    };
}

mod dispatch;
mod engine;
mod error;
mod headers;
mod intel;
mod prototype;
mod redirect;
mod stream;

pub mod config;
pub mod mem;
pub mod transport;

pub use config::{EngineConfig, LogLevel, NativeFilter};
pub use engine::{Engine, EngineBuilder, EngineState, StreamClient};
pub use error::{Error, ErrorKind, StreamError};
pub use headers::{HeaderList, RequestHeaders, RequestHeadersBuilder, RequestTrailers};
pub use headers::{ResponseHeaders, ResponseTrailers, Scheme};
pub use intel::StreamIntel;
pub use prototype::StreamPrototype;
pub use stream::{Stream, StreamState};
