//! In-process transport.
//!
//! `MemTransport` answers requests from scripts registered per target, which
//! makes an engine usable without any network: for tests, demos and for
//! stubbing out backends.
//!
//! ```no_run
//! use hreq_engine::mem::{MemTransport, Script};
//! use hreq_engine::{Engine, Scheme};
//! use http::StatusCode;
//!
//! let transport = MemTransport::new()
//!     .route(Scheme::Http, "api.example.com", |_| {
//!         Script::redirect(StatusCode::MOVED_PERMANENTLY, "https://api.example.com/ping")
//!     })
//!     .route(Scheme::Https, "api.example.com", |_| Script::ok("pong"));
//!
//! let engine = Engine::builder(transport).build().unwrap();
//! ```

use crate::config::{EngineConfig, NativeFilter};
use crate::headers::{HeaderList, RequestHeaders, ResponseHeaders, Scheme};
use crate::transport::{
    BodyFrame, ConnectionHandle, EventStream, RequestBody, Target, Transport, TransportEvent,
};
use crate::{Error, StreamError};
use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt};
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A request as seen by a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRequest {
    /// Headers as sent by the engine.
    pub headers: RequestHeaders,
    /// Whole request body.
    pub body: Vec<u8>,
    /// Request trailers, if any were sent.
    pub trailers: Option<HeaderList>,
}

/// One step of a scripted response.
#[derive(Debug, Clone)]
pub enum Step {
    /// Emit the event.
    Event(TransportEvent),
    /// Wait before the next step.
    Delay(Duration),
    /// Never produce anything more.
    Hang,
}

/// Scripted response to one request.
#[derive(Debug, Clone, Default)]
pub struct Script {
    steps: Vec<Step>,
}

impl Script {
    /// Empty script. The event stream ends without any response.
    pub fn new() -> Self {
        Script::default()
    }

    /// 200 with a body. An empty body ends the stream with the headers.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        let headers = ResponseHeaders::new(StatusCode::OK);

        if body.is_empty() {
            Script::new().headers(headers, true)
        } else {
            Script::new().headers(headers, false).data(body, true)
        }
    }

    /// A header-only redirect response.
    pub fn redirect(status: StatusCode, location: &'static str) -> Self {
        let mut headers = HeaderList::new();
        headers.append(
            HeaderName::from_static("location"),
            HeaderValue::from_static(location),
        );

        Script::new().headers(ResponseHeaders::with_headers(status, headers), true)
    }

    /// Response headers event.
    pub fn headers(self, headers: ResponseHeaders, end_stream: bool) -> Self {
        self.event(TransportEvent::HeadersReceived {
            headers,
            end_stream,
        })
    }

    /// Response body event.
    pub fn data(self, data: impl Into<Vec<u8>>, end_stream: bool) -> Self {
        self.event(TransportEvent::DataReceived {
            data: data.into(),
            end_stream,
        })
    }

    /// Response trailers event. Always ends the response.
    pub fn trailers(self, trailers: HeaderList) -> Self {
        self.event(TransportEvent::TrailersReceived { trailers })
    }

    /// Transport failure.
    pub fn fail(self, reason: StreamError) -> Self {
        self.event(TransportEvent::Failed { reason })
    }

    /// Connection closed.
    pub fn close(self) -> Self {
        self.event(TransportEvent::Closed)
    }

    /// Any event, valid or not.
    pub fn event(mut self, ev: TransportEvent) -> Self {
        self.steps.push(Step::Event(ev));
        self
    }

    /// Pause the script.
    pub fn delay(mut self, d: Duration) -> Self {
        self.steps.push(Step::Delay(d));
        self
    }

    /// Stop without ending the event stream.
    pub fn hang(mut self) -> Self {
        self.steps.push(Step::Hang);
        self
    }
}

type RouteFn = Arc<dyn Fn(&MemRequest) -> Script + Send + Sync>;

#[derive(Clone)]
struct Route {
    f: RouteFn,
    /// Answer without reading the request body.
    early: bool,
}

/// In-process transport answering requests from per-target scripts.
///
/// Cheap to clone, clones share routes and recorded requests.
#[derive(Clone, Default)]
pub struct MemTransport {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    routes: Mutex<HashMap<(Scheme, String), Route>>,
    requests: Mutex<Vec<MemRequest>>,
    filters: Mutex<Option<Vec<NativeFilter>>>,
    next_conn: AtomicU64,
    shut_down: AtomicBool,
}

impl MemTransport {
    /// Transport without routes. Unrouted targets fail to connect.
    pub fn new() -> Self {
        MemTransport::default()
    }

    /// Answer requests to `scheme://authority` with the script from `f`.
    ///
    /// The script is made once the whole request body is read.
    pub fn route<F>(self, scheme: Scheme, authority: &str, f: F) -> Self
    where
        F: Fn(&MemRequest) -> Script + Send + Sync + 'static,
    {
        self.add_route(scheme, authority, Arc::new(f), false)
    }

    /// Like `route`, but answers as soon as the request headers arrive.
    ///
    /// The request body is never read, the route sees it empty.
    pub fn route_early<F>(self, scheme: Scheme, authority: &str, f: F) -> Self
    where
        F: Fn(&MemRequest) -> Script + Send + Sync + 'static,
    {
        self.add_route(scheme, authority, Arc::new(f), true)
    }

    fn add_route(self, scheme: Scheme, authority: &str, f: RouteFn, early: bool) -> Self {
        let key = (scheme, authority.to_ascii_lowercase());
        self.inner
            .routes
            .lock()
            .unwrap()
            .insert(key, Route { f, early });
        self
    }

    /// Every request served so far, in order.
    pub fn requests(&self) -> Vec<MemRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    /// The native filter chain the transport was started with.
    pub fn started_filters(&self) -> Option<Vec<NativeFilter>> {
        self.inner.filters.lock().unwrap().clone()
    }

    /// Whether the engine shut the transport down.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn lookup(&self, target: &Target) -> Option<Route> {
        let key = (target.scheme, target.authority.as_str().to_ascii_lowercase());
        self.inner.routes.lock().unwrap().get(&key).cloned()
    }
}

impl Transport for MemTransport {
    fn start(&self, config: &EngineConfig) -> Result<(), Error> {
        *self.inner.filters.lock().unwrap() = Some(config.native_filters.clone());
        Ok(())
    }

    fn connect(&self, target: &Target) -> BoxFuture<'static, Result<ConnectionHandle, StreamError>> {
        let res = if self.is_shut_down() {
            Err(StreamError::connectivity("Transport is shut down"))
        } else if self.lookup(target).is_none() {
            Err(StreamError::connectivity(format!("No route to {}", target)))
        } else {
            let id = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
            Ok(ConnectionHandle::new(id))
        };

        future::ready(res).boxed()
    }

    fn send_request(
        &self,
        conn: ConnectionHandle,
        headers: RequestHeaders,
        body: RequestBody,
        end_stream: bool,
    ) -> EventStream {
        let this = self.clone();

        let fut = async move {
            let route = this.lookup(&headers.target());
            let early = route.as_ref().map(|r| r.early).unwrap_or(false);

            let (body, trailers) = if end_stream || early {
                (vec![], None)
            } else {
                read_body(body).await
            };

            let req = MemRequest {
                headers,
                body,
                trailers,
            };

            trace!("MemTransport conn {} serving: {:?}", conn.id(), req.headers);

            let script = match route {
                Some(r) => (r.f)(&req),
                None => Script::new().fail(StreamError::connectivity("Route removed")),
            };

            this.inner.requests.lock().unwrap().push(req);

            play(script)
        };

        fut.flatten_stream().boxed()
    }

    fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Collect the request body until its end.
async fn read_body(mut body: RequestBody) -> (Vec<u8>, Option<HeaderList>) {
    let mut buf = vec![];

    while let Some(frame) = body.next().await {
        match frame {
            BodyFrame::Data { data, end_stream } => {
                buf.extend_from_slice(&data);
                if end_stream {
                    return (buf, None);
                }
            }
            BodyFrame::Trailers(t) => return (buf, Some(t)),
        }
    }

    // sender gone without end, take what we got.
    (buf, None)
}

fn play(script: Script) -> impl futures_util::stream::Stream<Item = TransportEvent> {
    stream::unfold(script.steps.into_iter(), |mut steps| async move {
        loop {
            match steps.next()? {
                Step::Event(ev) => return Some((ev, steps)),
                Step::Delay(d) => tokio::time::sleep(d).await,
                Step::Hang => future::pending::<()>().await,
            }
        }
    })
}

impl fmt::Debug for MemTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes: Vec<String> = self
            .inner
            .routes
            .lock()
            .unwrap()
            .keys()
            .map(|(s, a)| format!("{}://{}", s, a))
            .collect();

        f.debug_struct("MemTransport")
            .field("routes", &routes)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
