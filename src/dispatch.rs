//! Per-stream event dispatcher.
//!
//! Every stream is driven by one task on the engine runtime. The task is the
//! only owner of the stream's callbacks, so callbacks of a stream never run
//! concurrently, and it returns right after delivering the terminal event, so
//! nothing can be delivered after it.
//!
//! Inputs, in priority order:
//!
//! 1. Control (cancel, engine shutdown) from the stream handle and the engine.
//! 2. Outbound request parts from the stream handle.
//! 3. Transport events of the current attempt.
//! 4. The response deadline.
//!
//! ```text
//!            Waiting (no request headers yet)
//!                        |
//!                        v
//!                     Connect  <-----------
//!                        |                |
//!                        v                |
//!                    Exchange ---------> Redirect
//!                        |
//!                        v
//!          Complete / Error / Cancel (terminal)
//! ```

use crate::engine::EngineInner;
use crate::headers::{RequestHeaders, RequestTrailers, ResponseHeaders};
use crate::intel::StreamIntel;
use crate::prototype::Callbacks;
use crate::redirect::{self, ReplayBuffer};
use crate::stream::{StreamShared, StreamState};
use crate::transport::{BodyFrame, EventStream, Transport, TransportEvent};
use crate::StreamError;
use futures_channel::mpsc;
use futures_util::future;
use futures_util::stream::StreamExt;
use log::LevelFilter;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Request parts from the stream handle.
#[derive(Debug)]
pub(crate) enum Outbound {
    Headers {
        headers: RequestHeaders,
        end_stream: bool,
    },
    Data {
        data: Vec<u8>,
        end_stream: bool,
    },
    Trailers(RequestTrailers),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Cancel,
    Shutdown,
}

/// Per stream settings resolved from engine config and prototype.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub connect_timeout: Duration,
    pub response_timeout: Option<Duration>,
    pub log_level: LevelFilter,
}

/// How the stream ended.
#[derive(Debug)]
enum Exit {
    Complete,
    Error(StreamError),
    Cancel,
}

/// Outcome of one request attempt.
enum Attempt {
    Exit(Exit),
    Redirect(RequestHeaders),
}

/// Progress of the response within one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingHeaders,
    Body,
    Ended,
}

/// What to do after handling one input.
enum Step {
    Continue,
    Exit(Exit),
    Redirect(RequestHeaders),
}

pub(crate) struct Dispatcher {
    shared: Arc<StreamShared>,
    transport: Arc<dyn Transport>,
    settings: Settings,
    callbacks: Callbacks,
    intel: StreamIntel,
    out_rx: mpsc::UnboundedReceiver<Outbound>,
    /// False once the stream handle is dropped.
    out_open: bool,
    control_rx: mpsc::UnboundedReceiver<Control>,
    /// Current attempt's request body, if it's still being sent.
    body_tx: Option<mpsc::UnboundedSender<BodyFrame>>,
    replay: ReplayBuffer,
    has_body: bool,
    local_ended: bool,
    remote_ended: bool,
    deadline: Option<Instant>,
    log: LevelFilter,
    guard: Guard,
}

impl Dispatcher {
    pub fn new(
        shared: Arc<StreamShared>,
        transport: Arc<dyn Transport>,
        settings: Settings,
        callbacks: Callbacks,
        out_rx: mpsc::UnboundedReceiver<Outbound>,
        control_rx: mpsc::UnboundedReceiver<Control>,
        engine: Weak<EngineInner>,
    ) -> Self {
        let id = shared.id();
        let log = settings.log_level;

        Dispatcher {
            shared,
            transport,
            settings,
            callbacks,
            intel: StreamIntel::new(id),
            out_rx,
            out_open: true,
            control_rx,
            body_tx: None,
            replay: ReplayBuffer::default(),
            has_body: false,
            local_ended: false,
            remote_ended: false,
            deadline: None,
            log,
            guard: Guard {
                id,
                engine,
                finished: false,
                log,
            },
        }
    }

    /// Drop a dispatcher that was never registered nor spawned.
    pub fn discard(mut self) {
        self.guard.finished = true;
        self.guard.engine = Weak::new();
    }

    pub async fn run(mut self) {
        let exit = self.drive().await;
        self.finish(exit);
    }

    async fn drive(&mut self) -> Exit {
        let (headers, end_stream) = loop {
            tokio::select! {
                biased;

                ctl = self.control_rx.next() => return control_exit(ctl),

                out = self.out_rx.next() => match out {
                    Some(Outbound::Headers { headers, end_stream }) => break (headers, end_stream),
                    Some(other) => {
                        // invariant: the stream handle sends headers first.
                        elog!(
                            self.log,
                            Warn,
                            "Stream {} got {:?} before request headers",
                            self.intel.stream_id,
                            other
                        );
                    }
                    None => {
                        elog!(
                            self.log,
                            Debug,
                            "Stream {} dropped before sending request headers",
                            self.intel.stream_id
                        );
                        return Exit::Cancel;
                    }
                },
            }
        };

        self.has_body = !end_stream;
        self.local_ended = end_stream;
        self.deadline = self.settings.response_timeout.map(|t| Instant::now() + t);

        let mut request = headers;

        loop {
            match self.attempt(&request).await {
                Attempt::Exit(exit) => return exit,
                Attempt::Redirect(next) => {
                    self.intel.redirect_count += 1;

                    elog!(
                        self.log,
                        Debug,
                        "Stream {} redirect {} -> {}://{}{}",
                        self.intel.stream_id,
                        request.target(),
                        next.scheme(),
                        next.authority(),
                        next.path()
                    );

                    request = next;
                }
            }
        }
    }

    /// Connect and issue one request, then drive the exchange.
    async fn attempt(&mut self, request: &RequestHeaders) -> Attempt {
        self.intel.attempt_count += 1;
        self.intel.connection_id = None;

        let target = request.target();
        let connect = tokio::time::timeout(
            self.settings.connect_timeout,
            self.transport.connect(&target)
        );

        let conn = tokio::select! {
            biased;

            ctl = self.control_rx.next() => return Attempt::Exit(control_exit(ctl)),

            res = connect => match res {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => return Attempt::Exit(Exit::Error(e)),
                Err(_) => {
                    let msg = format!("Connect to {} timed out", target);
                    return Attempt::Exit(Exit::Error(StreamError::timeout(msg)));
                }
            },

            _ = expire(self.deadline) => return Attempt::Exit(self.timed_out()),
        };

        elog!(
            self.log,
            Trace,
            "Stream {} connected {} on {}",
            self.intel.stream_id,
            target,
            conn.id()
        );

        self.intel.connection_id = Some(conn.id());

        let (body_tx, body_rx) = mpsc::unbounded();

        if self.has_body {
            self.replay.replay_into(&body_tx);
        }

        if self.has_body && !self.local_ended {
            self.body_tx = Some(body_tx);
        } else {
            // closes the body for the transport.
            drop(body_tx);
        }

        let mut events = self
            .transport
            .send_request(conn, request.clone(), body_rx, !self.has_body);

        self.exchange(request, &mut events).await
    }

    async fn exchange(&mut self, request: &RequestHeaders, events: &mut EventStream) -> Attempt {
        let mut phase = Phase::AwaitingHeaders;
        let mut events_open = true;

        loop {
            let step = tokio::select! {
                biased;

                ctl = self.control_rx.next() => Step::Exit(control_exit(ctl)),

                out = self.out_rx.next(), if self.out_open => self.on_outbound(out),

                ev = events.next(), if events_open => {
                    let ev = ev.unwrap_or(TransportEvent::Closed);
                    if matches!(ev, TransportEvent::Closed) {
                        events_open = false;
                    }
                    self.on_event(ev, request, &mut phase)
                }

                _ = expire(self.deadline) => Step::Exit(self.timed_out()),
            };

            match step {
                Step::Continue => {}
                Step::Exit(exit) => return Attempt::Exit(exit),
                Step::Redirect(next) => return Attempt::Redirect(next),
            }
        }
    }

    fn on_outbound(&mut self, out: Option<Outbound>) -> Step {
        let frame = match out {
            Some(Outbound::Data { data, end_stream }) => BodyFrame::Data { data, end_stream },
            Some(Outbound::Trailers(t)) => BodyFrame::Trailers(t),
            Some(Outbound::Headers { .. }) => {
                // invariant: the stream handle refuses a second send_headers.
                elog!(self.log, Warn, "Stream {} got request headers twice", self.intel.stream_id);
                return Step::Continue;
            }
            None => {
                self.out_open = false;

                if self.local_ended {
                    return Step::Continue;
                }

                elog!(
                    self.log,
                    Debug,
                    "Stream {} dropped before request ended",
                    self.intel.stream_id
                );
                return Step::Exit(Exit::Cancel);
            }
        };

        let end = frame.is_end();

        self.replay.push(&frame);

        if let Some(tx) = &self.body_tx {
            if tx.unbounded_send(frame).is_err() {
                elog!(
                    self.log,
                    Trace,
                    "Stream {} transport stopped reading body",
                    self.intel.stream_id
                );
            }
        }

        if end {
            self.local_ended = true;
            self.body_tx = None;

            if self.remote_ended {
                return Step::Exit(Exit::Complete);
            }
        }

        Step::Continue
    }

    fn on_event(&mut self, ev: TransportEvent, request: &RequestHeaders, phase: &mut Phase) -> Step {
        let id = self.intel.stream_id;

        elog!(self.log, Trace, "Stream {} event in {:?}: {:?}", id, phase, ev);

        match ev {
            TransportEvent::HeadersReceived {
                headers,
                end_stream,
            } => {
                if *phase != Phase::AwaitingHeaders {
                    return protocol_error("Response headers received twice");
                }

                if headers.status().is_informational() {
                    if end_stream {
                        return protocol_error("Stream ended with informational headers");
                    }
                    elog!(self.log, Trace, "Stream {} skip informational {}", id, headers.status());
                    return Step::Continue;
                }

                if let Some(next) = self.redirect_to(request, &headers) {
                    return Step::Redirect(next);
                }

                if let Some(f) = self.callbacks.on_response_headers.take() {
                    f(headers, end_stream, &self.intel);
                }

                if end_stream {
                    self.end_response(phase)
                } else {
                    *phase = Phase::Body;
                    Step::Continue
                }
            }

            TransportEvent::DataReceived { data, end_stream } => {
                match *phase {
                    Phase::AwaitingHeaders => return protocol_error("Data before response headers"),
                    Phase::Ended => return protocol_error("Data after end of stream"),
                    Phase::Body => {}
                }

                self.intel.received_byte_count += data.len() as u64;

                if let Some(f) = self.callbacks.on_response_data.as_mut() {
                    f(&data, end_stream, &self.intel);
                }

                if end_stream {
                    self.end_response(phase)
                } else {
                    Step::Continue
                }
            }

            TransportEvent::TrailersReceived { trailers } => {
                match *phase {
                    Phase::AwaitingHeaders => {
                        return protocol_error("Trailers before response headers")
                    }
                    Phase::Ended => return protocol_error("Trailers after end of stream"),
                    Phase::Body => {}
                }

                if let Some(f) = self.callbacks.on_response_trailers.take() {
                    f(trailers, &self.intel);
                }

                self.end_response(phase)
            }

            TransportEvent::Failed { reason } => Step::Exit(Exit::Error(reason)),

            TransportEvent::Closed => {
                if *phase == Phase::Ended {
                    // waiting for the request side to end.
                    Step::Continue
                } else {
                    protocol_error("Stream closed before response completed")
                }
            }
        }
    }

    /// A redirect to follow instead of delivering these headers, if any.
    fn redirect_to(
        &mut self,
        request: &RequestHeaders,
        headers: &ResponseHeaders,
    ) -> Option<RequestHeaders> {
        if !self.settings.follow_redirects || !redirect::is_redirect(headers.status()) {
            return None;
        }

        let id = self.intel.stream_id;

        if self.intel.redirect_count >= self.settings.max_redirects {
            elog!(self.log, Debug, "Stream {} max redirects reached", id);
            return None;
        }

        if !self.replay.can_replay() {
            elog!(self.log, Debug, "Stream {} can't replay request body for redirect", id);
            return None;
        }

        match redirect::follow(request, headers) {
            Ok(r) => {
                if r.drop_body {
                    self.has_body = false;
                    self.replay.clear();
                    self.body_tx = None;
                }
                Some(r.request)
            }
            Err(reason) => {
                elog!(self.log, Debug, "Stream {} not following redirect: {}", id, reason);
                None
            }
        }
    }

    fn end_response(&mut self, phase: &mut Phase) -> Step {
        *phase = Phase::Ended;
        self.remote_ended = true;
        // the deadline only covers the response.
        self.deadline = None;
        self.shared.close_remote();

        if self.local_ended {
            Step::Exit(Exit::Complete)
        } else {
            elog!(self.log, Trace, "Stream {} response ended before request", self.intel.stream_id);
            Step::Continue
        }
    }

    fn timed_out(&self) -> Exit {
        Exit::Error(StreamError::timeout("No complete response within deadline"))
    }

    /// Deliver the terminal event.
    fn finish(mut self, exit: Exit) {
        let id = self.intel.stream_id;
        let intel = self.intel.clone();

        // no more events can reach the transport or the handle.
        self.body_tx = None;
        self.out_rx.close();
        self.control_rx.close();

        match exit {
            Exit::Complete => {
                self.shared.set_terminal(StreamState::Closed);
                match self.callbacks.on_complete.take() {
                    Some(f) => f(&intel),
                    None => elog!(self.log, Debug, "Stream {} complete", id),
                }
            }
            Exit::Error(e) => {
                self.shared.set_terminal(StreamState::Errored);
                match self.callbacks.on_error.take() {
                    Some(f) => f(e, &intel),
                    None => elog!(
                        self.log,
                        Warn,
                        "Stream {} failed without error callback: {}",
                        id,
                        e
                    ),
                }
            }
            Exit::Cancel => {
                self.shared.set_terminal(StreamState::Cancelled);
                match self.callbacks.on_cancel.take() {
                    Some(f) => f(&intel),
                    None => elog!(self.log, Debug, "Stream {} cancelled", id),
                }
            }
        }

        self.guard.finished = true;
    }
}

fn control_exit(ctl: Option<Control>) -> Exit {
    match ctl {
        Some(Control::Cancel) => Exit::Cancel,
        // engine side sender is gone, which only happens on shutdown.
        Some(Control::Shutdown) | None => Exit::Error(StreamError::engine_terminated()),
    }
}

fn protocol_error(msg: &str) -> Step {
    Step::Exit(Exit::Error(StreamError::protocol(msg)))
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => future::pending().await,
    }
}

/// Unregisters the stream from the engine however the dispatcher ends.
struct Guard {
    id: u64,
    engine: Weak<EngineInner>,
    finished: bool,
    log: LevelFilter,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if !self.finished {
            elog!(self.log, Warn, "Stream {} dropped without terminal event", self.id);
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.stream_finished(self.id);
        }
    }
}
