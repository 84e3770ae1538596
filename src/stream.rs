use crate::dispatch::{Control, Outbound};
use crate::engine::EngineInner;
use crate::headers::{RequestHeaders, RequestTrailers};
use crate::Error;
use futures_channel::mpsc;
use log::LevelFilter;
use std::sync::{Arc, Mutex, Weak};

/// State of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Both sides open.
    Open,
    /// The request side ended.
    HalfClosedLocal,
    /// The response ended, the request side still open.
    HalfClosedRemote,
    /// Completed normally.
    Closed,
    /// Ended with `on_error`.
    Errored,
    /// Ended with `on_cancel`.
    Cancelled,
}

impl StreamState {
    /// Whether the stream delivered its terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Closed | StreamState::Errored | StreamState::Cancelled
        )
    }
}

/// State shared between the stream handle and its dispatcher.
#[derive(Debug)]
pub(crate) struct StreamShared {
    id: u64,
    flags: Mutex<Flags>,
}

#[derive(Debug, Default)]
struct Flags {
    headers_sent: bool,
    local_closed: bool,
    remote_closed: bool,
    terminal: Option<StreamState>,
}

impl StreamShared {
    pub fn new(id: u64) -> Self {
        StreamShared {
            id,
            flags: Mutex::new(Flags::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        let f = self.flags.lock().unwrap();

        if let Some(t) = f.terminal {
            return t;
        }

        match (f.local_closed, f.remote_closed) {
            (true, true) => StreamState::Closed,
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            (false, false) => StreamState::Open,
        }
    }

    pub fn close_remote(&self) {
        self.flags.lock().unwrap().remote_closed = true;
    }

    /// Record the terminal state. First one wins.
    pub fn set_terminal(&self, state: StreamState) {
        let mut f = self.flags.lock().unwrap();
        if f.terminal.is_none() {
            f.terminal = Some(state);
        }
    }
}

/// A live request/response exchange.
///
/// Obtained from [`StreamPrototype::start`]. Response events are delivered to
/// the callbacks registered on the prototype.
///
/// Dropping the handle before the request side ended cancels the stream,
/// since the request can't be finished anymore. Dropping it afterwards lets
/// the exchange run to its terminal event.
///
/// [`StreamPrototype::start`]: struct.StreamPrototype.html#method.start
#[derive(Debug)]
pub struct Stream {
    shared: Arc<StreamShared>,
    out_tx: mpsc::UnboundedSender<Outbound>,
    control_tx: mpsc::UnboundedSender<Control>,
    engine: Weak<EngineInner>,
    log: LevelFilter,
}

impl Stream {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        out_tx: mpsc::UnboundedSender<Outbound>,
        control_tx: mpsc::UnboundedSender<Control>,
        engine: Weak<EngineInner>,
        log: LevelFilter,
    ) -> Self {
        Stream {
            shared,
            out_tx,
            control_tx,
            engine,
            log,
        }
    }

    /// Unique id of the stream within its engine.
    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    /// Current state, as seen by the caller.
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Send the request headers.
    ///
    /// With `end_stream` the request has no body. Otherwise the body follows
    /// with `send_data` and/or `send_trailers`.
    pub fn send_headers(&self, headers: RequestHeaders, end_stream: bool) -> Result<(), Error> {
        self.check_engine()?;

        {
            let mut f = self.shared.flags.lock().unwrap();

            if f.terminal.is_some() {
                return Err(Error::StreamClosed);
            }

            if f.headers_sent {
                return Err(Error::User("Request headers already sent".into()));
            }

            f.headers_sent = true;
            f.local_closed = end_stream;
        }

        elog!(
            self.log,
            Trace,
            "Stream {} send headers: {} {}://{}{} end: {}",
            self.id(),
            headers.method(),
            headers.scheme(),
            headers.authority(),
            headers.path(),
            end_stream
        );

        self.submit(Outbound::Headers {
            headers,
            end_stream,
        })
    }

    /// Send some request body data.
    ///
    /// `end_stream` controls whether this is the last body chunk. It's an
    /// error to send more after the request side ended.
    pub fn send_data(&self, data: &[u8], end_stream: bool) -> Result<(), Error> {
        self.check_engine()?;
        self.open_body(end_stream)?;

        self.submit(Outbound::Data {
            data: data.to_vec(),
            end_stream,
        })
    }

    /// Send request trailers, which ends the request side.
    pub fn send_trailers(&self, trailers: RequestTrailers) -> Result<(), Error> {
        self.check_engine()?;
        self.open_body(true)?;

        self.submit(Outbound::Trailers(trailers))
    }

    /// Cancel the stream.
    ///
    /// Safe to call at any time. The stream ends with `on_cancel`, unless it
    /// already reached (or concurrently reaches) another terminal event, in
    /// which case this does nothing.
    pub fn cancel(&self) {
        if self.control_tx.unbounded_send(Control::Cancel).is_err() {
            elog!(self.log, Trace, "Stream {} cancel after terminal event", self.id());
        }
    }

    fn check_engine(&self) -> Result<(), Error> {
        match self.engine.upgrade() {
            Some(engine) if engine.is_running() => Ok(()),
            _ => Err(Error::EngineTerminated),
        }
    }

    /// Check request body is expected and mark whether it ends.
    fn open_body(&self, end_stream: bool) -> Result<(), Error> {
        let mut f = self.shared.flags.lock().unwrap();

        if f.terminal.is_some() {
            return Err(Error::StreamClosed);
        }

        if !f.headers_sent {
            return Err(Error::User(
                "Request headers must be sent before body".into(),
            ));
        }

        if f.local_closed {
            return Err(Error::User("Request body is not expected".into()));
        }

        if end_stream {
            f.local_closed = true;
        }

        Ok(())
    }

    fn submit(&self, out: Outbound) -> Result<(), Error> {
        // the dispatcher is gone once the stream reached its terminal event.
        self.out_tx
            .unbounded_send(out)
            .map_err(|_| Error::StreamClosed)
    }
}
