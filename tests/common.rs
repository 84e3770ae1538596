#![allow(dead_code)]

use hreq_engine::mem::MemTransport;
use hreq_engine::{Engine, ErrorKind, StreamPrototype};
use std::sync::{Arc, Condvar, Mutex, Once};
use std::time::Duration;

/// How long tests wait for callbacks before giving up.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn setup_logger() {
    static START: Once = Once::new();
    START.call_once(|| {
        let test_log = std::env::var("TEST_LOG")
            .map(|x| x != "0" && x.to_lowercase() != "false")
            .unwrap_or(false);
        let level = if test_log {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        };
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Warn)
            .filter_module("hreq_engine", level)
            .target(env_logger::Target::Stdout)
            .init();
    });
}

/// Engine with default config over the given transport.
pub fn engine(transport: &MemTransport) -> Engine {
    setup_logger();
    Engine::builder(transport.clone())
        .build()
        .expect("engine build")
}

/// Callback invocations as observed by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Headers(u16, bool),
    Data(Vec<u8>, bool),
    Trailers(Vec<(String, String)>),
    Error(ErrorKind),
    Cancel,
    Complete,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Error(_) | Event::Cancel | Event::Complete)
    }
}

/// Records every callback of a stream, with a way to wait for them.
#[derive(Clone, Default)]
pub struct Recorder {
    inner: Arc<(Mutex<Vec<Event>>, Condvar)>,
}

impl Recorder {
    pub fn new() -> Self {
        Recorder::default()
    }

    fn push(&self, ev: Event) {
        let (lock, cvar) = &*self.inner;
        lock.lock().unwrap().push(ev);
        cvar.notify_all();
    }

    /// Register all callbacks on the prototype.
    pub fn attach(&self, proto: StreamPrototype) -> StreamPrototype {
        let r1 = self.clone();
        let r2 = self.clone();
        let r3 = self.clone();
        let r4 = self.clone();
        let r5 = self.clone();
        let r6 = self.clone();

        proto
            .set_on_response_headers(move |h, end, _| r1.push(Event::Headers(h.http_status(), end)))
            .set_on_response_data(move |d, end, _| r2.push(Event::Data(d.to_vec(), end)))
            .set_on_response_trailers(move |t, _| {
                let t = t
                    .iter()
                    .flat_map(|(n, vs)| {
                        vs.iter().map(move |v| {
                            (n.as_str().to_string(), v.to_str().unwrap().to_string())
                        })
                    })
                    .collect();
                r3.push(Event::Trailers(t))
            })
            .set_on_error(move |e, _| r4.push(Event::Error(e.kind())))
            .set_on_cancel(move |_| r5.push(Event::Cancel))
            .set_on_complete(move |_| r6.push(Event::Complete))
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.0.lock().unwrap().clone()
    }

    /// Wait until the recorded events satisfy `f`.
    pub fn wait_for<F: Fn(&[Event]) -> bool>(&self, f: F) -> Vec<Event> {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap();
        let (guard, res) = cvar.wait_timeout_while(guard, WAIT, |evs| !f(evs)).unwrap();
        assert!(!res.timed_out(), "Timeout waiting, got: {:?}", *guard);
        guard.clone()
    }

    /// Wait for the terminal event.
    pub fn wait_terminal(&self) -> Vec<Event> {
        self.wait_for(|evs| evs.iter().any(Event::is_terminal))
    }
}

/// Assert events follow `Headers (Data* Trailers?)? (Complete | Error | Cancel)`.
pub fn assert_well_formed(events: &[Event]) {
    let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminal.len(), 1, "exactly one terminal: {:?}", events);
    assert!(
        events.last().unwrap().is_terminal(),
        "terminal last: {:?}",
        events
    );

    let body = &events[..events.len() - 1];

    let mut i = 0;
    if let Some(Event::Headers(_, _)) = body.get(i) {
        i += 1;
        while let Some(Event::Data(_, _)) = body.get(i) {
            i += 1;
        }
        if let Some(Event::Trailers(_)) = body.get(i) {
            i += 1;
        }
    }
    assert_eq!(i, body.len(), "malformed sequence: {:?}", events);

    if let Some(Event::Complete) = events.last() {
        assert!(!body.is_empty(), "complete without headers: {:?}", events);
    }
}
