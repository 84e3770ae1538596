use crate::config::{EngineConfig, LogLevel, NativeFilter};
use crate::dispatch::{Control, Dispatcher, Settings};
use crate::prototype::{Callbacks, StreamPrototype};
use crate::stream::{Stream, StreamShared};
use crate::transport::Transport;
use crate::Error;
use futures_channel::mpsc;
use log::LevelFilter;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Config validated, transport not started yet.
    Building,
    /// Accepting streams.
    Running,
    /// Terminated. Terminal.
    Terminated,
}

/// Builder of an [`Engine`].
pub struct EngineBuilder {
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    filter_types: Vec<String>,
}

impl EngineBuilder {
    /// Builder over the given transport with the default config.
    pub fn new<T: Transport>(transport: T) -> Self {
        EngineBuilder::with_transport(Arc::new(transport))
    }

    /// Same as `new()` for an already shared transport.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        EngineBuilder {
            transport,
            config: EngineConfig::default(),
            filter_types: vec![],
        }
    }

    /// Replace the whole config.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Level of this engine's own logging.
    ///
    /// The global `log` filter is left to the host application.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Default for streams not setting `set_follow_redirects`.
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    /// Redirect hops followed before the redirect itself is delivered.
    pub fn max_redirects(mut self, max: u32) -> Self {
        self.config.max_redirects = max;
        self
    }

    /// Append a filter to the native filter chain.
    pub fn add_native_filter(mut self, name: &str, type_url: &str, config: &str) -> Self {
        self.config
            .native_filters
            .push(NativeFilter::new(name, type_url, config));
        self
    }

    /// Accept another native filter type in addition to the known ones.
    pub fn register_filter_type(mut self, type_url: &str) -> Self {
        self.filter_types.push(type_url.to_string());
        self
    }

    /// Time allowed for the transport to connect, per hop.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = millis(timeout);
        self
    }

    /// Time allowed from request headers to the end of the response.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout_ms = Some(millis(timeout));
        self
    }

    /// Threads of the engine's runtime, at least one.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    /// How long `terminate()` waits for streams to deliver their final
    /// callback.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_ms = millis(grace);
        self
    }

    /// Validate the config, start the runtime and the transport.
    pub fn build(self) -> Result<Engine, Error> {
        Engine::build(self.config, self.transport, &self.filter_types)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("filter_types", &self.filter_types)
            .finish()
    }
}

/// The long-lived owner of the transport and the worker threads.
///
/// Streams are created through the [`StreamClient`]. Callbacks of all streams
/// run on the engine's worker threads.
///
/// Termination is forceful: `terminate()` fails every in-flight stream with
/// `ErrorKind::EngineTerminated` rather than waiting for network round trips.
/// Dropping the engine terminates it.
///
/// [`StreamClient`]: struct.StreamClient.html
pub struct Engine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    registry: Mutex<Registry>,
    /// Signalled when the last stream leaves the registry.
    drained: Condvar,
    next_stream_id: AtomicU64,
    log: LevelFilter,
}

/// Live streams by id.
struct Registry {
    state: EngineState,
    streams: HashMap<u64, mpsc::UnboundedSender<Control>>,
}

impl Engine {
    /// Builder over the given transport.
    pub fn builder<T: Transport>(transport: T) -> EngineBuilder {
        EngineBuilder::new(transport)
    }

    pub(crate) fn build(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        filter_types: &[String],
    ) -> Result<Engine, Error> {
        config.validate(filter_types)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("hreq-engine")
            .enable_all()
            .build()?;

        let inner = Arc::new(EngineInner {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            registry: Mutex::new(Registry {
                state: EngineState::Building,
                streams: HashMap::new(),
            }),
            drained: Condvar::new(),
            next_stream_id: AtomicU64::new(1),
            log: config.log_level.into(),
            config,
            transport,
        });

        if let Err(e) = inner.transport.start(&inner.config) {
            // the runtime was never used, stop it from this thread.
            inner.registry.lock().unwrap().state = EngineState::Terminated;
            if let Some(rt) = inner.runtime.lock().unwrap().take() {
                rt.shutdown_background();
            }
            return Err(match e {
                Error::Configuration(_) => e,
                other => Error::Configuration(format!("Transport start failed: {}", other)),
            });
        }

        inner.registry.lock().unwrap().state = EngineState::Running;

        elog!(
            inner.log,
            Info,
            "Engine started, log level: {}, native filters: {}",
            inner.config.log_level,
            inner.config.native_filters.len()
        );

        Ok(Engine { inner })
    }

    /// Client for creating streams. Only usable while the engine is running.
    pub fn stream_client(&self) -> StreamClient {
        StreamClient {
            engine: Arc::downgrade(&self.inner),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// The config the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Terminate the engine.
    ///
    /// No new streams can be started afterwards. Every in-flight stream
    /// receives `on_error` with `ErrorKind::EngineTerminated`. Waits up to
    /// the configured shutdown grace for those callbacks to run, unless
    /// called from within an async context (such as a stream callback), in
    /// which case the wait happens on a background thread.
    ///
    /// Calling it again does nothing.
    pub fn terminate(&self) {
        EngineInner::terminate(&self.inner);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        EngineInner::terminate(&self.inner);
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl EngineInner {
    pub(crate) fn state(&self) -> EngineState {
        self.registry.lock().unwrap().state
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub(crate) fn start_stream(
        self: &Arc<Self>,
        callbacks: Callbacks,
        follow_redirects: Option<bool>,
    ) -> Result<Stream, Error> {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);

        let (out_tx, out_rx) = mpsc::unbounded();
        let (control_tx, control_rx) = mpsc::unbounded();

        let shared = Arc::new(StreamShared::new(id));

        let settings = Settings {
            follow_redirects: follow_redirects.unwrap_or(self.config.follow_redirects),
            max_redirects: self.config.max_redirects,
            connect_timeout: self.config.connect_timeout(),
            response_timeout: self.config.response_timeout(),
            log_level: self.log,
        };

        let dispatcher = Dispatcher::new(
            shared.clone(),
            self.transport.clone(),
            settings,
            callbacks,
            out_rx,
            control_rx,
            Arc::downgrade(self),
        );

        let refused = {
            let mut reg = self.registry.lock().unwrap();

            if reg.state == EngineState::Running {
                reg.streams.insert(id, control_tx.clone());

                // spawned under the lock so terminate() sees every dispatcher.
                self.handle.spawn(dispatcher.run());
                None
            } else {
                Some(dispatcher)
            }
        };

        if let Some(dispatcher) = refused {
            // dropped outside the lock, the callbacks may own the engine.
            dispatcher.discard();
            return Err(Error::EngineTerminated);
        }

        elog!(self.log, Debug, "Stream {} started", id);

        Ok(Stream::new(
            shared,
            out_tx,
            control_tx,
            Arc::downgrade(self),
            self.log,
        ))
    }

    /// Called by a dispatcher when it's done.
    pub(crate) fn stream_finished(&self, id: u64) {
        let mut reg = self.registry.lock().unwrap();
        reg.streams.remove(&id);

        if reg.streams.is_empty() {
            self.drained.notify_all();
        }
    }

    fn terminate(this: &Arc<Self>) {
        let streams: Vec<_> = {
            let mut reg = this.registry.lock().unwrap();

            if reg.state == EngineState::Terminated {
                elog!(this.log, Trace, "Engine already terminated");
                return;
            }

            reg.state = EngineState::Terminated;
            reg.streams.values().cloned().collect()
        };

        elog!(this.log, Info, "Engine terminating, {} streams in flight", streams.len());

        this.transport.shutdown();

        for tx in streams {
            // the dispatcher may have ended in the meantime.
            tx.unbounded_send(Control::Shutdown).ok();
        }

        let runtime = this.runtime.lock().unwrap().take();

        if let Some(runtime) = runtime {
            if Handle::try_current().is_ok() {
                // can't block (nor drop a runtime) inside an async context.
                let inner = this.clone();
                let spawned = std::thread::Builder::new()
                    .name("hreq-engine-shutdown".into())
                    .spawn(move || inner.drain_and_stop(runtime));

                if let Err(e) = spawned {
                    elog!(this.log, Warn, "Failed to spawn engine shutdown thread: {}", e);
                }
            } else {
                this.drain_and_stop(runtime);
            }
        }
    }

    /// Wait for streams to deliver their terminal event, then stop the runtime.
    fn drain_and_stop(&self, runtime: Runtime) {
        let grace = self.config.shutdown_grace();
        let started = Instant::now();

        {
            let reg = self.registry.lock().unwrap();
            let (reg, res) = self
                .drained
                .wait_timeout_while(reg, grace, |r| !r.streams.is_empty())
                .unwrap();

            if res.timed_out() {
                elog!(
                    self.log,
                    Warn,
                    "Engine shutdown grace expired with {} streams unresolved",
                    reg.streams.len()
                );
            }
        }

        runtime.shutdown_timeout(grace.saturating_sub(started.elapsed()));

        elog!(self.log, Info, "Engine terminated");
    }
}

/// Factory of streams on a running engine.
///
/// Holds no reference keeping the engine alive.
#[derive(Debug, Clone)]
pub struct StreamClient {
    engine: Weak<EngineInner>,
}

impl StreamClient {
    /// A fresh prototype without callbacks.
    pub fn new_stream_prototype(&self) -> StreamPrototype {
        StreamPrototype::new(self.engine.clone())
    }
}

impl fmt::Debug for EngineInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineInner")
            .field("state", &self.state())
            .finish()
    }
}
