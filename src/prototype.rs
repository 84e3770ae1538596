use crate::engine::EngineInner;
use crate::headers::{ResponseHeaders, ResponseTrailers};
use crate::intel::StreamIntel;
use crate::stream::Stream;
use crate::{Error, StreamError};
use std::fmt;
use std::sync::Weak;

pub(crate) type OnResponseHeaders = Box<dyn FnOnce(ResponseHeaders, bool, &StreamIntel) + Send>;
pub(crate) type OnResponseData = Box<dyn FnMut(&[u8], bool, &StreamIntel) + Send>;
pub(crate) type OnResponseTrailers = Box<dyn FnOnce(ResponseTrailers, &StreamIntel) + Send>;
pub(crate) type OnError = Box<dyn FnOnce(StreamError, &StreamIntel) + Send>;
pub(crate) type OnCancel = Box<dyn FnOnce(&StreamIntel) + Send>;
pub(crate) type OnComplete = Box<dyn FnOnce(&StreamIntel) + Send>;

/// The callbacks of one stream. Each is taken when invoked, which is what
/// makes the once-only callbacks once-only.
#[derive(Default)]
pub(crate) struct Callbacks {
    pub on_response_headers: Option<OnResponseHeaders>,
    pub on_response_data: Option<OnResponseData>,
    pub on_response_trailers: Option<OnResponseTrailers>,
    pub on_error: Option<OnError>,
    pub on_cancel: Option<OnCancel>,
    pub on_complete: Option<OnComplete>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_response_headers", &self.on_response_headers.is_some())
            .field("on_response_data", &self.on_response_data.is_some())
            .field("on_response_trailers", &self.on_response_trailers.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_cancel", &self.on_cancel.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Builder collecting callbacks before a stream is started.
///
/// Obtained from [`StreamClient::new_stream_prototype`]. Setting the same
/// callback twice replaces the first one. `start()` consumes the prototype,
/// so it can't be started twice.
///
/// Callbacks run on the engine's worker threads, one at a time per stream.
/// A callback that blocks stalls that worker.
///
/// [`StreamClient::new_stream_prototype`]: struct.StreamClient.html#method.new_stream_prototype
#[derive(Debug)]
pub struct StreamPrototype {
    engine: Weak<EngineInner>,
    callbacks: Callbacks,
    follow_redirects: Option<bool>,
}

impl StreamPrototype {
    pub(crate) fn new(engine: Weak<EngineInner>) -> Self {
        StreamPrototype {
            engine,
            callbacks: Callbacks::default(),
            follow_redirects: None,
        }
    }

    /// Called once with the final response headers. `end_stream` means
    /// no body or trailers follow.
    pub fn set_on_response_headers<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ResponseHeaders, bool, &StreamIntel) + Send + 'static,
    {
        self.callbacks.on_response_headers = Some(Box::new(f));
        self
    }

    /// Called for each response body chunk. The chunk is only valid for the
    /// duration of the call.
    pub fn set_on_response_data<F>(mut self, f: F) -> Self
    where
        F: FnMut(&[u8], bool, &StreamIntel) + Send + 'static,
    {
        self.callbacks.on_response_data = Some(Box::new(f));
        self
    }

    /// Called once if the response ends with trailers.
    pub fn set_on_response_trailers<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ResponseTrailers, &StreamIntel) + Send + 'static,
    {
        self.callbacks.on_response_trailers = Some(Box::new(f));
        self
    }

    /// Terminal: the stream failed.
    pub fn set_on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(StreamError, &StreamIntel) + Send + 'static,
    {
        self.callbacks.on_error = Some(Box::new(f));
        self
    }

    /// Terminal: the stream was cancelled.
    pub fn set_on_cancel<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&StreamIntel) + Send + 'static,
    {
        self.callbacks.on_cancel = Some(Box::new(f));
        self
    }

    /// Terminal: request and response both ended.
    pub fn set_on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&StreamIntel) + Send + 'static,
    {
        self.callbacks.on_complete = Some(Box::new(f));
        self
    }

    /// Override the engine's redirect following for this stream.
    pub fn set_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = Some(follow);
        self
    }

    /// Start a stream bound to the engine.
    ///
    /// Errors with `Error::EngineTerminated` if the engine is gone.
    pub fn start(self) -> Result<Stream, Error> {
        let engine = self.engine.upgrade().ok_or(Error::EngineTerminated)?;
        engine.start_stream(self.callbacks, self.follow_redirects)
    }
}
