/// Diagnostic metadata passed alongside every stream callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamIntel {
    /// Unique id of the stream within its engine.
    pub stream_id: u64,
    /// Transport connection the current attempt runs on.
    pub connection_id: Option<u64>,
    /// Number of requests issued, the first included.
    pub attempt_count: u32,
    /// Redirects followed so far.
    pub redirect_count: u32,
    /// Response body bytes delivered so far.
    pub received_byte_count: u64,
}

impl StreamIntel {
    pub(crate) fn new(stream_id: u64) -> Self {
        StreamIntel {
            stream_id,
            ..Default::default()
        }
    }
}
