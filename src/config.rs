//! Engine configuration, buildable in code or parsed from JSON.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Native filter types every engine accepts without registration.
pub const KNOWN_FILTER_TYPES: &[&str] = &[
    "type.googleapis.com/envoymobile.extensions.filters.http.assertion.Assertion",
    "type.googleapis.com/envoymobile.extensions.filters.http.local_error.LocalError",
    "type.googleapis.com/envoymobile.extensions.filters.http.network_configuration.NetworkConfiguration",
    "type.googleapis.com/envoymobile.extensions.filters.http.platform_bridge.PlatformBridge",
    "type.googleapis.com/envoymobile.extensions.filters.http.route_cache_reset.RouteCacheReset",
    "type.googleapis.com/envoymobile.extensions.filters.http.test_remote_response.TestRemoteResponse",
    "type.googleapis.com/envoy.extensions.filters.http.buffer.v3.Buffer",
];

/// Verbosity of the engine's logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything, including every dispatched stream event.
    Trace,
    /// Stream starts, redirects and cancellations.
    Debug,
    /// Engine lifecycle.
    Info,
    /// Unexpected but recoverable conditions.
    Warn,
    /// Errors only.
    Error,
    /// Same as `Error` for the `log` crate.
    Critical,
    /// Nothing.
    Off,
}

impl LogLevel {
    /// Lowercase name, as used in config documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
            LogLevel::Off => "off",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = match s.to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            "critical" => LogLevel::Critical,
            "off" => LogLevel::Off,
            _ => return Err(Error::Configuration(format!("Unknown log level: {}", s))),
        };
        Ok(level)
    }
}

impl From<LogLevel> for log::LevelFilter {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            // log has nothing above error.
            LogLevel::Error | LogLevel::Critical => log::LevelFilter::Error,
            LogLevel::Off => log::LevelFilter::Off,
        }
    }
}

/// Descriptor of a native filter handed to the transport's filter chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeFilter {
    /// Unique within an engine.
    pub name: String,
    /// Protobuf type url, one of [`KNOWN_FILTER_TYPES`] unless registered.
    pub type_url: String,
    /// Filter config as a JSON object.
    pub config: String,
}

impl NativeFilter {
    /// Filter descriptor. Validated when the engine is built.
    pub fn new(
        name: impl Into<String>,
        type_url: impl Into<String>,
        config: impl Into<String>,
    ) -> Self {
        NativeFilter {
            name: name.into(),
            type_url: type_url.into(),
            config: config.into(),
        }
    }
}

/// Engine configuration snapshot.
///
/// Every field has a default, so a config document only needs to mention
/// what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Level of the engine's own logging.
    pub log_level: LogLevel,
    /// Engine wide default, prototypes can override.
    pub follow_redirects: bool,
    /// Hops followed before a redirect is delivered as the response.
    pub max_redirects: u32,
    /// Filter chain, in order.
    pub native_filters: Vec<NativeFilter>,
    /// Bound on each transport connect.
    pub connect_timeout_ms: u64,
    /// Deadline from sending request headers until the response is complete.
    pub response_timeout_ms: Option<u64>,
    /// Threads of the engine's runtime.
    pub worker_threads: usize,
    /// How long `terminate()` waits for in-flight streams to deliver their terminal event.
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            log_level: LogLevel::Info,
            follow_redirects: true,
            max_redirects: 5,
            native_filters: vec![],
            connect_timeout_ms: 30_000,
            response_timeout_ms: None,
            worker_threads: 2,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Parse a config from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::Configuration(format!("{}", e)))
    }

    /// `connect_timeout_ms` as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `response_timeout_ms` as a duration.
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }

    /// `shutdown_grace_ms` as a duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Check the config is structurally valid.
    ///
    /// `extra_filter_types` are accepted in addition to [`KNOWN_FILTER_TYPES`].
    pub fn validate(&self, extra_filter_types: &[String]) -> Result<(), Error> {
        if self.worker_threads == 0 {
            return Err(Error::Configuration(
                "worker_threads must be at least 1".into(),
            ));
        }

        let mut names = HashSet::new();

        for filter in &self.native_filters {
            if filter.name.is_empty() {
                return Err(Error::Configuration("Native filter without name".into()));
            }

            if !names.insert(filter.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "Duplicate native filter name: {}",
                    filter.name
                )));
            }

            let known = KNOWN_FILTER_TYPES.contains(&filter.type_url.as_str())
                || extra_filter_types.iter().any(|t| t == &filter.type_url);

            if !known {
                return Err(Error::Configuration(format!(
                    "Unknown filter type for {}: {}",
                    filter.name, filter.type_url
                )));
            }

            let value: serde_json::Value = serde_json::from_str(&filter.config).map_err(|e| {
                Error::Configuration(format!("Filter {} config is not JSON: {}", filter.name, e))
            })?;

            let obj = value.as_object().ok_or_else(|| {
                Error::Configuration(format!("Filter {} config is not an object", filter.name))
            })?;

            if let Some(t) = obj.get("@type") {
                if t.as_str() != Some(filter.type_url.as_str()) {
                    return Err(Error::Configuration(format!(
                        "Filter {} @type does not match {}",
                        filter.name, filter.type_url
                    )));
                }
            }
        }

        Ok(())
    }
}
