//! Request and response header types.
//!
//! Headers are kept as an ordered list of names, each with an ordered sequence
//! of values, so repeated headers and their order survive the trip through
//! the engine. Names and values are validated by the `http` crate.

use crate::Error;
use http::header::{HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery};
use http::{Method, StatusCode};
use std::fmt;
use std::str::FromStr;

/// Request scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain text.
    Http,
    /// TLS.
    Https,
}

impl Scheme {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// Port used when an authority has none.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("http") {
            Ok(Scheme::Http)
        } else if s.eq_ignore_ascii_case("https") {
            Ok(Scheme::Https)
        } else {
            Err(Error::User(format!("Unsupported scheme: {}", s)))
        }
    }
}

/// Ordered mapping of header name to an ordered sequence of values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(HeaderName, Vec<HeaderValue>)>,
}

/// Trailers sent after a request body.
pub type RequestTrailers = HeaderList;

/// Trailers received after a response body.
pub type ResponseTrailers = HeaderList;

impl HeaderList {
    /// Empty list.
    pub fn new() -> Self {
        HeaderList::default()
    }

    /// Append a value, after any existing values of the same name.
    pub fn append(&mut self, name: HeaderName, value: HeaderValue) {
        if let Some((_, values)) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            values.push(value);
        } else {
            self.entries.push((name, vec![value]));
        }
    }

    /// Replace all values of a name, keeping its position.
    pub fn set(&mut self, name: HeaderName, value: HeaderValue) {
        if let Some((_, values)) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            *values = vec![value];
        } else {
            self.entries.push((name, vec![value]));
        }
    }

    /// Validate and append a header given as strings.
    pub fn try_append(&mut self, name: &str, value: &str) -> Result<(), Error> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.append(name, value);
        Ok(())
    }

    /// Builder flavor of `try_append`.
    pub fn with(mut self, name: &str, value: &str) -> Result<Self, Error> {
        self.try_append(name, value)?;
        Ok(self)
    }

    /// Remove a header, returning its values.
    pub fn remove(&mut self, name: &str) -> Option<Vec<HeaderValue>> {
        let idx = self.position(name)?;
        Some(self.entries.remove(idx).1)
    }

    /// Whether the header is present. Names compare case insensitively.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// First value of a header.
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.get_all(name).first()
    }

    /// First value of a header, ignoring values that aren't visible ASCII.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }

    /// All values of a header in the order they were added.
    pub fn get_all(&self, name: &str) -> &[HeaderValue] {
        match self.position(name) {
            Some(idx) => &self.entries[idx].1,
            None => &[],
        }
    }

    /// Names with their values, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &[HeaderValue])> {
        self.entries.iter().map(|(n, v)| (n, v.as_slice()))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convert to an `http::HeaderMap`, keeping value order per name.
    pub fn to_header_map(&self) -> http::HeaderMap {
        let mut map = http::HeaderMap::new();
        for (name, values) in &self.entries {
            for v in values {
                map.append(name.clone(), v.clone());
            }
        }
        map
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(n, _)| n.as_str().eq_ignore_ascii_case(name))
    }
}

impl From<&http::HeaderMap> for HeaderList {
    fn from(map: &http::HeaderMap) -> Self {
        let mut list = HeaderList::new();
        for (name, value) in map {
            list.append(name.clone(), value.clone());
        }
        list
    }
}

/// Immutable request headers, including the derived request line fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    method: Method,
    scheme: Scheme,
    authority: Authority,
    path: PathAndQuery,
    headers: HeaderList,
}

impl RequestHeaders {
    /// Request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host and optional port.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Path and query.
    pub fn path(&self) -> &PathAndQuery {
        &self.path
    }

    /// Headers besides the request line fields.
    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    /// Where this request is going.
    pub fn target(&self) -> crate::transport::Target {
        crate::transport::Target::new(self.scheme, self.authority.clone())
    }

    /// A builder prefilled with this request.
    pub fn to_builder(&self) -> RequestHeadersBuilder {
        RequestHeadersBuilder {
            method: self.method.clone(),
            scheme: self.scheme,
            authority: self.authority.as_str().to_string(),
            path: self.path.as_str().to_string(),
            headers: self.headers.clone(),
            pending: vec![],
        }
    }

    /// Convert to the `http` crate's representation.
    pub fn to_request(&self) -> Result<http::Request<()>, Error> {
        let uri = http::Uri::builder()
            .scheme(self.scheme.as_str())
            .authority(self.authority.clone())
            .path_and_query(self.path.clone())
            .build()?;

        let mut req = http::Request::builder()
            .method(self.method.clone())
            .uri(uri)
            .body(())?;

        *req.headers_mut() = self.headers.to_header_map();

        Ok(req)
    }
}

/// Builder of [`RequestHeaders`].
///
/// Method, scheme, authority and path are required up front. Validation of
/// authority, path and headers happens in `build()`.
#[derive(Debug, Clone)]
pub struct RequestHeadersBuilder {
    method: Method,
    scheme: Scheme,
    authority: String,
    path: String,
    headers: HeaderList,
    /// Headers given as strings, validated on build.
    pending: Vec<(String, String)>,
}

impl RequestHeadersBuilder {
    /// Builder for a request to `scheme://authority/path`.
    pub fn new(method: Method, scheme: Scheme, authority: &str, path: &str) -> Self {
        RequestHeadersBuilder {
            method,
            scheme,
            authority: authority.to_string(),
            path: path.to_string(),
            headers: HeaderList::new(),
            pending: vec![],
        }
    }

    /// Replace the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Replace the scheme.
    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Replace the authority.
    pub fn authority(mut self, authority: &str) -> Self {
        self.authority = authority.to_string();
        self
    }

    /// Replace path and query.
    pub fn path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// Append a header value.
    pub fn add(mut self, name: &str, value: &str) -> Self {
        self.pending.push((name.to_string(), value.to_string()));
        self
    }

    /// Remove all values of a header.
    pub fn remove(mut self, name: &str) -> Self {
        self.headers.remove(name);
        self.pending.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self
    }

    /// Validate and build the headers.
    ///
    /// Fails with `Error::User` for non standard methods, an empty authority
    /// or a path not starting with `/`, and with `Error::Http` for invalid
    /// names or values.
    pub fn build(self) -> Result<RequestHeaders, Error> {
        let standard = [
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::CONNECT,
            Method::OPTIONS,
            Method::TRACE,
            Method::PATCH,
        ];

        if !standard.contains(&self.method) {
            return Err(Error::User(format!(
                "Not a standard request method: {}",
                self.method
            )));
        }

        if self.authority.is_empty() {
            return Err(Error::User("Request authority is required".into()));
        }

        if !self.path.starts_with('/') {
            return Err(Error::User(format!(
                "Request path must start with '/': {}",
                self.path
            )));
        }

        let authority: Authority = self.authority.parse()?;
        let path: PathAndQuery = self.path.parse()?;

        let mut headers = self.headers;
        for (name, value) in &self.pending {
            headers.try_append(name, value)?;
        }

        Ok(RequestHeaders {
            method: self.method,
            scheme: self.scheme,
            authority,
            path,
            headers,
        })
    }
}

/// Immutable response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeaders {
    status: StatusCode,
    headers: HeaderList,
}

impl ResponseHeaders {
    /// Response with no headers besides the status.
    pub fn new(status: StatusCode) -> Self {
        ResponseHeaders {
            status,
            headers: HeaderList::new(),
        }
    }

    /// Response with status and headers.
    pub fn with_headers(status: StatusCode, headers: HeaderList) -> Self {
        ResponseHeaders { status, headers }
    }

    /// Status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Numeric status code.
    pub fn http_status(&self) -> u16 {
        self.status.as_u16()
    }

    /// Headers of the response.
    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    /// The `location` header, if present and readable.
    pub fn location(&self) -> Option<&str> {
        self.headers.get_str("location")
    }
}

impl From<&http::response::Parts> for ResponseHeaders {
    fn from(parts: &http::response::Parts) -> Self {
        ResponseHeaders {
            status: parts.status,
            headers: (&parts.headers).into(),
        }
    }
}
