use crate::headers::{RequestHeaders, ResponseHeaders, Scheme};
use crate::transport::{BodyFrame, Target};
use crate::Error;
use futures_channel::mpsc;
use http::{Method, StatusCode};
use url::Url;

/// Request body kept around to be replayed on a redirect target.
const MAX_REPLAY_BYTES: usize = 1024 * 1024;

/// Headers that must not follow a request to another origin.
const CROSS_ORIGIN_STRIP: &[&str] = &["authorization", "proxy-authorization", "cookie", "host"];

/// Headers describing a body that a 303 drops.
const BODY_HEADERS: &[&str] = &["content-length", "content-type", "transfer-encoding"];

pub(crate) fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// The request to issue in place of a redirected one.
#[derive(Debug)]
pub(crate) struct Redirect {
    pub request: RequestHeaders,
    /// The redirect turned the request into one without body.
    pub drop_body: bool,
}

/// Work out the follow-up request for a redirect response.
///
/// Errors describe why the redirect can't be followed, in which case the
/// redirect response itself is the final response.
pub(crate) fn follow(current: &RequestHeaders, res: &ResponseHeaders) -> Result<Redirect, String> {
    let location = res.location().ok_or("Missing location header")?;

    // fragments never go on the wire.
    let location = location.split('#').next().unwrap_or("");

    if location.is_empty() {
        return Err("Empty location header".into());
    }

    let (scheme, authority, path) = resolve(current, location)?;

    let drop_body = res.status() == StatusCode::SEE_OTHER && current.method() != Method::HEAD;

    let mut builder = current
        .to_builder()
        .scheme(scheme)
        .authority(&authority)
        .path(&path);

    if drop_body {
        builder = builder.method(Method::GET);
        for h in BODY_HEADERS {
            builder = builder.remove(h);
        }
    }

    let bad_location = |e: Error| format!("Bad location {:?}: {}", location, e);

    let mut request = builder.build().map_err(bad_location)?;

    if !same_origin(&current.target(), &request.target()) {
        let mut builder = request.to_builder();
        for h in CROSS_ORIGIN_STRIP {
            builder = builder.remove(h);
        }
        request = builder.build().map_err(bad_location)?;
    }

    Ok(Redirect { request, drop_body })
}

/// Resolve a location against the current request into (scheme, authority, path).
fn resolve(current: &RequestHeaders, location: &str) -> Result<(Scheme, String, String), String> {
    let base = format!(
        "{}://{}{}",
        current.scheme(),
        current.authority(),
        current.path()
    );
    let base = Url::parse(&base).map_err(|e| format!("Bad request url {}: {}", base, e))?;

    let next = base
        .join(location)
        .map_err(|e| format!("Bad location {:?}: {}", location, e))?;

    let scheme: Scheme = next
        .scheme()
        .parse()
        .map_err(|_| format!("Location with unsupported scheme: {}", location))?;

    let host = next
        .host_str()
        .ok_or_else(|| format!("Location without host: {}", location))?;

    let authority = match next.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let mut path = next.path().to_string();
    if let Some(query) = next.query() {
        path.push('?');
        path.push_str(query);
    }

    Ok((scheme, authority, path))
}

/// Same scheme, host and effective port.
fn same_origin(a: &Target, b: &Target) -> bool {
    a.scheme == b.scheme
        && a.authority.host().eq_ignore_ascii_case(b.authority.host())
        && a.port() == b.port()
}

/// Copy of the request body sent so far, for replaying on a new target.
#[derive(Debug, Default)]
pub(crate) struct ReplayBuffer {
    frames: Vec<BodyFrame>,
    bytes: usize,
    overflowed: bool,
}

impl ReplayBuffer {
    pub fn push(&mut self, frame: &BodyFrame) {
        if self.overflowed {
            return;
        }

        self.bytes += frame.len();

        if self.bytes > MAX_REPLAY_BYTES {
            self.overflowed = true;
            self.frames.clear();
        } else {
            self.frames.push(frame.clone());
        }
    }

    /// Whether the body sent so far can be sent again.
    pub fn can_replay(&self) -> bool {
        !self.overflowed
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.bytes = 0;
    }

    pub fn replay_into(&self, tx: &mpsc::UnboundedSender<BodyFrame>) {
        for frame in &self.frames {
            // receiver gone means the transport gave up on the body.
            if tx.unbounded_send(frame.clone()).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::headers::{HeaderList, RequestHeadersBuilder};

    fn req(method: Method, scheme: Scheme, path: &str) -> RequestHeaders {
        RequestHeadersBuilder::new(method, scheme, "api.example.com", path)
            .add("authorization", "secret")
            .add("content-type", "text/plain")
            .build()
            .unwrap()
    }

    fn res(status: u16, location: &str) -> ResponseHeaders {
        let headers = HeaderList::new().with("location", location).unwrap();
        ResponseHeaders::with_headers(StatusCode::from_u16(status).unwrap(), headers)
    }

    #[test]
    fn redirect_codes() {
        assert!(is_redirect(StatusCode::MOVED_PERMANENTLY));
        assert!(is_redirect(StatusCode::PERMANENT_REDIRECT));
        assert!(!is_redirect(StatusCode::NOT_MODIFIED));
        assert!(!is_redirect(StatusCode::OK));
    }

    #[test]
    fn http_to_https_same_authority() {
        let cur = req(Method::GET, Scheme::Http, "/ping");
        let r = follow(&cur, &res(301, "https://api.example.com/ping")).unwrap();

        assert_eq!(r.request.scheme(), Scheme::Https);
        assert_eq!(r.request.authority().as_str(), "api.example.com");
        assert_eq!(r.request.path().as_str(), "/ping");
        // scheme change is another origin.
        assert!(!r.request.headers().contains("authorization"));
        assert!(!r.drop_body);
    }

    #[test]
    fn absolute_path_keeps_origin_headers() {
        let cur = req(Method::GET, Scheme::Https, "/a/b");
        let r = follow(&cur, &res(302, "/c?x=1#frag")).unwrap();

        assert_eq!(r.request.path().as_str(), "/c?x=1");
        assert_eq!(r.request.headers().get_str("authorization"), Some("secret"));
    }

    #[test]
    fn relative_path() {
        let cur = req(Method::GET, Scheme::Https, "/a/b");
        let r = follow(&cur, &res(307, "c")).unwrap();

        assert_eq!(r.request.path().as_str(), "/a/c");
    }

    #[test]
    fn absolute_path_with_url_in_query() {
        let cur = req(Method::GET, Scheme::Https, "/a/b");
        let r = follow(&cur, &res(302, "/login?next=https://api.example.com/x")).unwrap();

        assert_eq!(r.request.scheme(), Scheme::Https);
        assert_eq!(r.request.authority().as_str(), "api.example.com");
        assert_eq!(
            r.request.path().as_str(),
            "/login?next=https://api.example.com/x"
        );
    }

    #[test]
    fn query_only() {
        let cur = req(Method::GET, Scheme::Https, "/a/b");
        let r = follow(&cur, &res(302, "?page=2")).unwrap();

        assert_eq!(r.request.path().as_str(), "/a/b?page=2");
    }

    #[test]
    fn dot_segments() {
        let cur = req(Method::GET, Scheme::Https, "/a/b");
        let r = follow(&cur, &res(302, "../c")).unwrap();

        assert_eq!(r.request.path().as_str(), "/c");
    }

    #[test]
    fn explicit_default_port_is_same_origin() {
        let cur = req(Method::GET, Scheme::Https, "/a");
        let r = follow(&cur, &res(302, "https://API.example.com:443/b")).unwrap();

        assert_eq!(r.request.authority().as_str(), "api.example.com");
        assert_eq!(r.request.headers().get_str("authorization"), Some("secret"));

        let r = follow(&cur, &res(302, "https://api.example.com:8443/b")).unwrap();

        assert_eq!(r.request.authority().as_str(), "api.example.com:8443");
        assert!(!r.request.headers().contains("authorization"));
    }

    #[test]
    fn scheme_relative() {
        let cur = req(Method::GET, Scheme::Https, "/a");
        let r = follow(&cur, &res(308, "//other.example.com")).unwrap();

        assert_eq!(r.request.scheme(), Scheme::Https);
        assert_eq!(r.request.authority().as_str(), "other.example.com");
        assert_eq!(r.request.path().as_str(), "/");
    }

    #[test]
    fn see_other_becomes_get() {
        let cur = req(Method::POST, Scheme::Https, "/form");
        let r = follow(&cur, &res(303, "/done")).unwrap();

        assert_eq!(r.request.method(), Method::GET);
        assert!(r.drop_body);
        assert!(!r.request.headers().contains("content-type"));
    }

    #[test]
    fn temporary_redirect_keeps_method() {
        let cur = req(Method::POST, Scheme::Https, "/form");
        let r = follow(&cur, &res(307, "/other")).unwrap();

        assert_eq!(r.request.method(), Method::POST);
        assert!(!r.drop_body);
    }

    #[test]
    fn unfollowable_locations() {
        let cur = req(Method::GET, Scheme::Https, "/a");

        let no_loc = ResponseHeaders::new(StatusCode::FOUND);
        assert!(follow(&cur, &no_loc).is_err());
        assert!(follow(&cur, &res(302, "ftp://files.example.com/x")).is_err());
        assert!(follow(&cur, &res(302, "#only-fragment")).is_err());
    }

    #[test]
    fn replay_buffer_overflow() {
        let mut buf = ReplayBuffer::default();

        buf.push(&BodyFrame::Data {
            data: vec![0; 10],
            end_stream: false,
        });
        assert!(buf.can_replay());

        buf.push(&BodyFrame::Data {
            data: vec![0; MAX_REPLAY_BYTES],
            end_stream: true,
        });
        assert!(!buf.can_replay());
    }
}
