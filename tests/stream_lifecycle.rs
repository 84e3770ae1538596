use hreq_engine::mem::{MemTransport, Script};
use hreq_engine::{Error, HeaderList, RequestHeadersBuilder, ResponseHeaders, Scheme};
use hreq_engine::{RequestHeaders, Stream, StreamIntel, StreamState};
use http::{Method, StatusCode};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

mod common;
use common::{Event, Recorder};

const HOST: &str = "api.example.com";

fn get(path: &str) -> Result<RequestHeaders, Error> {
    RequestHeadersBuilder::new(Method::GET, Scheme::Https, HOST, path).build()
}

#[test]
fn headers_data_trailers_complete() -> Result<(), Error> {
    let transport = MemTransport::new().route(Scheme::Https, HOST, |_| {
        let trailers = HeaderList::new().with("grpc-status", "0").unwrap();
        Script::new()
            .headers(ResponseHeaders::new(StatusCode::OK), false)
            .data("hello ", false)
            .data("world", false)
            .trailers(trailers)
    });
    let engine = common::engine(&transport);

    let rec = Recorder::new();
    let stream = rec
        .attach(engine.stream_client().new_stream_prototype())
        .start()?;
    stream.send_headers(get("/stream")?, true)?;

    let events = rec.wait_terminal();
    common::assert_well_formed(&events);

    assert_eq!(
        events,
        vec![
            Event::Headers(200, false),
            Event::Data(b"hello ".to_vec(), false),
            Event::Data(b"world".to_vec(), false),
            Event::Trailers(vec![("grpc-status".into(), "0".into())]),
            Event::Complete,
        ]
    );
    assert_eq!(stream.state(), StreamState::Closed);

    Ok(())
}

#[test]
fn headers_only_response() -> Result<(), Error> {
    let transport =
        MemTransport::new().route(Scheme::Https, HOST, |_| Script::ok(""));
    let engine = common::engine(&transport);

    let rec = Recorder::new();
    rec.attach(engine.stream_client().new_stream_prototype())
        .start()?
        .send_headers(get("/")?, true)?;

    let events = rec.wait_terminal();
    common::assert_well_formed(&events);
    assert_eq!(events, vec![Event::Headers(200, true), Event::Complete]);

    Ok(())
}

#[test]
fn no_callbacks_after_terminal() -> Result<(), Error> {
    let transport = MemTransport::new().route(Scheme::Https, HOST, |_| {
        // NB: events after end of stream must never reach the callbacks.
        Script::ok("done")
            .data("late", false)
            .close()
    });
    let engine = common::engine(&transport);

    let rec = Recorder::new();
    rec.attach(engine.stream_client().new_stream_prototype())
        .start()?
        .send_headers(get("/")?, true)?;

    let events = rec.wait_terminal();
    thread::sleep(Duration::from_millis(100));

    assert_eq!(rec.events(), events);
    assert_eq!(
        events,
        vec![
            Event::Headers(200, false),
            Event::Data(b"done".to_vec(), true),
            Event::Complete
        ]
    );

    Ok(())
}

#[test]
fn data_buffer_borrowed_per_call() -> Result<(), Error> {
    let transport = MemTransport::new().route(Scheme::Https, HOST, |_| {
        Script::new()
            .headers(ResponseHeaders::new(StatusCode::OK), false)
            .data("abc", false)
            .data("def", true)
    });
    let engine = common::engine(&transport);

    let body = Arc::new(Mutex::new(Vec::new()));
    let body2 = body.clone();
    let rec = Recorder::new();

    // data callback copies what it needs out of the borrowed chunk.
    rec.attach(engine.stream_client().new_stream_prototype())
        .set_on_response_data(move |chunk, _, intel| {
            body2.lock().unwrap().extend_from_slice(chunk);
            assert!(intel.received_byte_count >= chunk.len() as u64);
        })
        .start()?
        .send_headers(get("/")?, true)?;

    rec.wait_terminal();
    assert_eq!(&*body.lock().unwrap(), b"abcdef");

    Ok(())
}

#[test]
fn request_body_and_trailers() -> Result<(), Error> {
    let transport = MemTransport::new().route(Scheme::Https, HOST, |req| {
        assert_eq!(req.headers.method(), &Method::POST);
        Script::ok(req.body.clone())
    });
    let engine = common::engine(&transport);

    let headers = RequestHeadersBuilder::new(Method::POST, Scheme::Https, HOST, "/echo")
        .add("content-type", "text/plain")
        .build()?;

    let rec = Recorder::new();
    let stream = rec
        .attach(engine.stream_client().new_stream_prototype())
        .start()?;

    stream.send_headers(headers, false)?;
    assert_eq!(stream.state(), StreamState::Open);

    stream.send_data(b"HELLO ", false)?;
    stream.send_data(b"WORLD", false)?;
    stream.send_trailers(HeaderList::new().with("x-checksum", "abc")?)?;
    assert_eq!(stream.state(), StreamState::HalfClosedLocal);

    let events = rec.wait_terminal();
    common::assert_well_formed(&events);
    assert_eq!(events[1], Event::Data(b"HELLO WORLD".to_vec(), true));

    let reqs = transport.requests();
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].body, b"HELLO WORLD");
    assert_eq!(
        reqs[0].trailers.as_ref().and_then(|t| t.get_str("x-checksum")),
        Some("abc")
    );
    assert_eq!(reqs[0].headers.headers().get_str("content-type"), Some("text/plain"));

    Ok(())
}

#[test]
fn half_closed_remote_until_request_ends() -> Result<(), Error> {
    let transport =
        MemTransport::new().route_early(Scheme::Https, HOST, |_| Script::ok("early"));
    let engine = common::engine(&transport);

    let rec = Recorder::new();
    let stream = rec
        .attach(engine.stream_client().new_stream_prototype())
        .start()?;

    stream.send_headers(get("/upload")?, false)?;
    stream.send_data(b"part", false)?;

    rec.wait_for(|evs| evs.contains(&Event::Data(b"early".to_vec(), true)));
    wait_state(&stream, StreamState::HalfClosedRemote);

    // response is done, but no terminal event until the request ends.
    assert_eq!(rec.events().len(), 2);

    stream.send_data(b"rest", true)?;

    let events = rec.wait_terminal();
    common::assert_well_formed(&events);
    assert_eq!(events.last(), Some(&Event::Complete));
    assert_eq!(stream.state(), StreamState::Closed);

    Ok(())
}

fn wait_state(stream: &Stream, state: StreamState) {
    let start = Instant::now();
    while stream.state() != state {
        assert!(start.elapsed() < common::WAIT, "Timeout waiting for {:?}", state);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn dropped_handle_before_request_end_cancels() -> Result<(), Error> {
    let transport = MemTransport::new().route(Scheme::Https, HOST, |_| Script::ok("x"));
    let engine = common::engine(&transport);

    let rec = Recorder::new();
    let stream = rec
        .attach(engine.stream_client().new_stream_prototype())
        .start()?;
    drop(stream);

    assert_eq!(rec.wait_terminal(), vec![Event::Cancel]);

    let rec = Recorder::new();
    let stream = rec
        .attach(engine.stream_client().new_stream_prototype())
        .start()?;
    stream.send_headers(get("/")?, false)?;
    stream.send_data(b"half", false)?;
    drop(stream);

    assert_eq!(rec.wait_terminal(), vec![Event::Cancel]);
    assert!(transport.requests().is_empty());

    Ok(())
}

#[test]
fn dropped_handle_after_request_end_completes() -> Result<(), Error> {
    let transport = MemTransport::new().route(Scheme::Https, HOST, |_| Script::ok("x"));
    let engine = common::engine(&transport);

    let rec = Recorder::new();
    let stream = rec
        .attach(engine.stream_client().new_stream_prototype())
        .start()?;
    stream.send_headers(get("/")?, true)?;
    drop(stream);

    let events = rec.wait_terminal();
    assert_eq!(events.last(), Some(&Event::Complete));

    Ok(())
}

#[test]
fn usage_errors() -> Result<(), Error> {
    let transport = MemTransport::new().route(Scheme::Https, HOST, |_| Script::new().hang());
    let engine = common::engine(&transport);

    let rec = Recorder::new();
    let stream = rec
        .attach(engine.stream_client().new_stream_prototype())
        .start()?;

    let err = stream.send_data(b"too soon", false).expect_err("data before headers");
    assert!(matches!(err, Error::User(_)));

    stream.send_headers(get("/")?, true)?;

    let err = stream.send_headers(get("/")?, true).expect_err("headers twice");
    assert_eq!(err.to_string(), "Request headers already sent");

    let err = stream.send_data(b"x", true).expect_err("data after end");
    assert_eq!(err.to_string(), "Request body is not expected");

    stream.cancel();
    assert_eq!(rec.wait_terminal(), vec![Event::Cancel]);
    assert_eq!(stream.state(), StreamState::Cancelled);

    let err = stream.send_trailers(HeaderList::new()).expect_err("closed");
    assert!(matches!(err, Error::StreamClosed));

    Ok(())
}

#[test]
fn invalid_request_headers() {
    let res = RequestHeadersBuilder::new(Method::GET, Scheme::Https, HOST, "no-slash").build();
    assert!(res.is_err());

    let res = RequestHeadersBuilder::new(Method::GET, Scheme::Https, "", "/").build();
    assert!(res.is_err());

    let res = RequestHeadersBuilder::new(Method::GET, Scheme::Https, HOST, "/")
        .add("bad header", "x")
        .build();
    assert!(matches!(res, Err(Error::Http(_))));

    let custom = Method::from_bytes(b"BREW").unwrap();
    let res = RequestHeadersBuilder::new(custom, Scheme::Https, HOST, "/").build();
    assert!(matches!(res, Err(Error::User(_))));
}

#[test]
fn repeated_headers_keep_order() -> Result<(), Error> {
    let headers = RequestHeadersBuilder::new(Method::GET, Scheme::Https, HOST, "/")
        .add("x-b", "1")
        .add("x-a", "2")
        .add("x-b", "3")
        .build()?;

    let names: Vec<_> = headers.headers().iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["x-b", "x-a"]);

    let values: Vec<_> = headers
        .headers()
        .get_all("X-B")
        .iter()
        .map(|v| v.to_str().unwrap())
        .collect();
    assert_eq!(values, vec!["1", "3"]);

    let req = headers.to_request()?;
    assert_eq!(req.uri().to_string(), "https://api.example.com/");

    Ok(())
}

#[test]
fn response_headers_from_http_parts() -> Result<(), Error> {
    let (parts, _) = http::Response::builder()
        .status(StatusCode::CREATED)
        .header("location", "/items/7")
        .header("set-cookie", "a=1")
        .header("set-cookie", "b=2")
        .body(())?
        .into_parts();
    let headers = ResponseHeaders::from(&parts);

    assert_eq!(headers.http_status(), 201);
    assert_eq!(headers.location(), Some("/items/7"));
    assert_eq!(headers.headers().get_all("set-cookie").len(), 2);

    // a transport answering with converted parts.
    let transport = MemTransport::new().route(Scheme::Https, HOST, move |_| {
        Script::new().headers(headers.clone(), true)
    });
    let engine = common::engine(&transport);

    let location = Arc::new(Mutex::new(None));
    let location2 = location.clone();
    let rec = Recorder::new();
    rec.attach(engine.stream_client().new_stream_prototype())
        .set_on_response_headers(move |h, _, _| {
            *location2.lock().unwrap() = h.location().map(|l| l.to_string());
        })
        .start()?
        .send_headers(get("/items")?, true)?;

    assert_eq!(rec.wait_terminal(), vec![Event::Complete]);
    assert_eq!(location.lock().unwrap().as_deref(), Some("/items/7"));

    Ok(())
}

#[test]
fn streams_get_unique_ids_and_intel() -> Result<(), Error> {
    let transport = MemTransport::new().route(Scheme::Https, HOST, |_| Script::ok("four"));
    let engine = common::engine(&transport);
    let client = engine.stream_client();

    let intel = Arc::new(Mutex::new(None));
    let intel2 = intel.clone();
    let rec = Recorder::new();

    let s1 = client.new_stream_prototype().start()?;
    let s2 = rec
        .attach(client.new_stream_prototype())
        .set_on_complete(move |i| *intel2.lock().unwrap() = Some(i.clone()))
        .start()?;
    assert_ne!(s1.id(), s2.id());

    s2.send_headers(get("/")?, true)?;

    // on_complete was replaced, so wait for the data event instead.
    rec.wait_for(|evs| evs.iter().any(|e| matches!(e, Event::Data(_, true))));

    let start = Instant::now();
    let intel: StreamIntel = loop {
        if let Some(i) = intel.lock().unwrap().clone() {
            break i;
        }
        assert!(start.elapsed() < common::WAIT, "Timeout waiting for complete");
        thread::sleep(Duration::from_millis(5));
    };

    assert_eq!(intel.stream_id, s2.id());
    assert_eq!(intel.attempt_count, 1);
    assert_eq!(intel.redirect_count, 0);
    assert_eq!(intel.received_byte_count, 4);
    assert!(intel.connection_id.is_some());

    Ok(())
}
