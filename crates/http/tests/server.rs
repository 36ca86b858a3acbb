use std::convert::Infallible;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{self, Sender};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body::{Body, Frame};
use http_body_util::{BodyExt, Full};
use indoc::indoc;
use strand_http::protocol::status_head;
use strand_http::{
    BytesProducer, HttpError, HttpServer, IncomingBody, RequestBody, RequestHandler, RequestHead, ResponseSink,
    TransactionObserver, collect_body, make_handler,
};
use strand_net::{ConnectionId, Scheduler};

const TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    scheduler: Scheduler,
    server: HttpServer,
}

impl TestServer {
    fn start(handler: impl RequestHandler + 'static) -> Self {
        let scheduler = Scheduler::builder().build().unwrap();
        scheduler.start().unwrap();
        let server = HttpServer::builder().address("127.0.0.1:0").handler(handler).build(scheduler.handle()).unwrap();
        Self { scheduler, server }
    }

    fn addr(&self) -> SocketAddr {
        self.server.local_addr().unwrap()
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr()).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream
    }

    /// Sends `request`, half-closes and reads until the server closes.
    fn exchange(&self, request: &str) -> String {
        let mut stream = self.connect();
        stream.write_all(request.as_bytes()).unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.scheduler.dispose();
    }
}

/// Reads until `needle` has been seen `times` times.
fn read_until(stream: &mut TcpStream, needle: &str, times: usize) -> String {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    while String::from_utf8_lossy(&received).matches(needle).count() < times {
        let n = stream.read(&mut buf).unwrap();
        assert_ne!(n, 0, "connection closed early: {}", String::from_utf8_lossy(&received));
        received.extend_from_slice(&buf[..n]);
    }
    String::from_utf8(received).unwrap()
}

/// Polls `condition` until it holds or the timeout passes.
fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    true
}

fn text(body: &'static str) -> impl Fn(RequestHead, RequestBody, ResponseSink) + Send + Sync {
    move |_head, _body, response| {
        let head = Response::builder().header("content-length", body.len()).body(()).unwrap();
        response.respond(head).unwrap();
        response.write_body(BytesProducer::new(body)).unwrap();
        response.end().unwrap();
    }
}

fn path_echo(head: RequestHead, _body: RequestBody, response: ResponseSink) {
    let path = head.uri().path().to_string();
    let head = Response::builder().header("content-length", path.len()).body(()).unwrap();
    response.respond(head).unwrap();
    response.write_body(BytesProducer::new(path)).unwrap();
    response.end().unwrap();
}

#[test]
fn keep_alive_serves_several_requests() {
    let server = TestServer::start(path_echo);
    let mut stream = server.connect();

    stream.write_all(b"GET /first HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
    let first = read_until(&mut stream, "/first", 1);
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(first.contains("content-length: 6\r\n"));
    assert!(first.contains("server: strand\r\n"));
    assert!(first.contains("date: "));

    stream.write_all(b"GET /second HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
    let second = read_until(&mut stream, "/second", 1);
    assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn pipelined_responses_keep_request_order() {
    let server = TestServer::start(|head: RequestHead, _body: RequestBody, response: ResponseSink| {
        let path = head.uri().path().to_string();
        let delay = if path == "/slow" { Duration::from_millis(200) } else { Duration::ZERO };
        let scheduler = response.scheduler().clone();
        scheduler.post_after(delay, move || {
            let head = Response::builder().header("content-length", path.len()).body(()).unwrap();
            response.respond(head).unwrap();
            response.write_body(BytesProducer::new(path)).unwrap();
            response.end().unwrap();
        });
    });

    let response = server.exchange(indoc! {"
        GET /slow HTTP/1.1\r
        Host: localhost\r
        \r
        GET /fast HTTP/1.1\r
        Host: localhost\r
        \r
    "});

    let slow = response.find("/slow").unwrap();
    let fast = response.find("/fast").unwrap();
    assert!(slow < fast, "responses out of order: {response}");
    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);
}

#[test]
fn chunked_response_without_length() {
    let server = TestServer::start(|_head: RequestHead, _body: RequestBody, response: ResponseSink| {
        response.respond(status_head(StatusCode::OK)).unwrap();
        response.write_body(BytesProducer::new("hello")).unwrap();
        response.write_body(BytesProducer::new(" world")).unwrap();
        response.end().unwrap();
    });

    let response = server.exchange("GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert!(response.contains("transfer-encoding: chunked\r\n"));
    assert!(response.ends_with("5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"), "{response}");
}

#[test]
fn http10_closes_after_response() {
    let server = TestServer::start(text("bye"));
    let mut stream = server.connect();

    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(response.contains("connection: close\r\n"));
    assert!(response.ends_with("\r\n\r\nbye"));
}

#[test]
fn http10_without_length_is_delimited_by_close() {
    let server = TestServer::start(|_head: RequestHead, _body: RequestBody, response: ResponseSink| {
        response.respond(status_head(StatusCode::OK)).unwrap();
        response.write_body(BytesProducer::new("streamed")).unwrap();
        response.end().unwrap();
    });

    let response = server.exchange("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");

    assert!(!response.contains("content-length"));
    assert!(response.contains("connection: close\r\n"));
    assert!(response.ends_with("\r\n\r\nstreamed"));
}

#[test]
fn request_body_is_collected() {
    let server = TestServer::start(|_head: RequestHead, body: RequestBody, response: ResponseSink| {
        let _subscription = collect_body(body, move |collected| {
            let data = collected.unwrap();
            let head = Response::builder().header("content-length", data.len()).body(()).unwrap();
            response.respond(head).unwrap();
            response.write_body(BytesProducer::new(data)).unwrap();
            response.end().unwrap();
        });
    });

    let response = server.exchange(indoc! {"
        POST /echo HTTP/1.1\r
        Host: localhost\r
        Transfer-Encoding: chunked\r
        \r
        5\r
        hello\r
        6\r
         world\r
        0\r
        \r
    "});

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("\r\n\r\nhello world"), "{response}");
}

#[test]
fn expect_continue_is_answered_by_the_handler() {
    let server = TestServer::start(|_head: RequestHead, body: RequestBody, response: ResponseSink| {
        if response.expects_continue() {
            response.write_continue().unwrap();
        }
        let _subscription = collect_body(body, move |collected| {
            let data = collected.unwrap();
            let head = Response::builder().header("content-length", data.len()).body(()).unwrap();
            response.respond(head).unwrap();
            response.write_body(BytesProducer::new(data)).unwrap();
            response.end().unwrap();
        });
    });
    let mut stream = server.connect();

    let request = b"POST /up HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n";
    stream.write_all(request).unwrap();
    let interim = read_until(&mut stream, "\r\n\r\n", 1);
    assert_eq!(interim, "HTTP/1.1 100 Continue\r\n\r\n");

    stream.write_all(b"data").unwrap();
    let response = read_until(&mut stream, "data", 1);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn malformed_request_gets_400_and_close() {
    let server = TestServer::start(text("unused"));
    let mut stream = server.connect();

    stream.write_all(b"THIS IS NOT HTTP AT ALL\r\n\r\n").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(response.contains("connection: close\r\n"));
}

#[test]
fn responses_before_a_malformed_request_are_kept() {
    let server = TestServer::start(path_echo);

    let response = server.exchange("GET /ok HTTP/1.1\r\nHost: localhost\r\n\r\nBROKEN\r\n\r\n");

    let ok = response.find("HTTP/1.1 200 OK").unwrap();
    let bad = response.find("HTTP/1.1 400 Bad Request").unwrap();
    assert!(ok < bad);
}

#[test]
fn panicking_handler_gets_500() {
    let server = TestServer::start(|_head: RequestHead, _body: RequestBody, _response: ResponseSink| {
        panic!("handler blew up");
    });

    let response = server.exchange("GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{response}");
}

#[test]
fn head_response_has_no_body() {
    let server = TestServer::start(text("invisible"));

    let response = server.exchange("HEAD / HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert!(response.contains("content-length: 9\r\n"));
    assert!(response.ends_with("\r\n\r\n"));
}

async fn echo(request: http::Request<IncomingBody>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = request.method().clone();
    let data = request.into_body().collect().await.map(|collected| collected.to_bytes()).unwrap_or_default();
    let body = format!("{method}:{}", String::from_utf8_lossy(&data));
    Ok(Response::new(Full::new(Bytes::from(body))))
}

#[test]
fn async_handler_round_trip() {
    let server = TestServer::start(make_handler(echo));

    let response = server.exchange(indoc! {"
        PUT /async HTTP/1.1\r
        Host: localhost\r
        Content-Length: 7\r
        \r
        payload"});

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("content-length: 11\r\n"));
    assert!(response.ends_with("PUT:payload"), "{response}");
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Observed {
    Next(u64),
    Error(String),
    Completed,
}

struct Recorder {
    events: Mutex<Sender<Observed>>,
}

impl TransactionObserver for Recorder {
    fn on_next(&self, _connection: ConnectionId, response: &ResponseSink) {
        let _ = self.events.lock().unwrap().send(Observed::Next(response.transaction_id()));
    }

    fn on_error(&self, _connection: ConnectionId, error: &HttpError) {
        let _ = self.events.lock().unwrap().send(Observed::Error(error.to_string()));
    }

    fn on_completed(&self, _connection: ConnectionId) {
        let _ = self.events.lock().unwrap().send(Observed::Completed);
    }
}

fn observed_server() -> (Scheduler, HttpServer, mpsc::Receiver<Observed>) {
    let (tx, rx) = mpsc::channel();
    let scheduler = Scheduler::builder().build().unwrap();
    scheduler.start().unwrap();
    let server = HttpServer::builder()
        .address("127.0.0.1:0")
        .handler(path_echo)
        .observer(Recorder { events: Mutex::new(tx) })
        .build(scheduler.handle())
        .unwrap();
    (scheduler, server, rx)
}

#[test]
fn observer_follows_transactions() {
    let (scheduler, server, rx) = observed_server();

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream.write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    let first = rx.recv_timeout(TIMEOUT).unwrap();
    let second = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!((&first, &second), (Observed::Next(a), Observed::Next(b)) if a < b));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Observed::Completed);

    scheduler.dispose();
}

#[test]
fn observer_sees_the_parse_error() {
    let (scheduler, server, rx) = observed_server();

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream.write_all(b"NOT A REQUEST LINE\r\n\r\n").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert!(matches!(rx.recv_timeout(TIMEOUT).unwrap(), Observed::Error(_)));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err_and(|e| e == mpsc::RecvTimeoutError::Timeout));

    scheduler.dispose();
}

#[test]
fn close_ends_idle_connections_and_notifies() {
    let (tx, rx) = mpsc::channel();
    let scheduler = Scheduler::builder().build().unwrap();
    scheduler.start().unwrap();
    let server = HttpServer::builder()
        .address("127.0.0.1:0")
        .handler(path_echo)
        .on_closed(move || {
            let _ = tx.send(());
        })
        .build(scheduler.handle())
        .unwrap();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream.write_all(b"GET /before HTTP/1.1\r\n\r\n").unwrap();
    let _ = read_until(&mut stream, "/before", 1);

    server.close();

    // the server half-closes; the connection is gone once we close too
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    drop(stream);

    rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(server.live_connections(), 0);

    scheduler.dispose();
}

#[test]
fn close_finishes_transactions_in_flight() {
    let pending: Arc<Mutex<Option<ResponseSink>>> = Arc::default();
    let parked = Arc::clone(&pending);

    let scheduler = Scheduler::builder().build().unwrap();
    scheduler.start().unwrap();
    let server = HttpServer::builder()
        .address("127.0.0.1:0")
        .handler(move |_head: RequestHead, _body: RequestBody, response: ResponseSink| {
            *parked.lock().unwrap() = Some(response);
        })
        .build(scheduler.handle())
        .unwrap();

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream.write_all(b"GET /late HTTP/1.1\r\n\r\n").unwrap();
    while pending.lock().unwrap().is_none() {
        std::thread::sleep(Duration::from_millis(10));
    }

    server.close();
    let response = pending.lock().unwrap().take().unwrap();
    let head = Response::builder().header("content-length", 4).body(()).unwrap();
    response.respond(head).unwrap();
    response.write_body(BytesProducer::new("late")).unwrap();
    response.end().unwrap();

    let mut received = String::new();
    stream.read_to_string(&mut received).unwrap();
    assert!(received.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(received.ends_with("late"));

    scheduler.dispose();
}

#[test]
fn requests_after_close_are_not_dispatched() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let server = TestServer::start(move |head: RequestHead, body: RequestBody, response: ResponseSink| {
        counted.fetch_add(1, Ordering::SeqCst);
        path_echo(head, body, response);
    });

    let mut stream = server.connect();
    stream.write_all(b"GET /before HTTP/1.1\r\n\r\n").unwrap();
    let _ = read_until(&mut stream, "/before", 1);

    server.server.close();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    // only the server's side is closed, so this still reaches it
    stream.write_all(b"GET /late HTTP/1.1\r\n\r\n").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();

    assert!(wait_for(|| server.server.live_connections() == 0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn announced_body_that_never_comes_gets_500() {
    let server = TestServer::start(|_head: RequestHead, _body: RequestBody, response: ResponseSink| {
        let head = Response::builder().header("content-length", 5).body(()).unwrap();
        response.respond(head).unwrap();
        response.end().unwrap();
    });

    let response = server.exchange("GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{response}");
    assert!(response.contains("connection: close\r\n"));
    assert_eq!(response.matches("HTTP/1.1").count(), 1);
}

/// Yields one chunk, then fails.
struct FailsAfter {
    chunk: Option<Bytes>,
}

impl Body for FailsAfter {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        Poll::Ready(Some(match self.chunk.take() {
            Some(chunk) => Ok(Frame::data(chunk)),
            None => Err(io::Error::other("source went away")),
        }))
    }
}

#[test]
fn failing_body_truncates_the_response_and_closes() {
    let server = TestServer::start(|_head: RequestHead, _body: RequestBody, response: ResponseSink| {
        response.send(Response::new(FailsAfter { chunk: Some(Bytes::from_static(b"partial")) })).unwrap();
    });

    let mut stream = server.connect();
    stream.write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("transfer-encoding: chunked\r\n"));
    assert!(response.ends_with("\r\n\r\n7\r\npartial\r\n"), "{response:?}");
    assert_eq!(response.matches("HTTP/1.1").count(), 1);
}
