//! Per-client HTTP state machine.
//!
//! ```text
//! Init -> Reading -> Parsing -> Wait -> Send -> Flush -> Dispose
//!            |          |         |       |       |
//!            +----------+---------+-------+-------+--> Failed / Timeout -> Dispose
//! ```
//!
//! Every step runs as far as it can without blocking and yields on the first
//! "would block". There is no keep-alive: once a response is out, the
//! connection closes. A response is only ever queued from `Wait`, whether
//! it comes from the connection itself or from a backend task.
//!
//! A connection whose backend task is still running stays in the scheduler
//! after `Dispose` (with its transport already closed) until the backend is
//! gone, so a backend never posts to a recycled task.

use std::sync::Arc;
use std::task::Poll;

use tracing::{debug, info, warn};

use crate::backend::BackendTask;
use crate::config::ServerConfig;
use crate::context::{ServerContext, TaskContext};
use crate::handler::{self, Dispatch, Middleware, responses};
use crate::http::parser::{HEADER_SENTINEL, ParseOptions, find_sentinel, parse_request};
use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;
use crate::http::status::HttpStatus;
use crate::net::buffer::ResponseBytes;
use crate::net::transport::{ReadOutcome, Transport, WriteOutcome};
use crate::runtime::{Step, Task, TaskId};

/// Per-connection limits, shared by every connection of a listener.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub timeout_ms: u64,
    pub parse: ParseOptions,
    pub middleware: Middleware,
}

impl ConnectionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            read_buffer_size: config.read_buffer_size,
            write_buffer_size: config.write_buffer_size,
            timeout_ms: config.connection_timeout_ms(),
            parse: ParseOptions {
                max_url_len: config.max_url_size,
                strict: config.strict_protocol,
            },
            middleware: Middleware::from_config(config),
        }
    }
}

#[derive(Debug)]
enum State {
    Init,
    Reading,
    Parsing,
    /// No response yet. `backend` is the task producing it, if any.
    Wait { backend: Option<TaskId> },
    Send { out: ResponseBytes },
    /// Response handed to the transport; waiting for it to leave.
    Flush,
    Failed,
    Timeout,
    Dispose,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Init => "init",
            State::Reading => "reading",
            State::Parsing => "parsing",
            State::Wait { .. } => "wait",
            State::Send { .. } => "send",
            State::Flush => "flush",
            State::Failed => "failed",
            State::Timeout => "timeout",
            State::Dispose => "dispose",
        }
    }
}

enum Flow {
    Continue,
    Yield,
    Finished,
}

pub struct ConnectionTask {
    transport: Box<dyn Transport>,
    settings: Arc<ConnectionSettings>,
    state: State,

    read_buf: Vec<u8>,
    filled: usize,

    started: u64,
    request: Option<HttpRequest>,
    backend: Option<TaskId>,

    status: Option<HttpStatus>,
    bytes_sent: usize,
    closed: bool,
}

impl ConnectionTask {
    pub fn new(transport: Box<dyn Transport>, settings: Arc<ConnectionSettings>) -> Self {
        let read_buf = vec![0; settings.read_buffer_size];
        Self {
            transport,
            settings,
            state: State::Init,
            read_buf,
            filled: 0,
            started: 0,
            request: None,
            backend: None,
            status: None,
            bytes_sent: 0,
            closed: false,
        }
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// Queues `res` for sending. A no-op unless the connection is in `Wait`,
    /// so a late or duplicate response cannot replace one already in flight.
    pub fn send_response(&mut self, mut res: HttpResponse) -> bool {
        if !matches!(self.state, State::Wait { .. }) {
            debug!(
                state = self.state.name(),
                status = res.status.code(),
                "response ignored"
            );
            return false;
        }
        self.settings.middleware.apply(self.request.as_ref(), &mut res);

        let mut out = ResponseBytes::with_capacity(self.settings.write_buffer_size);
        out.append(&res.to_bytes());
        self.status = Some(res.status);
        self.state = State::Send { out };
        true
    }

    fn respond(&mut self, res: HttpResponse) {
        self.state = State::Wait { backend: None };
        self.send_response(res);
    }

    fn is_timed_out(&self, now: u64) -> bool {
        let running = matches!(
            self.state,
            State::Reading | State::Parsing | State::Wait { .. } | State::Send { .. } | State::Flush
        );
        running && now.saturating_sub(self.started) >= self.settings.timeout_ms
    }

    fn advance(&mut self, cx: &mut TaskContext<'_>) -> Flow {
        if self.is_timed_out(cx.now()) {
            self.state = State::Timeout;
        }

        match self.state {
            State::Init => {
                self.started = cx.now();
                self.state = State::Reading;
                Flow::Continue
            }
            State::Reading => self.read(),
            State::Parsing => self.parse(cx),
            State::Wait { backend } => self.wait(backend, cx),
            State::Send { .. } => self.send(),
            State::Flush => match self.transport.flush() {
                Ok(Poll::Ready(())) => {
                    self.state = State::Dispose;
                    Flow::Continue
                }
                Ok(Poll::Pending) => Flow::Yield,
                Err(e) => {
                    debug!(error = %e, "flush failed");
                    self.state = State::Failed;
                    Flow::Continue
                }
            },
            State::Failed => {
                debug!(peer = %self.peer(), "connection failed");
                self.state = State::Dispose;
                Flow::Continue
            }
            State::Timeout => {
                debug!(peer = %self.peer(), timeout_ms = self.settings.timeout_ms, "connection timed out");
                self.state = State::Dispose;
                Flow::Continue
            }
            State::Dispose => self.dispose(cx),
        }
    }

    fn read(&mut self) -> Flow {
        loop {
            if self.filled == self.read_buf.len() {
                debug!(peer = %self.peer(), size = self.filled, "request head exceeds read buffer");
                self.respond(responses::payload_too_large());
                return Flow::Continue;
            }
            match self.transport.read(&mut self.read_buf[self.filled..]) {
                Ok(ReadOutcome::Data(n)) => {
                    // The sentinel may straddle the previous read.
                    let from = self.filled.saturating_sub(HEADER_SENTINEL.len() - 1);
                    self.filled += n;
                    if find_sentinel(&self.read_buf[from..self.filled]).is_some() {
                        self.state = State::Parsing;
                        return Flow::Continue;
                    }
                }
                Ok(ReadOutcome::WouldBlock) => return Flow::Yield,
                Ok(ReadOutcome::Eof) => {
                    debug!(peer = %self.peer(), read = self.filled, "eof before end of request head");
                    self.respond(responses::invalid_request(HttpStatus::BAD_REQUEST));
                    return Flow::Continue;
                }
                Err(e) => {
                    debug!(peer = %self.peer(), error = %e, "read failed");
                    self.state = State::Failed;
                    return Flow::Continue;
                }
            }
        }
    }

    fn parse(&mut self, cx: &mut TaskContext<'_>) -> Flow {
        let req = match parse_request(&self.read_buf[..self.filled], &self.settings.parse) {
            Ok(req) => req,
            Err(reason) => {
                debug!(peer = %self.peer(), %reason, "invalid request");
                self.respond(handler::handle_error(reason.into_http_status()));
                return Flow::Continue;
            }
        };

        let dispatch = handler::handle_request(&req);
        match dispatch {
            Dispatch::Respond(res) => {
                self.request = Some(req);
                self.respond(res);
            }
            Dispatch::Backend(kind) => {
                let owner = cx.current();
                match cx.spawn(BackendTask::new(owner, kind, &req)) {
                    Ok(id) => {
                        debug!(conn = %owner, backend = %id, ?kind, "backend spawned");
                        self.backend = Some(id);
                        self.request = Some(req);
                        self.state = State::Wait { backend: Some(id) };
                    }
                    Err(e) => {
                        warn!(error = %e, ?kind, "cannot spawn backend");
                        self.request = Some(req);
                        self.respond(responses::internal_server_error());
                    }
                }
            }
        }
        Flow::Continue
    }

    fn wait(&mut self, backend: Option<TaskId>, cx: &mut TaskContext<'_>) -> Flow {
        if backend.is_some_and(|id| cx.is_alive(id)) {
            return Flow::Yield;
        }
        warn!(peer = %self.peer(), "backend finished without a response");
        self.send_response(responses::internal_server_error());
        Flow::Continue
    }

    fn send(&mut self) -> Flow {
        let State::Send { out } = &mut self.state else {
            return Flow::Continue;
        };
        if out.is_empty() {
            self.state = State::Failed;
            return Flow::Continue;
        }
        loop {
            if out.is_drained() {
                self.bytes_sent = out.sent();
                self.state = State::Flush;
                return Flow::Continue;
            }
            match self.transport.write(out.remaining()) {
                Ok(WriteOutcome::Written(n)) => out.advance(n),
                Ok(WriteOutcome::WouldBlock) => return Flow::Yield,
                Err(e) => {
                    debug!(error = %e, "write failed");
                    self.bytes_sent = out.sent();
                    self.state = State::Failed;
                    return Flow::Continue;
                }
            }
        }
    }

    fn dispose(&mut self, cx: &mut TaskContext<'_>) -> Flow {
        if !self.closed {
            self.transport.close();
            self.closed = true;
            self.log_access(cx.now());
            self.request = None;
            self.read_buf = Vec::new();
        }
        match self.backend {
            Some(id) if cx.is_alive(id) => Flow::Yield,
            _ => Flow::Finished,
        }
    }

    fn peer(&self) -> String {
        self.transport
            .peer_addr()
            .map_or_else(|| "-".to_string(), |p| p.to_string())
    }

    fn log_access(&self, now: u64) {
        let elapsed_ms = now.saturating_sub(self.started);
        let peer = self.peer();
        match (&self.request, self.status) {
            (Some(req), Some(status)) => info!(
                peer = %peer,
                transport = self.transport.kind(),
                method = %req.method,
                path = %req.path,
                status = status.code(),
                bytes = self.bytes_sent,
                elapsed_ms,
                "request"
            ),
            (None, Some(status)) => info!(
                peer = %peer,
                status = status.code(),
                bytes = self.bytes_sent,
                elapsed_ms,
                "rejected request"
            ),
            (_, None) => debug!(peer = %peer, elapsed_ms, "closed without response"),
        }
    }
}

impl Task<ServerContext, HttpResponse> for ConnectionTask {
    fn name(&self) -> &'static str {
        "connection"
    }

    fn step(&mut self, cx: &mut TaskContext<'_>) -> Step {
        loop {
            match self.advance(cx) {
                Flow::Continue => continue,
                Flow::Yield => return Step::Pending,
                Flow::Finished => return Step::Done,
            }
        }
    }

    fn deliver(&mut self, res: HttpResponse) {
        self.send_response(res);
    }

    fn cleanup(&mut self, _shared: &mut ServerContext) {
        if !self.closed {
            self.transport.close();
            self.closed = true;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::{ServerContext, ServerScheduler};
    use crate::http::parser::parse_response;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Default)]
    pub(crate) struct Wire {
        pub inbound: VecDeque<Vec<u8>>,
        pub eof: bool,
        pub written: Vec<u8>,
        pub write_limit: Option<usize>,
        pub closed: bool,
    }

    /// In-memory transport; the test keeps the other end of the wire.
    pub(crate) struct MemoryTransport(pub Rc<RefCell<Wire>>);

    impl Transport for MemoryTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
            let mut wire = self.0.borrow_mut();
            let Some(mut chunk) = wire.inbound.pop_front() else {
                return Ok(if wire.eof { ReadOutcome::Eof } else { ReadOutcome::WouldBlock });
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                wire.inbound.push_front(chunk.split_off(n));
            }
            Ok(ReadOutcome::Data(n))
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<WriteOutcome> {
            let mut wire = self.0.borrow_mut();
            if wire.closed {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            }
            let n = wire.write_limit.map_or(buf.len(), |l| l.min(buf.len()));
            wire.written.extend_from_slice(&buf[..n]);
            Ok(WriteOutcome::Written(n))
        }

        fn close(&mut self) {
            self.0.borrow_mut().closed = true;
        }

        fn kind(&self) -> &'static str {
            "memory"
        }
    }

    pub(crate) fn test_config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            cache_dir: dir.join("cache"),
            surprise_dir: dir.join("surprise"),
            ..ServerConfig::default()
        }
    }

    fn setup(config: ServerConfig, input: &[&[u8]], eof: bool) -> (ServerScheduler, Rc<RefCell<Wire>>) {
        let wire = Rc::new(RefCell::new(Wire {
            inbound: input.iter().map(|c| c.to_vec()).collect(),
            eof,
            ..Wire::default()
        }));
        let settings = Arc::new(ConnectionSettings::from_config(&config));
        let ctx = ServerContext::new(Arc::new(config)).unwrap();
        let mut sched = ServerScheduler::new(ctx, 16, Duration::ZERO);
        sched
            .add(ConnectionTask::new(Box::new(MemoryTransport(wire.clone())), settings))
            .unwrap();
        (sched, wire)
    }

    fn drive(sched: &mut ServerScheduler, max_ticks: usize) {
        for _ in 0..max_ticks {
            if sched.is_empty() {
                return;
            }
            sched.tick();
        }
    }

    fn response_of(wire: &Rc<RefCell<Wire>>) -> HttpResponse {
        parse_response(&wire.borrow().written, &ParseOptions::default()).unwrap()
    }

    #[test]
    fn cities_request_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sched, wire) = setup(
            test_config(dir.path()),
            &[b"GET /GetCities HTTP/1.1\r\nHost: x\r\n\r\n"],
            false,
        );
        drive(&mut sched, 10);

        assert!(sched.is_empty());
        let res = response_of(&wire);
        assert_eq!(res.status, HttpStatus::OK);
        assert_eq!(res.headers.get("Content-Type"), Some("application/json"));
        assert_eq!(res.headers.get("Connection"), Some("close"));
        let body = String::from_utf8(res.body).unwrap();
        assert!(body.contains(r#"{"name":"Stockholm","latitude":59.3293,"longitude":18.0686}"#));
        assert!(wire.borrow().closed);
    }

    #[test]
    fn garbage_gets_400() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sched, wire) = setup(test_config(dir.path()), &[b"GARBAGE\r\n\r\n"], false);
        drive(&mut sched, 5);

        let res = response_of(&wire);
        assert_eq!(res.status, HttpStatus::BAD_REQUEST);
        assert_eq!(res.headers.get("Content-Type"), Some("text/plain"));
        assert_eq!(res.body, b"Invalid request received");
        assert!(wire.borrow().closed);
        assert!(sched.is_empty());
    }

    #[test]
    fn sentinel_split_across_reads() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sched, wire) = setup(
            test_config(dir.path()),
            &[b"GET /nowhere HTTP/1.1\r\nHost: x\r\n\r", b"\n"],
            false,
        );
        drive(&mut sched, 5);
        assert_eq!(response_of(&wire).status, HttpStatus::NOT_FOUND);
    }

    #[test]
    fn full_buffer_without_sentinel_is_413() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            read_buffer_size: 32,
            ..test_config(dir.path())
        };
        let (mut sched, wire) = setup(config, &[&[b'a'; 64]], false);
        drive(&mut sched, 5);
        assert_eq!(response_of(&wire).status, HttpStatus::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn sentinel_exactly_at_buffer_end_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let raw = b"GET /nowhere HTTP/1.1\r\n\r\n";
        let config = ServerConfig {
            read_buffer_size: raw.len(),
            ..test_config(dir.path())
        };
        let (mut sched, wire) = setup(config, &[raw], false);
        drive(&mut sched, 5);
        assert_eq!(response_of(&wire).status, HttpStatus::NOT_FOUND);
    }

    #[test]
    fn eof_before_sentinel_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sched, wire) = setup(test_config(dir.path()), &[b"GET / HTTP/1.1\r\n"], true);
        drive(&mut sched, 5);
        assert_eq!(response_of(&wire).status, HttpStatus::BAD_REQUEST);
    }

    #[test]
    fn options_and_other_methods() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sched, wire) = setup(
            test_config(dir.path()),
            &[b"OPTIONS /GetWeather HTTP/1.1\r\n\r\n"],
            false,
        );
        drive(&mut sched, 5);
        let res = response_of(&wire);
        assert_eq!(res.status, HttpStatus::NO_CONTENT);
        assert!(res.body.is_empty());

        let (mut sched, wire) = setup(
            test_config(dir.path()),
            &[b"POST /GetWeather HTTP/1.1\r\n\r\n"],
            false,
        );
        drive(&mut sched, 5);
        assert_eq!(response_of(&wire).status, HttpStatus::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn partial_writes_deliver_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sched, wire) = setup(
            test_config(dir.path()),
            &[b"GET /missing HTTP/1.1\r\n\r\n"],
            false,
        );
        wire.borrow_mut().write_limit = Some(7);
        drive(&mut sched, 5);
        let res = response_of(&wire);
        assert_eq!(res.status, HttpStatus::NOT_FOUND);
        assert_eq!(res.body, b"Not Found");
    }

    #[test]
    fn silent_client_times_out_without_response() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            connection_timeout: Duration::from_millis(20),
            ..test_config(dir.path())
        };
        let (mut sched, wire) = setup(config, &[b"GET /GetCities"], false);
        sched.tick();
        assert_eq!(sched.len(), 1);

        std::thread::sleep(Duration::from_millis(30));
        sched.tick();
        assert!(sched.is_empty());
        assert!(wire.borrow().written.is_empty());
        assert!(wire.borrow().closed);
    }

    #[test]
    fn response_outside_wait_is_ignored() {
        let wire = Rc::new(RefCell::new(Wire::default()));
        let settings = Arc::new(ConnectionSettings::from_config(&ServerConfig::default()));
        let mut conn = ConnectionTask::new(Box::new(MemoryTransport(wire)), settings);
        assert_eq!(conn.state_name(), "init");
        assert!(!conn.send_response(responses::not_found()));
        assert_eq!(conn.state_name(), "init");

        conn.state = State::Wait { backend: None };
        assert!(conn.send_response(responses::not_found()));
        assert_eq!(conn.state_name(), "send");
        assert!(!conn.send_response(responses::internal_server_error()));
    }

    #[test]
    fn timed_out_connection_waits_for_its_backend() {
        use crate::provider::forecast::tests::SAMPLE;
        use std::io::{Read, Write};
        use std::net::TcpListener;
        use std::thread;
        use std::time::Instant;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let upstream = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let mut seen = Vec::new();
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => seen.extend_from_slice(&buf[..n]),
                }
            }
            thread::sleep(Duration::from_millis(150));
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                SAMPLE.len(),
                SAMPLE
            );
            let _ = stream.write_all(reply.as_bytes());
        });

        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            connection_timeout: Duration::from_millis(30),
            ..test_config(dir.path())
        };
        config.upstream.forecast_url = format!("{base}/v1/forecast");
        let (mut sched, wire) = setup(
            config,
            &[b"GET /GetWeather?lat=59.33&lon=18.07 HTTP/1.1\r\nHost: x\r\n\r\n"],
            false,
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut closed_while_backend_ran = false;
        while !sched.is_empty() {
            assert!(Instant::now() < deadline, "connection never finished");
            sched.tick();
            if wire.borrow().closed && sched.len() == 2 {
                closed_while_backend_ran = true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        upstream.join().unwrap();

        assert!(closed_while_backend_ran, "socket closes on timeout, task lingers");
        assert!(wire.borrow().closed);
        assert!(wire.borrow().written.is_empty(), "late response is dropped");
        assert!(sched.shared().weather.get("", 59.33, 18.07).is_some());
    }
}
