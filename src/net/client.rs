//! Non-blocking HTTP/1.1 GET against the upstream provider.
//!
//! An [`HttpFetch`] is polled from a backend task's step and walks
//! `Resolve -> Connect -> Send -> Recv`, yielding whenever the socket (or the
//! resolver) is not ready. Name resolution runs on the async-std blocking
//! pool and its join handle is polled with a no-op waker, so the scheduler
//! thread itself never blocks. Literal IP hosts skip resolution.
//!
//! A fetch fails on connect timeout (resolve plus connect), total timeout,
//! responses past the size cap, unparsable responses and non-2xx statuses.

use std::future::Future;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpStream};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use async_std::task::JoinHandle;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace};
use url::{Host, Position, Url};

use crate::config::UpstreamConfig;
use crate::http::parser::{HEADER_SENTINEL, ParseOptions, find_sentinel, parse_response};
use crate::http::request::{HttpRequest, RequestHeader};
use crate::http::response::HttpResponse;
use crate::net::transport::{PlainTransport, ReadOutcome, Transport, WriteOutcome};

const RECV_CHUNK: usize = 4096;
const USER_AGENT: &str = concat!("stormnet/", env!("CARGO_PKG_VERSION"));

#[cfg(any(target_os = "linux", target_os = "android"))]
const EINPROGRESS: i32 = 115;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const EINPROGRESS: i32 = 36;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid upstream url {url}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported upstream url {0}")]
    UnsupportedUrl(String),
    #[error("dns resolution failed for {host}: {reason}")]
    Dns { host: String, reason: String },
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("receive failed: {0}")]
    Recv(#[source] io::Error),
    #[error("timed out while {0}")]
    Timeout(&'static str),
    #[error("response exceeds {0} bytes")]
    TooLarge(usize),
    #[error("malformed response: {0}")]
    Parse(String),
    #[error("upstream answered {0}")]
    Status(u16),
    #[error("fetch already completed")]
    Finished,
}

impl FetchError {
    /// Short tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Url { .. } | FetchError::UnsupportedUrl(_) => "url",
            FetchError::Dns { .. } => "dns",
            FetchError::Connect(_) => "connect",
            FetchError::Send(_) => "send",
            FetchError::Recv(_) => "recv",
            FetchError::Timeout(_) => "timeout",
            FetchError::TooLarge(_) => "too-large",
            FetchError::Parse(_) => "parse",
            FetchError::Status(_) => "status",
            FetchError::Finished => "finished",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub connect_timeout_ms: u64,
    pub total_timeout_ms: u64,
    pub max_response: usize,
}

impl FetchOptions {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            connect_timeout_ms: config.connect_timeout.as_millis() as u64,
            total_timeout_ms: config.total_timeout.as_millis() as u64,
            max_response: config.max_response_size,
        }
    }
}

type Resolution = io::Result<Vec<SocketAddr>>;

enum Phase {
    Resolve(Pin<Box<JoinHandle<Resolution>>>),
    Connect {
        socket: Socket,
        addrs: Vec<SocketAddr>,
        current: usize,
    },
    Send(PlainTransport),
    Recv(PlainTransport),
    Done,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Resolve(_) => "resolving",
            Phase::Connect { .. } => "connecting",
            Phase::Send(_) => "sending",
            Phase::Recv(_) => "receiving",
            Phase::Done => "done",
        }
    }
}

enum Progress {
    Next(Phase),
    Blocked(Phase),
    Complete(HttpResponse),
}

pub struct HttpFetch {
    url: Url,
    host: String,
    phase: Phase,
    request: Vec<u8>,
    written: usize,
    response: Vec<u8>,
    started: u64,
    opts: FetchOptions,
}

impl HttpFetch {
    /// Starts fetching `url`; resolution or connect begins immediately.
    pub fn new(url: &str, opts: FetchOptions, now: u64) -> Result<Self, FetchError> {
        let parsed = Url::parse(url).map_err(|source| FetchError::Url {
            url: url.to_string(),
            source,
        })?;
        if parsed.scheme() != "http" {
            return Err(FetchError::UnsupportedUrl(url.to_string()));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| FetchError::UnsupportedUrl(url.to_string()))?
            .to_string();
        let port = parsed.port_or_known_default().unwrap_or(80);

        let mut req = HttpRequest::get(&parsed[Position::BeforePath..Position::AfterQuery]);
        let host_header = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };
        req.set_header(RequestHeader::Host, &host_header);
        req.set_header(RequestHeader::UserAgent, USER_AGENT);
        req.set_header(RequestHeader::Accept, "application/json");
        req.set_header(RequestHeader::Connection, "close");

        let phase = match parsed.host() {
            Some(Host::Ipv4(ip)) => connect_from(vec![SocketAddr::new(ip.into(), port)], 0)?,
            Some(Host::Ipv6(ip)) => connect_from(vec![SocketAddr::new(ip.into(), port)], 0)?,
            _ => Phase::Resolve(Box::pin(resolve(host.clone(), port))),
        };
        debug!(url = %parsed, phase = phase.name(), "upstream fetch started");

        Ok(Self {
            url: parsed,
            host,
            phase,
            request: req.to_bytes(),
            written: 0,
            response: Vec::new(),
            started: now,
            opts,
        })
    }

    /// Advances as far as possible without blocking.
    pub fn poll(&mut self, now: u64) -> Poll<Result<HttpResponse, FetchError>> {
        loop {
            let phase = std::mem::replace(&mut self.phase, Phase::Done);
            if matches!(phase, Phase::Done) {
                return Poll::Ready(Err(FetchError::Finished));
            }
            if let Some(err) = self.check_deadlines(&phase, now) {
                return Poll::Ready(Err(err));
            }
            match self.advance(phase) {
                Ok(Progress::Next(next)) => self.phase = next,
                Ok(Progress::Blocked(same)) => {
                    self.phase = same;
                    return Poll::Pending;
                }
                Ok(Progress::Complete(res)) => {
                    debug!(url = %self.url, status = res.status.code(), bytes = res.body.len(), "upstream fetch done");
                    return Poll::Ready(Ok(res));
                }
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }

    fn check_deadlines(&self, phase: &Phase, now: u64) -> Option<FetchError> {
        let elapsed = now.saturating_sub(self.started);
        let connecting = matches!(phase, Phase::Resolve(_) | Phase::Connect { .. });
        if connecting && elapsed >= self.opts.connect_timeout_ms {
            return Some(FetchError::Timeout(phase.name()));
        }
        if elapsed >= self.opts.total_timeout_ms {
            return Some(FetchError::Timeout(phase.name()));
        }
        None
    }

    fn advance(&mut self, phase: Phase) -> Result<Progress, FetchError> {
        match phase {
            Phase::Resolve(mut handle) => {
                let mut cx = Context::from_waker(Waker::noop());
                match handle.as_mut().poll(&mut cx) {
                    Poll::Pending => Ok(Progress::Blocked(Phase::Resolve(handle))),
                    Poll::Ready(Ok(addrs)) if !addrs.is_empty() => {
                        trace!(host = %self.host, ?addrs, "resolved");
                        connect_from(addrs, 0).map(Progress::Next)
                    }
                    Poll::Ready(Ok(_)) => Err(FetchError::Dns {
                        host: self.host.clone(),
                        reason: "no addresses".to_string(),
                    }),
                    Poll::Ready(Err(e)) => Err(FetchError::Dns {
                        host: self.host.clone(),
                        reason: e.to_string(),
                    }),
                }
            }
            Phase::Connect {
                socket,
                addrs,
                current,
            } => {
                let failure = match socket.take_error() {
                    Ok(Some(e)) | Err(e) => Some(e),
                    Ok(None) => None,
                };
                if let Some(e) = failure {
                    return next_address(addrs, current, e);
                }
                match socket.peer_addr() {
                    Ok(_) => {
                        let transport = PlainTransport::new(TcpStream::from(socket))
                            .map_err(FetchError::Connect)?;
                        Ok(Progress::Next(Phase::Send(transport)))
                    }
                    Err(e) if e.kind() == ErrorKind::NotConnected => Ok(Progress::Blocked(Phase::Connect {
                        socket,
                        addrs,
                        current,
                    })),
                    Err(e) => next_address(addrs, current, e),
                }
            }
            Phase::Send(mut transport) => loop {
                if self.written >= self.request.len() {
                    return Ok(Progress::Next(Phase::Recv(transport)));
                }
                match transport.write(&self.request[self.written..]) {
                    Ok(WriteOutcome::Written(n)) => self.written += n,
                    Ok(WriteOutcome::WouldBlock) => return Ok(Progress::Blocked(Phase::Send(transport))),
                    Err(e) => return Err(FetchError::Send(e)),
                }
            },
            Phase::Recv(mut transport) => {
                let mut chunk = [0u8; RECV_CHUNK];
                loop {
                    match transport.read(&mut chunk) {
                        Ok(ReadOutcome::Data(n)) => {
                            self.response.extend_from_slice(&chunk[..n]);
                            if self.response.len() > self.opts.max_response {
                                transport.close();
                                return Err(FetchError::TooLarge(self.opts.max_response));
                            }
                            match is_complete(&self.response, self.opts.max_response) {
                                Ok(false) => {}
                                Ok(true) => {
                                    transport.close();
                                    return finish(&self.response, self.opts.max_response)
                                        .map(Progress::Complete);
                                }
                                Err(e) => {
                                    transport.close();
                                    return Err(e);
                                }
                            }
                        }
                        Ok(ReadOutcome::WouldBlock) => return Ok(Progress::Blocked(Phase::Recv(transport))),
                        Ok(ReadOutcome::Eof) => {
                            transport.close();
                            return finish(&self.response, self.opts.max_response).map(Progress::Complete);
                        }
                        Err(e) => return Err(FetchError::Recv(e)),
                    }
                }
            }
            Phase::Done => Err(FetchError::Finished),
        }
    }
}

fn resolve(host: String, port: u16) -> JoinHandle<Resolution> {
    async_std::task::spawn(async move {
        use async_std::net::ToSocketAddrs;
        let addrs = (host.as_str(), port).to_socket_addrs().await?;
        Ok(addrs.collect())
    })
}

/// Starts a non-blocking connect to the first address from `from` that
/// accepts one.
fn connect_from(addrs: Vec<SocketAddr>, from: usize) -> Result<Phase, FetchError> {
    let mut last_err = io::Error::from(ErrorKind::AddrNotAvailable);
    for current in from..addrs.len() {
        match start_connect(addrs[current]) {
            Ok(socket) => {
                return Ok(Phase::Connect {
                    socket,
                    addrs,
                    current,
                });
            }
            Err(e) => last_err = e,
        }
    }
    Err(FetchError::Connect(last_err))
}

fn next_address(addrs: Vec<SocketAddr>, current: usize, err: io::Error) -> Result<Progress, FetchError> {
    debug!(addr = %addrs[current], error = %err, "connect attempt failed");
    if current + 1 < addrs.len() {
        connect_from(addrs, current + 1).map(Progress::Next)
    } else {
        Err(FetchError::Connect(err))
    }
}

fn start_connect(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => Ok(socket),
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == Some(EINPROGRESS) => {
            Ok(socket)
        }
        Err(e) => Err(e),
    }
}

fn upstream_parse_options() -> ParseOptions {
    ParseOptions {
        max_url_len: usize::MAX,
        strict: false,
    }
}

fn is_chunked(res: &HttpResponse) -> bool {
    res.headers
        .get("Transfer-Encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn content_length(res: &HttpResponse) -> Option<usize> {
    res.headers.get("Content-Length")?.trim().parse().ok()
}

/// Whether `buf` already holds the whole response, judged by
/// `Content-Length` or the final chunk. Without either, only EOF tells.
/// A malformed chunked body fails here rather than at EOF.
fn is_complete(buf: &[u8], limit: usize) -> Result<bool, FetchError> {
    let Some(head_end) = find_sentinel(buf) else {
        return Ok(false);
    };
    let body_start = head_end + HEADER_SENTINEL.len();
    let Ok(head) = parse_response(&buf[..body_start], &upstream_parse_options()) else {
        return Ok(false);
    };
    let body = &buf[body_start..];
    if is_chunked(&head) {
        Ok(decode_chunked(body, limit)?.is_some())
    } else if let Some(len) = content_length(&head) {
        Ok(body.len() >= len)
    } else {
        Ok(false)
    }
}

fn finish(buf: &[u8], limit: usize) -> Result<HttpResponse, FetchError> {
    let mut res = parse_response(buf, &upstream_parse_options())
        .map_err(|e| FetchError::Parse(e.to_string()))?;
    if is_chunked(&res) {
        res.body = decode_chunked(&res.body, limit)?
            .ok_or_else(|| FetchError::Parse("truncated chunked body".to_string()))?;
    } else if let Some(len) = content_length(&res) {
        if res.body.len() < len {
            return Err(FetchError::Parse(format!(
                "body is {} bytes, expected {len}",
                res.body.len()
            )));
        }
        res.body.truncate(len);
    }
    if !res.status.is_success() {
        return Err(FetchError::Status(res.status.code()));
    }
    Ok(res)
}

/// Decodes a chunked body. `Ok(None)` means the final chunk has not arrived.
/// The decoded body may not exceed `limit` bytes.
pub(crate) fn decode_chunked(body: &[u8], limit: usize) -> Result<Option<Vec<u8>>, FetchError> {
    let mut out = Vec::with_capacity(body.len());
    let mut pos = 0;
    loop {
        let Some(line_len) = body[pos..].windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&body[pos..pos + line_len])
            .map_err(|_| FetchError::Parse("chunk size is not text".to_string()))?;
        let size_field = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| FetchError::Parse(format!("bad chunk size {size_field:?}")))?;
        pos += line_len + 2;

        if size == 0 {
            return Ok(Some(out));
        }
        if out.len().saturating_add(size) > limit {
            return Err(FetchError::TooLarge(limit));
        }
        let data_end = pos
            .checked_add(size)
            .ok_or_else(|| FetchError::Parse(format!("chunk size {size_field:?} overflows")))?;
        let chunk_end = data_end
            .checked_add(2)
            .ok_or_else(|| FetchError::Parse(format!("chunk size {size_field:?} overflows")))?;
        if body.len() < chunk_end {
            return Ok(None);
        }
        out.extend_from_slice(&body[pos..data_end]);
        if &body[data_end..chunk_end] != b"\r\n" {
            return Err(FetchError::Parse("chunk not terminated by CRLF".to_string()));
        }
        pos = chunk_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn opts() -> FetchOptions {
        FetchOptions {
            connect_timeout_ms: 3_000,
            total_timeout_ms: 10_000,
            max_response: 5 * 1024 * 1024,
        }
    }

    /// Serves one canned reply and reports the request head it received.
    fn serve_once(reply: Vec<u8>) -> (u16, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                if stream.read(&mut byte).unwrap() == 0 {
                    break;
                }
                head.push(byte[0]);
            }
            let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
            // The client may hang up early on oversized replies.
            let _ = stream.write_all(&reply);
        });
        (port, rx)
    }

    fn run(fetch: &mut HttpFetch) -> Result<HttpResponse, FetchError> {
        loop {
            if let Poll::Ready(result) = fetch.poll(clock::now_ms()) {
                return result;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn fetches_with_content_length() {
        let (port, rx) = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\n\r\n{\"ok\":true}".to_vec(),
        );
        let url = format!("http://127.0.0.1:{port}/v1/search?name=Kiruna&count=1");
        let mut fetch = HttpFetch::new(&url, opts(), clock::now_ms()).unwrap();
        let res = run(&mut fetch).unwrap();
        assert_eq!(res.body, b"{\"ok\":true}");

        let head = rx.recv().unwrap();
        assert!(head.starts_with("GET /v1/search?name=Kiruna&count=1 HTTP/1.1\r\n"));
        assert!(head.contains(&format!("Host: 127.0.0.1:{port}\r\n")));
        assert!(head.contains("Connection: close\r\n"));
    }

    #[test]
    fn resolves_host_names() {
        let (port, _rx) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}".to_vec());
        let url = format!("http://localhost:{port}/");
        let mut fetch = HttpFetch::new(&url, opts(), clock::now_ms()).unwrap();
        assert_eq!(run(&mut fetch).unwrap().body, b"{}");
        assert!(matches!(fetch.poll(clock::now_ms()), Poll::Ready(Err(FetchError::Finished))));
    }

    #[test]
    fn dechunks_body() {
        let (port, _rx) = serve_once(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\n{\"a\"\r\n3;x=y\r\n:1}\r\n0\r\n\r\n".to_vec(),
        );
        let mut fetch =
            HttpFetch::new(&format!("http://127.0.0.1:{port}/"), opts(), clock::now_ms()).unwrap();
        assert_eq!(run(&mut fetch).unwrap().body, b"{\"a\":1}");
    }

    #[test]
    fn reads_until_eof_without_length() {
        let (port, _rx) = serve_once(b"HTTP/1.0 200 OK\r\n\r\nbody until close".to_vec());
        let mut fetch =
            HttpFetch::new(&format!("http://127.0.0.1:{port}/"), opts(), clock::now_ms()).unwrap();
        assert_eq!(run(&mut fetch).unwrap().body, b"body until close");
    }

    #[test]
    fn non_success_status_fails() {
        let (port, _rx) =
            serve_once(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n".to_vec());
        let mut fetch =
            HttpFetch::new(&format!("http://127.0.0.1:{port}/"), opts(), clock::now_ms()).unwrap();
        assert!(matches!(run(&mut fetch), Err(FetchError::Status(503))));
    }

    #[test]
    fn oversized_response_fails() {
        let mut reply = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        reply.extend(std::iter::repeat_n(b'x', 500));
        let (port, _rx) = serve_once(reply);
        let small = FetchOptions {
            max_response: 128,
            ..opts()
        };
        let mut fetch =
            HttpFetch::new(&format!("http://127.0.0.1:{port}/"), small, clock::now_ms()).unwrap();
        assert!(matches!(run(&mut fetch), Err(FetchError::TooLarge(128))));
    }

    #[test]
    fn refused_connection_fails() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = HttpFetch::new(&format!("http://127.0.0.1:{port}/"), opts(), clock::now_ms())
            .and_then(|mut fetch| run(&mut fetch));
        assert!(matches!(result, Err(FetchError::Connect(_))));
    }

    #[test]
    fn only_plain_http_is_supported() {
        assert!(matches!(
            HttpFetch::new("https://example.org/", opts(), 0),
            Err(FetchError::UnsupportedUrl(_))
        ));
        assert!(matches!(
            HttpFetch::new("not a url", opts(), 0),
            Err(FetchError::Url { .. })
        ));
    }

    #[test]
    fn chunked_decoder_edge_cases() {
        let limit = 1024;
        assert_eq!(decode_chunked(b"3\r\nabc\r\n", limit).unwrap(), None);
        assert_eq!(decode_chunked(b"3\r\nab", limit).unwrap(), None);
        assert_eq!(decode_chunked(b"0\r\n\r\n", limit).unwrap(), Some(Vec::new()));
        assert_eq!(
            decode_chunked(b"A\r\n0123456789\r\n0\r\n\r\n", limit).unwrap(),
            Some(b"0123456789".to_vec())
        );
        assert!(decode_chunked(b"zz\r\n", limit).is_err());
        assert!(decode_chunked(b"1\r\nab\r\n", limit).is_err());
    }

    #[test]
    fn huge_chunk_sizes_are_rejected() {
        assert!(matches!(
            decode_chunked(b"ffffffffffffffff\r\nabc", 5 * 1024 * 1024),
            Err(FetchError::TooLarge(_))
        ));
        assert!(matches!(
            decode_chunked(b"ffffffffffffffff\r\nabc", usize::MAX),
            Err(FetchError::Parse(_))
        ));
        assert!(matches!(
            decode_chunked(b"4\r\nabcd\r\n4\r\nefgh\r\n0\r\n\r\n", 6),
            Err(FetchError::TooLarge(6))
        ));
    }

    #[test]
    fn hostile_chunk_size_fails_the_fetch() {
        let (port, _rx) = serve_once(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc".to_vec(),
        );
        let mut fetch =
            HttpFetch::new(&format!("http://127.0.0.1:{port}/"), opts(), clock::now_ms()).unwrap();
        assert!(matches!(run(&mut fetch), Err(FetchError::TooLarge(_))));
    }
}
