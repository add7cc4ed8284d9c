//! Strict, stateless parsing of complete HTTP/1.x messages.
//!
//! The connection only hands a buffer to [`parse_request`] once the
//! `\r\n\r\n` sentinel has been seen, so there is no incremental state here.
//! The outbound client uses [`parse_response`] on the bytes received from
//! the upstream provider.

use crate::http::headers::HttpHeaders;
use crate::http::request::{HttpRequest, parse_query, split_target};
use crate::http::response::HttpResponse;
use crate::http::status::HttpStatus;
use crate::http::{HttpVersion, http_method_from_str};

pub const HEADER_SENTINEL: &[u8] = b"\r\n\r\n";

/// Why a message was rejected.
///
/// To keep parser logic separate from HTTP status codes, direct status codes
/// are not used here but mapped by [`InvalidReason::into_http_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidReason {
    // 400 Bad Request
    #[error("malformed message")]
    Malformed,

    // 400 Bad Request
    #[error("request target must start with '/'")]
    InvalidUrl,

    // 414 URI Too Long
    #[error("request target exceeds the URL limit")]
    UrlTooLong,

    // 400 Bad Request (strict mode only)
    #[error("invalid protocol version")]
    InvalidProtocol,
}

impl InvalidReason {
    pub fn into_http_status(self) -> HttpStatus {
        match self {
            InvalidReason::UrlTooLong => HttpStatus::URI_TOO_LONG,
            InvalidReason::Malformed | InvalidReason::InvalidUrl | InvalidReason::InvalidProtocol => {
                HttpStatus::BAD_REQUEST
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub max_url_len: usize,
    /// Reject protocol tokens outside the known set instead of tagging them unknown.
    pub strict: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            max_url_len: crate::config::URL_LENGTH_LIMIT,
            strict: true,
        }
    }
}

/// Position of the first `\r\n\r\n`, if any.
pub fn find_sentinel(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_SENTINEL.len())
        .position(|w| w == HEADER_SENTINEL)
}

pub fn parse_request(buf: &[u8], opts: &ParseOptions) -> Result<HttpRequest, InvalidReason> {
    let head = match find_sentinel(buf) {
        Some(end) => &buf[..end],
        None => buf,
    };
    let head = std::str::from_utf8(head).map_err(|_| InvalidReason::Malformed)?;
    let (start_line, header_block) = split_start_line(head);

    // Request line: METHOD TARGET HTTP/VERSION
    if start_line.matches(' ').count() != 2 {
        return Err(InvalidReason::Malformed);
    }
    let mut parts = start_line.split(' ');
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(InvalidReason::Malformed);
    };
    if method.is_empty() {
        return Err(InvalidReason::Malformed);
    }

    let http_version = parse_version(version, opts.strict)?;

    if !target.starts_with('/') {
        return Err(InvalidReason::InvalidUrl);
    }
    if target.len() > opts.max_url_len {
        return Err(InvalidReason::UrlTooLong);
    }

    let (path, query) = split_target(target);

    Ok(HttpRequest {
        method: http_method_from_str(method),
        target: target.to_string(),
        path: path.to_string(),
        query: query.map(parse_query).unwrap_or_default(),
        http_version,
        headers: parse_headers(header_block)?,
        body: Vec::new(),
    })
}

pub fn parse_response(buf: &[u8], opts: &ParseOptions) -> Result<HttpResponse, InvalidReason> {
    let head_end = find_sentinel(buf).ok_or(InvalidReason::Malformed)?;
    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| InvalidReason::Malformed)?;
    let (start_line, header_block) = split_start_line(head);

    // Status line: HTTP/VERSION CODE REASON, where REASON may contain spaces
    let mut parts = start_line.splitn(3, ' ');
    let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
        return Err(InvalidReason::Malformed);
    };
    let reason = parts.next();

    let http_version = parse_version(version, opts.strict)?;
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InvalidReason::Malformed);
    }
    let status = code.parse::<u16>().map_err(|_| InvalidReason::Malformed)?;

    Ok(HttpResponse {
        http_version,
        status: HttpStatus(status),
        reason: reason.map(str::to_string),
        headers: parse_headers(header_block)?,
        body: buf[head_end + HEADER_SENTINEL.len()..].to_vec(),
    })
}

fn split_start_line(head: &str) -> (&str, &str) {
    match head.split_once("\r\n") {
        Some((line, rest)) => (line, rest),
        None => (head, ""),
    }
}

fn parse_version(token: &str, strict: bool) -> Result<HttpVersion, InvalidReason> {
    match HttpVersion::from_token(token) {
        Some(v) => Ok(v),
        None if strict => Err(InvalidReason::InvalidProtocol),
        None => Ok(HttpVersion::Unknown),
    }
}

/// `name: value` lines separated by CRLF. A line shorter than two bytes ends
/// the block.
fn parse_headers(block: &str) -> Result<HttpHeaders, InvalidReason> {
    let mut headers = HttpHeaders::new();
    for line in block.split("\r\n") {
        if line.len() < 2 {
            break;
        }
        let (name, value) = line.split_once(": ").ok_or(InvalidReason::Malformed)?;
        if name.is_empty() || name.contains(' ') {
            return Err(InvalidReason::Malformed);
        }
        headers.append(name, value);
    }
    Ok(headers)
}
