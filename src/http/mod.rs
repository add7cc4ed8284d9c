use std::fmt;

pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod status;

/// All existing HTTP versions.
/// Used to tag the protocol token of a parsed request or response; anything
/// outside the closed set is [`HttpVersion::Unknown`] (or an error in strict mode).
#[derive(PartialEq, PartialOrd, Debug, Clone, Copy)]
pub enum HttpVersion {
    V0_9,
    V1_0,
    V1_1,
    V2_0,
    V3_0,
    Unknown,
}

impl HttpVersion {
    /// Check if a tuple (major, minor) corresponds to a valid HTTP version
    pub fn from_pair(v: (u8, u8)) -> Option<HttpVersion> {
        match (v.0, v.1) {
            (0, 9) => Some(HttpVersion::V0_9),
            (1, 0) => Some(HttpVersion::V1_0),
            (1, 1) => Some(HttpVersion::V1_1),
            (2, 0) => Some(HttpVersion::V2_0),
            (3, 0) => Some(HttpVersion::V3_0),
            _ => None,
        }
    }

    /// Parses an `HTTP/<major>.<minor>` token with single-digit parts.
    pub fn from_token(token: &str) -> Option<HttpVersion> {
        let (maj, min) = token.strip_prefix("HTTP/")?.split_once('.')?;
        if maj.len() != 1 || min.len() != 1 {
            return None;
        }
        Self::from_pair((maj.parse().ok()?, min.parse().ok()?))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::V0_9 => "HTTP/0.9",
            HttpVersion::V1_0 => "HTTP/1.0",
            HttpVersion::V1_1 => "HTTP/1.1",
            HttpVersion::V2_0 => "HTTP/2.0",
            HttpVersion::V3_0 => "HTTP/3.0",
            // Re-emitted as the version this server speaks.
            HttpVersion::Unknown => "HTTP/1.1",
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Options,
    /// Any other token, kept verbatim so the request line can be re-emitted.
    Other(String),
}

impl HttpMethod {
    pub fn as_str(&self) -> &str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Other(token) => token,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn http_method_from_str(method: &str) -> HttpMethod {
    match method {
        "GET" => HttpMethod::Get,
        "HEAD" => HttpMethod::Head,
        "POST" => HttpMethod::Post,
        "OPTIONS" => HttpMethod::Options,
        other => HttpMethod::Other(other.to_string()),
    }
}
