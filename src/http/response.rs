use crate::http::HttpVersion;
use crate::http::headers::HttpHeaders;
use crate::http::status::HttpStatus;

pub enum ResponseHeader {
    ContentLength,
    ContentType,
    ContentEncoding,
    Connection,
    Server,
    Date,
    Vary,
    AccessControlAllowOrigin,
    AccessControlAllowMethods,
    AccessControlAllowHeaders,
}

impl ResponseHeader {
    pub fn name(&self) -> &'static str {
        match self {
            ResponseHeader::ContentType => "Content-Type",
            ResponseHeader::ContentLength => "Content-Length",
            ResponseHeader::ContentEncoding => "Content-Encoding",
            ResponseHeader::Connection => "Connection",
            ResponseHeader::Server => "Server",
            ResponseHeader::Date => "Date",
            ResponseHeader::Vary => "Vary",
            ResponseHeader::AccessControlAllowOrigin => "Access-Control-Allow-Origin",
            ResponseHeader::AccessControlAllowMethods => "Access-Control-Allow-Methods",
            ResponseHeader::AccessControlAllowHeaders => "Access-Control-Allow-Headers",
        }
    }
}

pub const TEXT_PLAIN: &str = "text/plain";
pub const APPLICATION_JSON: &str = "application/json";
pub const IMAGE_PNG: &str = "image/png";

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub http_version: HttpVersion,
    pub status: HttpStatus,
    /// Reason phrase as received; `None` emits the canonical phrase.
    pub reason: Option<String>,
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: HttpStatus) -> Self {
        Self {
            http_version: HttpVersion::V1_1,
            status,
            reason: None,
            headers: HttpHeaders::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(status: HttpStatus, content_type: &str, body: Vec<u8>) -> Self {
        let mut res = Self::new(status);
        res.set_header(ResponseHeader::ContentType, content_type);
        res.set_body(body);
        res
    }

    pub fn text(status: HttpStatus, body: &str) -> Self {
        Self::with_body(status, TEXT_PLAIN, body.as_bytes().to_vec())
    }

    pub fn json(status: HttpStatus, body: Vec<u8>) -> Self {
        Self::with_body(status, APPLICATION_JSON, body)
    }

    pub fn set_header(&mut self, h: ResponseHeader, value: &str) {
        self.headers.set_raw(h.name(), value);
    }

    /// Replaces the body and keeps `Content-Length` in step with it.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
        self.set_header(ResponseHeader::ContentLength, &self.body.len().to_string());
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(ResponseHeader::ContentType.name())
    }

    pub fn reason_phrase(&self) -> &str {
        self.reason.as_deref().unwrap_or_else(|| self.status.reason())
    }

    pub fn build_headers(&self) -> String {
        // HTTP <major>.<minor> <status> <reason>\r\n
        // <header_name>: <header_value>\r\n
        // ...
        // \r\n
        format!(
            "{} {} {}\r\n{}\r\n",
            self.http_version.as_str(),
            self.status.code(),
            self.reason_phrase(),
            self.headers.stringify(),
        )
    }

    /// Full wire form: status line, headers, empty line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let head = self.build_headers();
        let mut out = Vec::with_capacity(head.len() + self.body.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}
