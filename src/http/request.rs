use indexmap::IndexMap;

use crate::http::headers::HttpHeaders;
use crate::http::{HttpMethod, HttpVersion};

/// Common HTTP request headers
/// This enum defines the set of headers that can be explicitly set on an
/// [`HttpRequest`] through its safe wrapper API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestHeader {
    Host,
    Accept,
    AcceptEncoding,
    Connection,
    ContentLength,
    ContentType,
    UserAgent,
}

/// Query parameters in insertion order. Repeated names keep every value.
pub type QueryParams = IndexMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// The request-target exactly as received (path plus optional query).
    pub target: String,
    /// The target up to, not including, the `?`.
    pub path: String,
    pub query: QueryParams,
    pub http_version: HttpVersion,

    // headers
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            method: HttpMethod::Get,
            target: "/".to_string(),
            path: "/".to_string(),
            query: QueryParams::new(),
            http_version: HttpVersion::V1_1,
            headers: HttpHeaders::new(),
            body: Vec::new(),
        }
    }

    /// Builds a GET for `target`, splitting path and query the way the parser does.
    pub fn get(target: &str) -> Self {
        let mut req = Self::new();
        req.set_target(target);
        req
    }

    pub fn set_target(&mut self, target: &str) {
        let (path, query) = split_target(target);
        self.target = target.to_string();
        self.path = path.to_string();
        self.query = query.map(parse_query).unwrap_or_default();
    }

    /// Sets a request header constrained to the allowed [`RequestHeader`] variants.
    ///
    /// This method acts as a safe wrapper around [`HttpHeaders::set_raw`],
    /// ensuring that only headers explicitly supported by [`RequestHeader`]
    /// can be added through this API.
    ///
    /// No validation is performed on the header value itself.
    pub fn set_header(&mut self, h: RequestHeader, value: &str) {
        let name = match h {
            RequestHeader::Host => "Host",
            RequestHeader::Accept => "Accept",
            RequestHeader::AcceptEncoding => "Accept-Encoding",
            RequestHeader::Connection => "Connection",
            RequestHeader::ContentLength => "Content-Length",
            RequestHeader::ContentType => "Content-Type",
            RequestHeader::UserAgent => "User-Agent",
        };

        self.headers.set_raw(name, value);
    }

    /// First value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Serializes the request line, headers and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let head = format!(
            "{} {} {}\r\n{}\r\n",
            self.method,
            self.target,
            self.http_version.as_str(),
            self.headers.stringify()
        );
        let mut out = Vec::with_capacity(head.len() + self.body.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn split_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

/// Parses `a=1&b=2&a=3` into an ordered multimap. `+` decodes to a space and
/// percent escapes are decoded; invalid UTF-8 is replaced rather than rejected.
pub fn parse_query(query: &str) -> QueryParams {
    let mut params = QueryParams::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(decode_component(name))
            .or_default()
            .push(decode_component(value));
    }
    params
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_keeps_multiplicity_and_order() {
        let q = parse_query("b=2&a=1&b=3&flag");
        let keys: Vec<_> = q.keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a", "flag"]);
        assert_eq!(q["b"], vec!["2", "3"]);
        assert_eq!(q["flag"], vec![""]);
    }

    #[test]
    fn query_values_are_percent_decoded() {
        let q = parse_query("name=Torsh%C3%A4lla&city=New+York");
        assert_eq!(q["name"], vec!["Torshälla"]);
        assert_eq!(q["city"], vec!["New York"]);
    }

    #[test]
    fn get_splits_path_and_query() {
        let req = HttpRequest::get("/GetWeather?lat=1&lon=2");
        assert_eq!(req.path, "/GetWeather");
        assert_eq!(req.query_param("lat"), Some("1"));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn to_bytes_emits_request_line_and_blank_line() {
        let mut req = HttpRequest::get("/x?y=1");
        req.set_header(RequestHeader::Host, "example.org");
        assert_eq!(
            req.to_bytes(),
            b"GET /x?y=1 HTTP/1.1\r\nHost: example.org\r\n\r\n".to_vec()
        );
    }
}
