use crate::http::response::{HttpResponse, TEXT_PLAIN};
use crate::http::status::HttpStatus;

pub const INVALID_REQUEST_BODY: &str = "Invalid request received";
pub const RATE_LIMITED_BODY: &str = r#"{"error":"Rate limit exceeded. Please try again later."}"#;

pub fn invalid_request(status: HttpStatus) -> HttpResponse {
    HttpResponse::text(status, INVALID_REQUEST_BODY)
}

pub fn bad_request(message: &str) -> HttpResponse {
    HttpResponse::text(HttpStatus::BAD_REQUEST, message)
}

pub fn not_found() -> HttpResponse {
    HttpResponse::text(HttpStatus::NOT_FOUND, "Not Found")
}

pub fn method_not_allowed() -> HttpResponse {
    HttpResponse::text(HttpStatus::METHOD_NOT_ALLOWED, "Method Not Allowed")
}

pub fn payload_too_large() -> HttpResponse {
    HttpResponse::text(HttpStatus::PAYLOAD_TOO_LARGE, "Request header too large")
}

pub fn internal_server_error() -> HttpResponse {
    HttpResponse::text(HttpStatus::INTERNAL_SERVER_ERROR, "Internal Server Error")
}

/// `204` with an explicit zero length.
pub fn no_content() -> HttpResponse {
    let mut res = HttpResponse::new(HttpStatus::NO_CONTENT);
    res.set_body(Vec::new());
    res
}

pub fn rate_limited() -> HttpResponse {
    HttpResponse::json(HttpStatus::OK, RATE_LIMITED_BODY.as_bytes().to_vec())
}

pub fn any_error(err: HttpStatus) -> HttpResponse {
    match err {
        HttpStatus::BAD_REQUEST | HttpStatus::URI_TOO_LONG => invalid_request(err),
        HttpStatus::NOT_FOUND => not_found(),
        HttpStatus::METHOD_NOT_ALLOWED => method_not_allowed(),
        HttpStatus::PAYLOAD_TOO_LARGE => payload_too_large(),
        HttpStatus::INTERNAL_SERVER_ERROR => internal_server_error(),
        _ => HttpResponse::with_body(err, TEXT_PLAIN, err.reason().as_bytes().to_vec()),
    }
}
