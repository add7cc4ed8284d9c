pub mod middleware;
pub mod responses;
pub mod router;

pub use middleware::Middleware;
pub use router::Dispatch;

use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;
use crate::http::status::HttpStatus;

pub fn handle_request(req: &HttpRequest) -> Dispatch {
    router::route(req)
}

pub fn handle_error(err: HttpStatus) -> HttpResponse {
    responses::any_error(err)
}
