use crate::backend::BackendKind;
use crate::handler::responses;
use crate::http::HttpMethod;
use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;

/// What the connection should do with a parsed request.
#[derive(Debug)]
pub enum Dispatch {
    /// Answer right away.
    Respond(HttpResponse),
    /// Hand the request to a backend task and wait for its response.
    Backend(BackendKind),
}

pub fn route(req: &HttpRequest) -> Dispatch {
    match (&req.method, req.path.as_str()) {
        (HttpMethod::Get, "/GetCities") => Dispatch::Backend(BackendKind::Cities),
        (HttpMethod::Get, "/GetWeather") => Dispatch::Backend(BackendKind::Weather),
        (HttpMethod::Get, "/GetSurprise") => Dispatch::Backend(BackendKind::Surprise),

        (HttpMethod::Get, _) => Dispatch::Respond(responses::not_found()),
        (HttpMethod::Options, _) => Dispatch::Respond(responses::no_content()),
        _ => Dispatch::Respond(responses::method_not_allowed()),
    }
}
