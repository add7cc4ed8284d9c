//! `/GetWeather`: the staged pipeline from query parameters to forecast JSON.
//!
//! Stages run in order, each either advancing immediately or yielding while
//! an upstream fetch is in flight:
//!
//! ```text
//! Init -> LookupCoordinates -> Geocode -> StoreCoordinates
//!      -> LookupWeather -> RateLimit -> Forecast -> Transform -> Deliver
//! ```
//!
//! Coordinate queries skip straight to `LookupWeather`. A fresh weather file
//! short-circuits to `Deliver`, as does every error.

use std::mem;
use std::task::Poll;

use tracing::{debug, info, warn};

use super::Backend;
use crate::cache::{normalize, round4};
use crate::context::ServerContext;
use crate::handler::responses;
use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;
use crate::http::status::HttpStatus;
use crate::net::client::{FetchError, HttpFetch};
use crate::provider::{self, Place};

const CITY_NOT_FOUND: &str = "City not found";
const MISSING_PARAMETERS: &str = "Missing or invalid parameters: expected name, or lat and lon";

enum Stage {
    Init,
    LookupCoordinates,
    Geocode(HttpFetch),
    StoreCoordinates(Place),
    LookupWeather,
    RateLimit,
    Forecast(HttpFetch),
    Transform(HttpResponse),
    Deliver(HttpResponse),
    Done,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::LookupCoordinates => "lookup-coordinates",
            Stage::Geocode(_) => "geocode",
            Stage::StoreCoordinates(_) => "store-coordinates",
            Stage::LookupWeather => "lookup-weather",
            Stage::RateLimit => "rate-limit",
            Stage::Forecast(_) => "forecast",
            Stage::Transform(_) => "transform",
            Stage::Deliver(_) => "deliver",
            Stage::Done => "done",
        }
    }
}

enum Advance {
    Next(Stage),
    Yield(Stage),
    Ready(HttpResponse),
}

pub struct WeatherPipeline {
    stage: Stage,
    raw_name: Option<String>,
    raw_lat: Option<String>,
    raw_lon: Option<String>,
    /// Normalized name, empty for coordinate queries.
    key: String,
    display_name: Option<String>,
    coords: Option<(f64, f64)>,
    retried: bool,
}

impl WeatherPipeline {
    pub fn from_request(req: &HttpRequest) -> Self {
        Self {
            stage: Stage::Init,
            raw_name: req.query_param("name").map(|s| s.trim().to_string()),
            raw_lat: req.query_param("lat").map(str::to_string),
            raw_lon: req.query_param("lon").map(str::to_string),
            key: String::new(),
            display_name: None,
            coords: None,
            retried: false,
        }
    }

    pub fn stage_name(&self) -> &'static str {
        self.stage.name()
    }

    fn advance(&mut self, stage: Stage, ctx: &mut ServerContext, now: u64) -> Advance {
        match stage {
            Stage::Init => self.init(),

            Stage::LookupCoordinates => {
                let name = self.raw_name.clone().unwrap_or_default();
                match ctx.coords.lookup(&name) {
                    Some(entry) => {
                        debug!(key = %self.key, "coordinate cache hit");
                        self.coords = Some((entry.latitude, entry.longitude));
                        self.display_name = Some(entry.name.clone());
                        Advance::Next(Stage::LookupWeather)
                    }
                    None => Advance::Next(start_geocode(ctx, &name, now)),
                }
            }

            Stage::Geocode(mut fetch) => match fetch.poll(now) {
                Poll::Pending => Advance::Yield(Stage::Geocode(fetch)),
                Poll::Ready(Err(e)) => Advance::Next(upstream_failure("geocode", &e)),
                Poll::Ready(Ok(res)) => match provider::parse_search(&res) {
                    Ok(Some(place)) => Advance::Next(Stage::StoreCoordinates(place)),
                    Ok(None) => self.no_results(ctx, now),
                    Err(e) => {
                        warn!(stage = "geocode", error = %e, "unusable geocoding payload");
                        Advance::Next(Stage::Deliver(responses::internal_server_error()))
                    }
                },
            },

            Stage::StoreCoordinates(place) => {
                let name = self.raw_name.clone().unwrap_or_default();
                if !ctx.coords.insert(&name, place.latitude, place.longitude, &place.name) {
                    info!(key = %self.key, "geocoder returned null island, treating as unknown");
                    return Advance::Next(Stage::Deliver(not_found()));
                }
                if let Err(e) = ctx.coords.save() {
                    warn!(error = %e, "coordinate cache not persisted");
                }
                self.coords = Some((round4(place.latitude), round4(place.longitude)));
                self.display_name = Some(place.name);
                Advance::Next(Stage::LookupWeather)
            }

            Stage::LookupWeather => {
                let Some((lat, lon)) = self.coords else {
                    return Advance::Next(Stage::Deliver(responses::internal_server_error()));
                };
                match ctx.weather.get(&self.key, lat, lon) {
                    Some(body) => {
                        debug!(key = %self.key, lat, lon, "weather cache hit");
                        Advance::Next(Stage::Deliver(HttpResponse::json(HttpStatus::OK, body)))
                    }
                    None => Advance::Next(Stage::RateLimit),
                }
            }

            Stage::RateLimit => {
                if !ctx.limiter.allow_at(now) {
                    info!(in_window = ctx.limiter.in_window(now), "forecast rate limit hit");
                    return Advance::Next(Stage::Deliver(responses::rate_limited()));
                }
                ctx.limiter.record_at(now);
                let Some((lat, lon)) = self.coords else {
                    return Advance::Next(Stage::Deliver(responses::internal_server_error()));
                };
                let url = provider::build_forecast_url(&ctx.config.upstream.forecast_url, lat, lon);
                match HttpFetch::new(&url, ctx.fetch_options(), now) {
                    Ok(fetch) => Advance::Next(Stage::Forecast(fetch)),
                    Err(e) => Advance::Next(upstream_failure("forecast", &e)),
                }
            }

            Stage::Forecast(mut fetch) => match fetch.poll(now) {
                Poll::Pending => Advance::Yield(Stage::Forecast(fetch)),
                Poll::Ready(Err(e)) => Advance::Next(upstream_failure("forecast", &e)),
                Poll::Ready(Ok(res)) => Advance::Next(Stage::Transform(res)),
            },

            Stage::Transform(res) => Advance::Next(Stage::Deliver(self.transform(ctx, &res))),

            Stage::Deliver(res) => Advance::Ready(res),

            Stage::Done => Advance::Ready(responses::internal_server_error()),
        }
    }

    fn init(&mut self) -> Advance {
        if let Some(name) = self.raw_name.as_deref().filter(|n| !n.is_empty()) {
            self.key = normalize(name);
            return Advance::Next(Stage::LookupCoordinates);
        }

        let lat = self.raw_lat.as_deref().and_then(|v| parse_coordinate(v, 90.0));
        let lon = self.raw_lon.as_deref().and_then(|v| parse_coordinate(v, 180.0));
        match (lat, lon) {
            (Some(lat), Some(lon)) => {
                self.coords = Some((round4(lat), round4(lon)));
                Advance::Next(Stage::LookupWeather)
            }
            _ => Advance::Next(Stage::Deliver(responses::bad_request(MISSING_PARAMETERS))),
        }
    }

    /// Zero geocoding results: one retry with `Å` spelled `ä`, then 404.
    fn no_results(&mut self, ctx: &ServerContext, now: u64) -> Advance {
        let name = self.raw_name.as_deref().unwrap_or_default();
        if !self.retried && name.contains('Å') {
            self.retried = true;
            let respelled = name.replace('Å', "ä");
            debug!(query = %respelled, "retrying geocode");
            return Advance::Next(start_geocode(ctx, &respelled, now));
        }
        info!(key = %self.key, "unknown city");
        Advance::Next(Stage::Deliver(not_found()))
    }

    fn transform(&self, ctx: &ServerContext, res: &HttpResponse) -> HttpResponse {
        let mut report = match provider::parse_forecast(res) {
            Ok(report) => report,
            Err(e) => {
                warn!(stage = "forecast", error = %e, "unusable forecast payload");
                return responses::internal_server_error();
            }
        };
        report.name = self.display_name.clone();
        let body = match report.to_json() {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "forecast serialization failed");
                return responses::internal_server_error();
            }
        };

        if let Some((lat, lon)) = self.coords {
            match ctx.weather.set(&self.key, lat, lon, &body) {
                Ok(path) => debug!(path = %path.display(), "weather cached"),
                Err(e) => warn!(error = %e, "weather cache write failed"),
            }
        }
        HttpResponse::json(HttpStatus::OK, body)
    }
}

impl Backend for WeatherPipeline {
    fn poll(&mut self, ctx: &mut ServerContext, now: u64) -> Poll<HttpResponse> {
        loop {
            let stage = mem::replace(&mut self.stage, Stage::Done);
            match self.advance(stage, ctx, now) {
                Advance::Next(next) => self.stage = next,
                Advance::Yield(next) => {
                    self.stage = next;
                    return Poll::Pending;
                }
                Advance::Ready(res) => return Poll::Ready(res),
            }
        }
    }
}

fn start_geocode(ctx: &ServerContext, name: &str, now: u64) -> Stage {
    let url = provider::build_search_url(&ctx.config.upstream.geocoding_url, name);
    match HttpFetch::new(&url, ctx.fetch_options(), now) {
        Ok(fetch) => Stage::Geocode(fetch),
        Err(e) => upstream_failure("geocode", &e),
    }
}

fn upstream_failure(stage: &'static str, err: &FetchError) -> Stage {
    warn!(stage, kind = err.kind(), error = %err, "upstream call failed");
    Stage::Deliver(responses::internal_server_error())
}

fn not_found() -> HttpResponse {
    HttpResponse::text(HttpStatus::NOT_FOUND, CITY_NOT_FOUND)
}

fn parse_coordinate(raw: &str, limit: f64) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && v.abs() <= limit)
}
