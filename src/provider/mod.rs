//! Upstream weather provider: URL builders and response models.
//!
//! Each endpoint is split into a `build_*` function producing the URL and a
//! `parse_*` function consuming the fetched response; the I/O in between is
//! done by [`HttpFetch`](crate::net::client::HttpFetch).

pub mod forecast;
pub mod geocoding;

pub use forecast::{WeatherReport, build_forecast_url, parse_forecast};
pub use geocoding::{Place, build_search_url, parse_search};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unexpected provider payload: {0}")]
    Json(#[from] serde_json::Error),
}
