//! State shared by every task on the scheduler.
//!
//! There is one `ServerContext` per process. Tasks reach it through
//! [`Context::shared`](crate::runtime::Context) during their step and must not
//! keep borrows into it across steps.

use std::sync::Arc;

use tracing::info;

use crate::backend::cities::{self, City};
use crate::cache::{CacheError, CoordinateCache, WeatherCache};
use crate::config::ServerConfig;
use crate::http::response::HttpResponse;
use crate::net::client::FetchOptions;
use crate::ratelimit::RateLimiter;
use crate::runtime::{Context, Scheduler};

/// Tasks exchange finished responses; a backend posts one to its connection.
pub type ServerScheduler = Scheduler<ServerContext, HttpResponse>;
pub type TaskContext<'a> = Context<'a, ServerContext, HttpResponse>;

pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub coords: CoordinateCache,
    pub weather: WeatherCache,
    pub limiter: RateLimiter,
    pub cities: Vec<City>,
}

impl ServerContext {
    /// Loads the coordinate cache and the city list from the cache directory.
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, CacheError> {
        let coords = CoordinateCache::load(config.coordinates_file())?;
        let weather = WeatherCache::new(config.weather_dir());
        let limiter = RateLimiter::new(
            config.rate_limit.permits,
            config.rate_limit.window.as_millis() as u64,
        );
        let cities = cities::load(&config.cities_dir());
        info!(
            coordinates = coords.len(),
            cities = cities.len(),
            cache = %config.cache_dir.display(),
            "server context ready"
        );
        Ok(Self {
            config,
            coords,
            weather,
            limiter,
            cities,
        })
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions::from_config(&self.config.upstream)
    }
}
