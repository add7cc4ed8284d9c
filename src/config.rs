use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 10480;
pub const DEFAULT_TLS_PORT: u16 = 10443;
pub const READ_BUFFER_SIZE: usize = 4096;
pub const WRITE_BUFFER_INITIAL_SIZE: usize = 4096;
pub const CONNECTION_TIMEOUT_MS: u64 = 1000;
pub const ACCEPT_BATCH: usize = 16;
pub const UPSTREAM_MAX_RESPONSE: usize = 5 * 1024 * 1024;
pub const RATE_LIMIT_PERMITS: usize = 30;
pub const RATE_LIMIT_WINDOW_MS: u64 = 60_000;
pub const URL_LENGTH_LIMIT: usize = 256;
pub const SCHEDULER_CAPACITY: usize = 1000;

pub const GEOCODING_BASE_URL: &str = "http://geocoding-api.open-meteo.com/v1/search";
pub const FORECAST_BASE_URL: &str = "http://api.open-meteo.com/v1/forecast";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    pub port: u16,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_TLS_PORT,
            cert: PathBuf::from("certs/server.pem"),
            key: PathBuf::from("certs/server.key"),
        }
    }
}

/// Sliding window over recent accepts; a batch is dropped once the window is full.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AcceptRateConfig {
    pub max_accepts: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    pub geocoding_url: String,
    pub forecast_url: String,

    #[serde(deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,

    #[serde(deserialize_with = "deserialize_duration")]
    pub total_timeout: Duration,

    pub max_response_size: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            geocoding_url: GEOCODING_BASE_URL.to_string(),
            forecast_url: FORECAST_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(3),
            total_timeout: Duration::from_secs(10),
            max_response_size: UPSTREAM_MAX_RESPONSE,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub permits: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            permits: RATE_LIMIT_PERMITS,
            window: Duration::from_millis(RATE_LIMIT_WINDOW_MS),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
    pub tls: Option<TlsConfig>,

    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_url_size: usize,
    pub strict_protocol: bool,

    #[serde(deserialize_with = "deserialize_duration")]
    pub connection_timeout: Duration,

    pub accept_batch: usize,
    pub accept_rate: Option<AcceptRateConfig>,

    pub scheduler_capacity: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub idle_sleep: Duration,

    pub upstream: UpstreamConfig,
    pub rate_limit: RateLimitConfig,

    pub cache_dir: PathBuf,
    pub surprise_dir: PathBuf,

    #[serde(deserialize_with = "deserialize_opt_duration")]
    pub weather_cache_max_age: Option<Duration>,

    pub cors: bool,
    pub cors_origin: String,
    pub compression: bool,

    pub server_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: DEFAULT_PORT,
            tls: None,

            read_buffer_size: READ_BUFFER_SIZE,
            write_buffer_size: WRITE_BUFFER_INITIAL_SIZE,
            max_url_size: URL_LENGTH_LIMIT,
            strict_protocol: true,

            connection_timeout: Duration::from_millis(CONNECTION_TIMEOUT_MS),

            accept_batch: ACCEPT_BATCH,
            accept_rate: None,

            scheduler_capacity: SCHEDULER_CAPACITY,
            idle_sleep: Duration::from_micros(100),

            upstream: UpstreamConfig::default(),
            rate_limit: RateLimitConfig::default(),

            cache_dir: PathBuf::from("cache"),
            surprise_dir: PathBuf::from("resources/surprise"),

            weather_cache_max_age: None,

            cors: false,
            cors_origin: "*".to_string(),
            compression: false,

            server_name: "stormnet/0.1".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<ServerConfig>(content)
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_buffer_size < 4 {
            return Err(ConfigError::Invalid("read_buffer_size must be at least 4".into()));
        }
        if self.accept_batch == 0 {
            return Err(ConfigError::Invalid("accept_batch must be positive".into()));
        }
        if self.scheduler_capacity < 2 {
            return Err(ConfigError::Invalid("scheduler_capacity must be at least 2".into()));
        }
        if self.rate_limit.permits == 0 {
            return Err(ConfigError::Invalid("rate_limit.permits must be positive".into()));
        }
        if let Some(tls) = &self.tls {
            if tls.port == self.port {
                return Err(ConfigError::Invalid("tls.port must differ from port".into()));
            }
        }
        Ok(())
    }

    pub fn connection_timeout_ms(&self) -> u64 {
        self.connection_timeout.as_millis() as u64
    }

    pub fn coordinates_file(&self) -> PathBuf {
        self.cache_dir.join("location_cordinates.csv")
    }

    pub fn weather_dir(&self) -> PathBuf {
        self.cache_dir.join("weather")
    }

    pub fn cities_dir(&self) -> PathBuf {
        self.cache_dir.join("cities")
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = Option::<f64>::deserialize(deserializer)?;
    secs.map(|s| Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom))
        .transpose()
}
