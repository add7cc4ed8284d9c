//! Current conditions from the forecast API.
//!
//! The upstream reply is parsed into [`WeatherReport`] and re-serialized as
//! compact JSON; that canonical form is what gets cached and served.

use serde::{Deserialize, Serialize};

use super::ProviderError;
use crate::http::response::HttpResponse;

pub const CURRENT_FIELDS: &str = "temperature_2m,relative_humidity_2m,apparent_temperature,is_day,\
precipitation,rain,showers,snowfall,weather_code,cloud_cover,pressure_msl,surface_pressure,\
wind_speed_10m,wind_direction_10m,wind_gusts_10m";

/// Coordinates are always written with four decimals.
pub fn build_forecast_url(base_url: &str, latitude: f64, longitude: f64) -> String {
    format!(
        "{}?latitude={:.4}&longitude={:.4}&current={}",
        base_url.trim_end_matches('/'),
        latitude,
        longitude,
        CURRENT_FIELDS
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    /// Canonical place name, when the request named one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub generationtime_ms: f64,
    #[serde(default)]
    pub utc_offset_seconds: i64,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub timezone_abbreviation: String,
    #[serde(default)]
    pub elevation: f64,
    pub current_units: CurrentUnits,
    pub current: Current,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentUnits {
    pub time: String,
    pub interval: String,
    pub temperature_2m: String,
    pub relative_humidity_2m: String,
    pub apparent_temperature: String,
    pub is_day: String,
    pub precipitation: String,
    pub rain: String,
    pub showers: String,
    pub snowfall: String,
    pub weather_code: String,
    pub cloud_cover: String,
    pub pressure_msl: String,
    pub surface_pressure: String,
    pub wind_speed_10m: String,
    pub wind_direction_10m: String,
    pub wind_gusts_10m: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Current {
    pub time: String,
    pub interval: i64,
    pub temperature_2m: Option<f64>,
    pub relative_humidity_2m: Option<f64>,
    pub apparent_temperature: Option<f64>,
    pub is_day: Option<u8>,
    pub precipitation: Option<f64>,
    pub rain: Option<f64>,
    pub showers: Option<f64>,
    pub snowfall: Option<f64>,
    pub weather_code: Option<u16>,
    pub cloud_cover: Option<f64>,
    pub pressure_msl: Option<f64>,
    pub surface_pressure: Option<f64>,
    pub wind_speed_10m: Option<f64>,
    pub wind_direction_10m: Option<f64>,
    pub wind_gusts_10m: Option<f64>,
}

pub fn parse_forecast(response: &HttpResponse) -> Result<WeatherReport, ProviderError> {
    Ok(serde_json::from_slice(&response.body)?)
}

impl WeatherReport {
    pub fn to_json(&self) -> Result<Vec<u8>, ProviderError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::http::status::HttpStatus;

    pub(crate) const SAMPLE: &str = r#"{
        "latitude": 59.42, "longitude": 16.46, "generationtime_ms": 0.05,
        "utc_offset_seconds": 0, "timezone": "GMT", "timezone_abbreviation": "GMT",
        "elevation": 14.0,
        "current_units": {"time": "iso8601", "interval": "seconds", "temperature_2m": "°C",
            "relative_humidity_2m": "%", "apparent_temperature": "°C", "is_day": "",
            "precipitation": "mm", "rain": "mm", "showers": "mm", "snowfall": "cm",
            "weather_code": "wmo code", "cloud_cover": "%", "pressure_msl": "hPa",
            "surface_pressure": "hPa", "wind_speed_10m": "km/h", "wind_direction_10m": "°",
            "wind_gusts_10m": "km/h"},
        "current": {"time": "2026-10-19T10:15", "interval": 900, "temperature_2m": 7.4,
            "relative_humidity_2m": 81, "apparent_temperature": 4.9, "is_day": 1,
            "precipitation": 0.0, "rain": 0.0, "showers": 0.0, "snowfall": 0.0,
            "weather_code": 3, "cloud_cover": 100, "pressure_msl": 1012.3,
            "surface_pressure": 1010.6, "wind_speed_10m": 11.2, "wind_direction_10m": 229,
            "wind_gusts_10m": 24.1}
    }"#;

    #[test]
    fn url_uses_four_decimals() {
        let url = build_forecast_url("http://api.open-meteo.com/v1/forecast", 59.33, 18.07);
        assert!(url.starts_with(
            "http://api.open-meteo.com/v1/forecast?latitude=59.3300&longitude=18.0700&current=temperature_2m,"
        ));
        assert!(url.ends_with("wind_direction_10m,wind_gusts_10m"));
        assert_eq!(CURRENT_FIELDS.split(',').count(), 15);
    }

    #[test]
    fn parses_and_serializes_compactly() {
        let res = HttpResponse::json(HttpStatus::OK, SAMPLE.as_bytes().to_vec());
        let mut report = parse_forecast(&res).unwrap();
        assert_eq!(report.current.weather_code, Some(3));
        assert_eq!(report.current_units.temperature_2m, "°C");
        assert_eq!(report.current.relative_humidity_2m, Some(81.0));

        report.name = Some("Torshälla".into());
        let json = String::from_utf8(report.to_json().unwrap()).unwrap();
        assert!(json.starts_with(r#"{"name":"Torshälla","latitude":59.42,"longitude":16.46,"#));
        assert!(!json.contains('\n'));

        let again: WeatherReport = serde_json::from_str(&json).unwrap();
        assert_eq!(again, report);
    }

    #[test]
    fn missing_current_block_is_an_error() {
        let res = HttpResponse::json(HttpStatus::OK, br#"{"latitude":1.0,"longitude":2.0}"#.to_vec());
        assert!(parse_forecast(&res).is_err());
    }
}
