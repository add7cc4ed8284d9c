//! Place-name search against the geocoding API.

use serde::{Deserialize, Serialize};

use super::ProviderError;
use crate::http::response::HttpResponse;

/// `<base>?name=<name>&count=1&language=en&format=json`, with `name`
/// percent-encoded.
pub fn build_search_url(base_url: &str, name: &str) -> String {
    format!(
        "{}?name={}&count=1&language=en&format=json",
        base_url.trim_end_matches('/'),
        urlencoding::encode(name)
    )
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    /// Absent when nothing matched.
    #[serde(default)]
    pub results: Vec<Place>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub population: Option<u64>,
    #[serde(default)]
    pub admin1: Option<String>,
    #[serde(default)]
    pub admin2: Option<String>,
    #[serde(default)]
    pub admin3: Option<String>,
    #[serde(default)]
    pub admin4: Option<String>,
}

/// Best match, or `None` when the search came back empty.
pub fn parse_search(response: &HttpResponse) -> Result<Option<Place>, ProviderError> {
    let parsed: SearchResponse = serde_json::from_slice(&response.body)?;
    Ok(parsed.results.into_iter().next())
}
