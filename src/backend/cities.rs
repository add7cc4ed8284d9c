//! `/GetCities`: the built-in Swedish city list, extended from disk.
//!
//! Files under `<cache>/cities/*.json` hold either one `{name, latitude,
//! longitude}` object or an array of them. A disk entry whose normalized
//! name matches a built-in city replaces its coordinates.

use std::fs;
use std::path::{Path, PathBuf};
use std::task::Poll;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Backend;
use crate::cache::normalize;
use crate::context::ServerContext;
use crate::handler::responses;
use crate::http::response::HttpResponse;
use crate::http::status::HttpStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct City {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

const SWEDISH_CITIES: &[(&str, f64, f64)] = &[
    ("Stockholm", 59.3293, 18.0686),
    ("Göteborg", 57.7089, 11.9746),
    ("Malmö", 55.6050, 13.0038),
    ("Uppsala", 59.8586, 17.6389),
    ("Västerås", 59.6099, 16.5448),
    ("Örebro", 59.2741, 15.2066),
    ("Linköping", 58.4108, 15.6214),
    ("Helsingborg", 56.0465, 12.6945),
    ("Jönköping", 57.7826, 14.1618),
    ("Norrköping", 58.5877, 16.1924),
    ("Lund", 55.7047, 13.1910),
    ("Umeå", 63.8258, 20.2630),
    ("Gävle", 60.6749, 17.1413),
    ("Borås", 57.7210, 12.9401),
    ("Södertälje", 59.1955, 17.6253),
    ("Eskilstuna", 59.3666, 16.5077),
    ("Halmstad", 56.6745, 12.8578),
    ("Växjö", 56.8777, 14.8091),
    ("Karlstad", 59.4022, 13.5115),
    ("Sundsvall", 62.3908, 17.3069),
    ("Östersund", 63.1792, 14.6357),
    ("Luleå", 65.5848, 22.1567),
    ("Kiruna", 67.8558, 20.2253),
    ("Visby", 57.6348, 18.2948),
];

static BUILT_IN: Lazy<Vec<City>> = Lazy::new(|| {
    SWEDISH_CITIES
        .iter()
        .map(|&(name, latitude, longitude)| City {
            name: name.to_string(),
            latitude,
            longitude,
        })
        .collect()
});

pub fn built_in() -> &'static [City] {
    &BUILT_IN
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CityFile {
    Many(Vec<City>),
    One(City),
}

/// Built-in cities merged with every readable JSON file in `dir`. A missing
/// directory is not an error.
pub fn load(dir: &Path) -> Vec<City> {
    let mut cities = built_in().to_vec();

    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect(),
        Err(_) => return cities,
    };
    files.sort();

    for path in files {
        let parsed = fs::read(&path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice::<CityFile>(&bytes).map_err(|e| e.to_string()));
        let extra = match parsed {
            Ok(CityFile::Many(list)) => list,
            Ok(CityFile::One(city)) => vec![city],
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping city file");
                continue;
            }
        };
        debug!(path = %path.display(), count = extra.len(), "city file loaded");
        for city in extra {
            merge(&mut cities, city);
        }
    }
    cities
}

fn merge(cities: &mut Vec<City>, city: City) {
    let key = normalize(&city.name);
    match cities.iter_mut().find(|c| normalize(&c.name) == key) {
        Some(existing) => {
            existing.latitude = city.latitude;
            existing.longitude = city.longitude;
        }
        None => cities.push(city),
    }
}

pub struct CitiesBackend;

impl Backend for CitiesBackend {
    fn poll(&mut self, ctx: &mut ServerContext, _now: u64) -> Poll<HttpResponse> {
        let res = match serde_json::to_vec(&ctx.cities) {
            Ok(body) => HttpResponse::json(HttpStatus::OK, body),
            Err(e) => {
                warn!(error = %e, "city list serialization failed");
                responses::internal_server_error()
            }
        };
        Poll::Ready(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_list_contains_stockholm() {
        let json = serde_json::to_string(built_in()).unwrap();
        assert!(json.starts_with('['));
        assert!(json.contains(r#"{"name":"Stockholm","latitude":59.3293,"longitude":18.0686}"#));
    }

    #[test]
    fn disk_files_extend_and_override() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a.json"),
            r#"[{"name":"Torshälla","latitude":59.4167,"longitude":16.4667},
                {"name":"STOCKHOLM","latitude":59.0,"longitude":18.0}]"#,
        )
        .unwrap();
        fs::write(dir.path().join("b.json"), r#"{"name":"Åre","latitude":63.399,"longitude":13.0815}"#).unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let cities = load(dir.path());
        assert_eq!(cities.len(), built_in().len() + 2);
        let stockholm = cities.iter().find(|c| c.name == "Stockholm").unwrap();
        assert_eq!(stockholm.latitude, 59.0);
        assert!(cities.iter().any(|c| c.name == "Åre"));
    }

    #[test]
    fn missing_directory_gives_built_in_list() {
        assert_eq!(load(Path::new("/no/such/dir")).len(), built_in().len());
    }
}
