//! In-memory map from normalized place name to coordinates, persisted as CSV.
//!
//! File format, one entry per line:
//!
//! ```text
//! Torshälla,59.4167,16.4667
//! ```
//!
//! The first field is the display name; the key is re-derived from it on
//! load. Lines without two commas, or with unparsable numbers, are skipped.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::{debug, warn};

use super::{CacheError, normalize, round4, write_atomic};

const INITIAL_CAPACITY: usize = 256;
const NEAR_ZERO: f64 = 1e-4;

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateEntry {
    pub key: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug)]
pub struct CoordinateCache {
    path: PathBuf,
    entries: Vec<CoordinateEntry>,
}

impl CoordinateCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Reads the CSV at `path`. A missing file yields an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let mut cache = Self::new(path);
        let content = match fs::read_to_string(&cache.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(cache),
            Err(e) => return Err(CacheError::io(&cache.path, e)),
        };

        for (lineno, line) in content.lines().enumerate() {
            match parse_line(line) {
                Some((name, lat, lon)) => {
                    if !cache.insert(name, lat, lon, name) {
                        debug!(line = lineno + 1, "skipping near-zero coordinates");
                    }
                }
                None if line.trim().is_empty() => {}
                None => warn!(path = %cache.path.display(), line = lineno + 1, "skipping malformed coordinate line"),
            }
        }
        Ok(cache)
    }

    /// Writes every entry, one per key, through a tmp file and rename.
    pub fn save(&self) -> Result<(), CacheError> {
        let mut out = String::new();
        let mut seen: Vec<&str> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            if seen.contains(&entry.key.as_str()) {
                continue;
            }
            seen.push(&entry.key);
            out.push_str(&format!(
                "{},{:.4},{:.4}\n",
                entry.name, entry.latitude, entry.longitude
            ));
        }
        write_atomic(&self.path, out.as_bytes())
    }

    pub fn lookup(&self, name: &str) -> Option<&CoordinateEntry> {
        let key = normalize(name);
        self.entries.iter().find(|e| e.key == key)
    }

    /// Inserts or updates the entry for `name`. Refuses coordinates where
    /// both components are within 1e-4 of zero.
    pub fn insert(&mut self, name: &str, latitude: f64, longitude: f64, canonical: &str) -> bool {
        if latitude.abs() < NEAR_ZERO && longitude.abs() < NEAR_ZERO {
            return false;
        }
        if !latitude.is_finite() || !longitude.is_finite() {
            return false;
        }

        let key = normalize(name);
        let latitude = round4(latitude);
        let longitude = round4(longitude);

        if let Some(existing) = self.entries.iter_mut().find(|e| e.key == key) {
            existing.name = canonical.to_string();
            existing.latitude = latitude;
            existing.longitude = longitude;
            return true;
        }

        if self.entries.len() == self.entries.capacity() {
            let grow = self.entries.capacity().max(INITIAL_CAPACITY);
            self.entries.reserve_exact(grow);
        }
        self.entries.push(CoordinateEntry {
            key,
            name: canonical.to_string(),
            latitude,
            longitude,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoordinateEntry> {
        self.entries.iter()
    }
}

fn parse_line(line: &str) -> Option<(&str, f64, f64)> {
    let mut fields = line.trim_end_matches('\r').rsplitn(3, ',');
    let lon = fields.next()?.trim().parse().ok()?;
    let lat = fields.next()?.trim().parse().ok()?;
    let name = fields.next()?.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, lat, lon))
}
