//! Forecast JSON cached per location on disk.
//!
//! One file per `(normalized name, lat, lon)`, named
//! `<normalized>-<lat4>-<lon4>.json`. The provider publishes new data on UTC
//! quarter hours, so a file is current iff it was written at or after the
//! most recent quarter-hour boundary; older files are stale whatever their age.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{CacheError, write_atomic};

const QUARTER_HOUR_SECS: i64 = 15 * 60;

#[derive(Debug, Clone)]
pub struct WeatherCache {
    dir: PathBuf,
}

impl WeatherCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str, latitude: f64, longitude: f64) -> PathBuf {
        self.dir
            .join(format!("{}-{:.4}-{:.4}.json", file_stem(key), latitude, longitude))
    }

    /// Cached body, if present and written since the last quarter hour.
    pub fn get(&self, key: &str, latitude: f64, longitude: f64) -> Option<Vec<u8>> {
        self.get_at(key, latitude, longitude, Utc::now())
    }

    pub fn get_at(&self, key: &str, latitude: f64, longitude: f64, now: DateTime<Utc>) -> Option<Vec<u8>> {
        let path = self.path_for(key, latitude, longitude);
        let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => DateTime::<Utc>::from(modified),
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "weather cache stat failed");
                return None;
            }
        };
        if !is_fresh(modified, now) {
            debug!(path = %path.display(), "weather cache entry is stale");
            return None;
        }
        match fs::read(&path) {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "weather cache read failed");
                None
            }
        }
    }

    pub fn set(&self, key: &str, latitude: f64, longitude: f64, body: &[u8]) -> Result<PathBuf, CacheError> {
        let path = self.path_for(key, latitude, longitude);
        write_atomic(&path, body)?;
        Ok(path)
    }

    /// Deletes one entry. `Ok(false)` when there was nothing to delete.
    pub fn remove(&self, key: &str, latitude: f64, longitude: f64) -> Result<bool, CacheError> {
        let path = self.path_for(key, latitude, longitude);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }

    /// Deletes `.json` files last modified more than `max_age` ago.
    pub fn evict_older_than(&self, max_age: Duration) -> Result<usize, CacheError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CacheError::io(&self.dir, e)),
        };
        let now = SystemTime::now();
        let mut evicted = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age {
                match fs::remove_file(&path) {
                    Ok(()) => evicted += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "eviction failed"),
                }
            }
        }
        Ok(evicted)
    }
}

/// The most recent UTC quarter hour (`:00`, `:15`, `:30`, `:45`) at or before `now`.
pub fn quarter_hour_floor(now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = now.timestamp();
    let floored = secs - secs.rem_euclid(QUARTER_HOUR_SECS);
    DateTime::from_timestamp(floored, 0).unwrap_or(now)
}

pub fn is_fresh(modified: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    modified >= quarter_hour_floor(now)
}

/// Keeps names usable as a single path component.
fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, h, m, s).unwrap()
    }

    #[test]
    fn floor_snaps_to_quarter_hours() {
        assert_eq!(quarter_hour_floor(at(10, 14, 59)), at(10, 0, 0));
        assert_eq!(quarter_hour_floor(at(10, 15, 0)), at(10, 15, 0));
        assert_eq!(quarter_hour_floor(at(10, 44, 1)), at(10, 30, 0));
        assert_eq!(quarter_hour_floor(at(10, 59, 59)), at(10, 45, 0));
    }

    #[test]
    fn boundary_makes_previous_entry_stale() {
        let written = at(0, 14, 59);
        assert!(is_fresh(written, at(0, 14, 59)));
        assert!(!is_fresh(written, at(0, 15, 0)));
        assert!(is_fresh(at(0, 15, 0), at(0, 15, 0)));
    }

    #[test]
    fn path_uses_four_decimals() {
        let cache = WeatherCache::new("cache/weather");
        assert_eq!(
            cache.path_for("", 59.33, 18.07),
            PathBuf::from("cache/weather/-59.3300-18.0700.json")
        );
        assert_eq!(
            cache.path_for("torshälla", 59.4167, 16.4667),
            PathBuf::from("cache/weather/torshälla-59.4167-16.4667.json")
        );
        assert_eq!(
            cache.path_for("a/b", 1.0, 2.0),
            PathBuf::from("cache/weather/a_b-1.0000-2.0000.json")
        );
    }

    #[test]
    fn set_then_get_within_the_same_quarter() {
        let dir = tempfile::tempdir().unwrap();
        let cache = WeatherCache::new(dir.path());
        cache.set("kiruna", 67.8558, 20.2253, b"{\"t\":1}").unwrap();
        assert_eq!(cache.get("kiruna", 67.8558, 20.2253), Some(b"{\"t\":1}".to_vec()));
        assert_eq!(cache.get("kiruna", 67.0, 20.2253), None);
    }

    #[test]
    fn old_file_is_not_served() {
        let dir = tempfile::tempdir().unwrap();
        let cache = WeatherCache::new(dir.path());
        let path = cache.set("luleå", 65.5848, 22.1567, b"{}").unwrap();
        let old = SystemTime::now() - Duration::from_secs(16 * 60);
        fs::File::options().write(true).open(&path).unwrap().set_modified(old).unwrap();
        assert_eq!(cache.get("luleå", 65.5848, 22.1567), None);
    }

    #[test]
    fn remove_and_evict() {
        let dir = tempfile::tempdir().unwrap();
        let cache = WeatherCache::new(dir.path());
        cache.set("a", 1.0, 1.0, b"{}").unwrap();
        let old = cache.set("b", 2.0, 2.0, b"{}").unwrap();
        cache.set("c", 3.0, 3.0, b"{}").unwrap();

        assert!(cache.remove("a", 1.0, 1.0).unwrap());
        assert!(!cache.remove("a", 1.0, 1.0).unwrap());

        let past = SystemTime::now() - Duration::from_secs(7200);
        fs::File::options().write(true).open(&old).unwrap().set_modified(past).unwrap();
        assert_eq!(cache.evict_older_than(Duration::from_secs(3600)).unwrap(), 1);
        assert!(!old.exists());
        assert!(cache.path_for("c", 3.0, 3.0).exists());
    }
}
