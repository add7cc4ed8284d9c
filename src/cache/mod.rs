//! On-disk caches shared by the weather pipeline.
//!
//! Both caches are only ever touched from scheduler tasks, so they are plain
//! owned values inside [`ServerContext`](crate::context::ServerContext) with
//! no locking. Persistence always goes through [`write_atomic`].

pub mod coordinates;
pub mod weather;

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub use coordinates::{CoordinateCache, CoordinateEntry};
pub use weather::WeatherCache;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Cache key for a place name: trimmed and lowercased. Lowercasing folds the
/// Swedish capitals Å, Ä and Ö to å, ä and ö along with everything else.
pub fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Rounds to four decimal places, the precision every cache stores.
pub fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Writes `bytes` to `<path>.tmp`, then renames it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
    }

    let mut tmp_name = OsString::from(path.as_os_str());
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp).map_err(|e| CacheError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| CacheError::io(&tmp, e))?;
    file.sync_all().map_err(|e| CacheError::io(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| CacheError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_swedish_capitals() {
        assert_eq!(normalize("  ÅRE "), "åre");
        assert_eq!(normalize("Älmhult"), "älmhult");
        assert_eq!(normalize("ÖREBRO"), "örebro");
        assert_eq!(normalize("Torshälla"), "torshälla");
    }

    #[test]
    fn round4_keeps_four_decimals() {
        assert_eq!(round4(59.329_349), 59.3293);
        assert_eq!(round4(-18.068_66), -18.0687);
        assert_eq!(round4(59.33), 59.33);
    }

    #[test]
    fn write_atomic_leaves_no_tmp_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_atomic(&path, b"{}").unwrap();
        write_atomic(&path, b"{\"a\":1}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"a\":1}");
        assert!(!dir.path().join("nested").join("file.json.tmp").exists());
    }
}
