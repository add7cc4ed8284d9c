//! `/GetSurprise`: a random file from the surprise directory, served as PNG.

use std::fs;
use std::path::{Path, PathBuf};
use std::task::Poll;

use rand::seq::IndexedRandom;
use tracing::{debug, warn};

use super::Backend;
use crate::context::ServerContext;
use crate::handler::responses;
use crate::http::response::{HttpResponse, IMAGE_PNG};
use crate::http::status::HttpStatus;

#[derive(Debug, thiserror::Error)]
pub enum SurpriseError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no files in {0}")]
    Empty(PathBuf),
}

/// Regular files directly under `dir`.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>, SurpriseError> {
    let entries = fs::read_dir(dir).map_err(|source| SurpriseError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    Ok(entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .map(|e| e.path())
        .collect())
}

/// Reads one file from `dir`, picked uniformly at random.
pub fn pick_random_file(dir: &Path) -> Result<(PathBuf, Vec<u8>), SurpriseError> {
    let files = list_files(dir)?;
    let path = files
        .choose(&mut rand::rng())
        .ok_or_else(|| SurpriseError::Empty(dir.to_path_buf()))?;
    let bytes = fs::read(path).map_err(|source| SurpriseError::Io {
        path: path.clone(),
        source,
    })?;
    Ok((path.clone(), bytes))
}

pub struct SurpriseBackend;

impl Backend for SurpriseBackend {
    fn poll(&mut self, ctx: &mut ServerContext, _now: u64) -> Poll<HttpResponse> {
        let res = match pick_random_file(&ctx.config.surprise_dir) {
            Ok((path, bytes)) => {
                debug!(path = %path.display(), bytes = bytes.len(), "surprise picked");
                HttpResponse::with_body(HttpStatus::OK, IMAGE_PNG, bytes)
            }
            Err(e) => {
                warn!(error = %e, "no surprise available");
                responses::internal_server_error()
            }
        };
        Poll::Ready(res)
    }
}
