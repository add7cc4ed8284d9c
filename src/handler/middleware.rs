use flate2::Compression;
use flate2::write::{DeflateEncoder, GzEncoder};
use std::io::Write;
use std::time::SystemTime;

use tracing::warn;

use crate::config::ServerConfig;
use crate::http::request::HttpRequest;
use crate::http::response::{HttpResponse, ResponseHeader};

// Body encodings this server can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    Gzip,
    Deflate,
    Identity,
}

impl CompressionAlgorithm {
    pub fn as_str(&self) -> &str {
        match self {
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Deflate => "deflate",
            CompressionAlgorithm::Identity => "identity",
        }
    }

    /// Picks gzip, then deflate, from an `Accept-Encoding` value. Codings
    /// with `q=0` are refused.
    pub fn negotiate(accept_encoding: &str) -> CompressionAlgorithm {
        let mut gzip = false;
        let mut deflate = false;
        for item in accept_encoding.split(',') {
            let mut parts = item.split(';');
            let coding = parts.next().unwrap_or("").trim().to_ascii_lowercase();
            let refused = parts.any(|p| {
                let p = p.trim();
                p.strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            if refused {
                continue;
            }
            match coding.as_str() {
                "gzip" | "x-gzip" => gzip = true,
                "deflate" => deflate = true,
                "*" => gzip = true,
                _ => {}
            }
        }
        if gzip {
            CompressionAlgorithm::Gzip
        } else if deflate {
            CompressionAlgorithm::Deflate
        } else {
            CompressionAlgorithm::Identity
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported compression algorithm")]
    UnsupportedAlgorithm,
}

/// Finishing touches applied to every response right before it is queued.
#[derive(Debug, Clone)]
pub struct Middleware {
    pub server_name: String,
    pub cors_origin: Option<String>,
    pub compression: bool,
}

impl Middleware {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            server_name: config.server_name.clone(),
            cors_origin: config.cors.then(|| config.cors_origin.clone()),
            compression: config.compression,
        }
    }

    pub fn apply(&self, req: Option<&HttpRequest>, res: &mut HttpResponse) {
        if self.compression && !res.body.is_empty() {
            if let Some(accept) = req.and_then(|r| r.headers.get("Accept-Encoding")) {
                let algo = CompressionAlgorithm::negotiate(accept);
                if algo != CompressionAlgorithm::Identity {
                    if let Err(err) = compress_body(res, algo) {
                        warn!(error = %err, "response compression failed");
                    }
                }
            }
        }

        if let Some(origin) = &self.cors_origin {
            res.set_header(ResponseHeader::AccessControlAllowOrigin, origin);
            res.set_header(ResponseHeader::AccessControlAllowMethods, "GET, OPTIONS");
            res.set_header(ResponseHeader::AccessControlAllowHeaders, "Content-Type");
        }

        let length = res.body.len().to_string();
        res.set_header(ResponseHeader::ContentLength, &length);
        res.set_header(ResponseHeader::Date, &httpdate::fmt_http_date(SystemTime::now()));
        res.set_header(ResponseHeader::Server, &self.server_name);
        res.set_header(ResponseHeader::Connection, "close");
    }
}

fn compress_body(
    res: &mut HttpResponse,
    algo: CompressionAlgorithm,
) -> Result<(), CompressionError> {
    let body = match algo {
        CompressionAlgorithm::Gzip => {
            let mut e = GzEncoder::new(Vec::new(), Compression::default());
            e.write_all(&res.body)?;
            e.finish()?
        }
        CompressionAlgorithm::Deflate => {
            let mut e = DeflateEncoder::new(Vec::new(), Compression::default());
            e.write_all(&res.body)?;
            e.finish()?
        }
        CompressionAlgorithm::Identity => return Err(CompressionError::UnsupportedAlgorithm),
    };

    res.set_header(ResponseHeader::ContentEncoding, algo.as_str());
    res.set_header(ResponseHeader::Vary, "Accept-Encoding");
    res.set_body(body);
    Ok(())
}
