use std::net::SocketAddr;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::runtime::SchedulerError;

/// Failures that stop the server from starting.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[cfg(feature = "tls")]
    #[error("tls setup failed: {0}")]
    Tls(#[from] crate::net::tls::TlsSetupError),

    #[error("tls listener requested but the `tls` feature is disabled")]
    TlsUnavailable,

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
