//! Server bootstrap.
//!
//! [`Server::init`] binds the listening sockets, loads the caches and seeds
//! the scheduler with the listener tasks (and the cache janitor when
//! configured). [`Server::run`] then drives the scheduler on the calling
//! thread until the stop flag is raised.
//!
//! Request handling itself lives in the tasks:
//!
//! 1. [`ListenerTask`] accepts sockets and spawns a [`ConnectionTask`] each
//! 2. the connection reads, parses and routes the request
//! 3. API routes run in a backend task that posts the response back
//! 4. the connection writes the response and disposes
//!
//! [`ConnectionTask`]: super::connection::ConnectionTask

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tracing::{info, warn};

use super::connection::ConnectionSettings;
use super::listener::{Acceptor, ListenerTask, bind};
use crate::config::{ServerConfig, TlsConfig};
use crate::context::{ServerContext, ServerScheduler, TaskContext};
use crate::error::ServerError;
use crate::http::response::HttpResponse;
use crate::runtime::{Step, Task};

pub struct Server {
    scheduler: ServerScheduler,
    local: SocketAddr,
    tls_local: Option<SocketAddr>,
}

impl Server {
    pub fn init(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let config = Arc::new(config);
        let settings = Arc::new(ConnectionSettings::from_config(&config));
        let ctx = ServerContext::new(config.clone())?;
        let mut scheduler = ServerScheduler::new(ctx, config.scheduler_capacity, config.idle_sleep);

        let addr = SocketAddr::new(config.address, config.port);
        let plain = listen(addr, Acceptor::Plain, settings.clone(), &config)?;
        let local = plain.local_addr();
        scheduler.add(plain)?;

        let tls_local = match &config.tls {
            Some(tls) => {
                let task = Self::tls_listener(tls, settings, &config)?;
                let addr = task.local_addr();
                scheduler.add(task)?;
                Some(addr)
            }
            None => None,
        };

        if let Some(max_age) = config.weather_cache_max_age {
            scheduler.add(JanitorTask::new(max_age))?;
        }

        info!(
            addr = %local,
            tls = ?tls_local,
            capacity = config.scheduler_capacity,
            "server listening"
        );
        Ok(Self {
            scheduler,
            local,
            tls_local,
        })
    }

    #[cfg(feature = "tls")]
    fn tls_listener(
        tls: &TlsConfig,
        settings: Arc<ConnectionSettings>,
        config: &ServerConfig,
    ) -> Result<ListenerTask, ServerError> {
        let rustls_config = super::tls::load_server_config(&tls.cert, &tls.key)?;
        let addr = SocketAddr::new(config.address, tls.port);
        listen(addr, Acceptor::Tls(rustls_config), settings, config)
    }

    #[cfg(not(feature = "tls"))]
    fn tls_listener(
        _tls: &TlsConfig,
        _settings: Arc<ConnectionSettings>,
        _config: &ServerConfig,
    ) -> Result<ListenerTask, ServerError> {
        Err(ServerError::TlsUnavailable)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.tls_local
    }

    pub fn context(&self) -> &ServerContext {
        self.scheduler.shared()
    }

    /// Drives the scheduler until `stop` is raised, then cleans up every task.
    pub fn run(mut self, stop: &AtomicBool) {
        self.scheduler.run(stop);
        info!(addr = %self.local, "server stopped");
    }
}

fn listen(
    addr: SocketAddr,
    acceptor: Acceptor,
    settings: Arc<ConnectionSettings>,
    config: &ServerConfig,
) -> Result<ListenerTask, ServerError> {
    let listener = bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
    ListenerTask::new(listener, acceptor, settings, config).map_err(|source| ServerError::Bind { addr, source })
}

/// Periodically evicts weather files older than the configured max age.
pub struct JanitorTask {
    max_age: Duration,
    next_run: u64,
}

impl JanitorTask {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age, next_run: 0 }
    }
}

impl Task<ServerContext, HttpResponse> for JanitorTask {
    fn name(&self) -> &'static str {
        "janitor"
    }

    fn step(&mut self, cx: &mut TaskContext<'_>) -> Step {
        let now = cx.now();
        if now < self.next_run {
            return Step::Pending;
        }
        match cx.shared.weather.evict_older_than(self.max_age) {
            Ok(0) => {}
            Ok(evicted) => info!(evicted, "weather cache evicted"),
            Err(e) => warn!(error = %e, "weather cache eviction failed"),
        }
        self.next_run = now + (self.max_age.as_millis() as u64).max(1);
        Step::Pending
    }

    fn wake_at(&self) -> Option<u64> {
        Some(self.next_run)
    }
}
