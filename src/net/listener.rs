//! Listening sockets and the accept task.
//!
//! One [`ListenerTask`] exists per listening port. Each step accepts at most
//! `accept_batch` pending connections and spawns a [`ConnectionTask`] for
//! each; the TLS listener wraps the stream in a TLS transport first.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use super::connection::{ConnectionSettings, ConnectionTask};
use super::transport::{PlainTransport, Transport, is_would_block};
use crate::config::ServerConfig;
use crate::context::{ServerContext, TaskContext};
use crate::http::response::HttpResponse;
use crate::ratelimit::RateLimiter;
use crate::runtime::{Step, Task};

const LISTEN_BACKLOG: i32 = 1024;

/// Binds a non-blocking listener with `SO_REUSEADDR`.
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// How accepted streams are turned into transports.
pub enum Acceptor {
    Plain,
    #[cfg(feature = "tls")]
    Tls(Arc<rustls::ServerConfig>),
}

impl Acceptor {
    fn wrap(&self, stream: TcpStream) -> io::Result<Box<dyn Transport>> {
        match self {
            Acceptor::Plain => Ok(Box::new(PlainTransport::new(stream)?)),
            #[cfg(feature = "tls")]
            Acceptor::Tls(config) => Ok(Box::new(super::tls::TlsTransport::new(
                stream,
                config.clone(),
            )?)),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Acceptor::Plain => "plain",
            #[cfg(feature = "tls")]
            Acceptor::Tls(_) => "tls",
        }
    }
}

pub struct ListenerTask {
    listener: TcpListener,
    local: SocketAddr,
    acceptor: Acceptor,
    settings: Arc<ConnectionSettings>,
    batch: usize,
    gate: Option<RateLimiter>,
    accepted: u64,
}

impl ListenerTask {
    pub fn new(
        listener: TcpListener,
        acceptor: Acceptor,
        settings: Arc<ConnectionSettings>,
        config: &ServerConfig,
    ) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let gate = config
            .accept_rate
            .as_ref()
            .map(|rate| RateLimiter::new(rate.max_accepts, rate.window.as_millis() as u64));
        Ok(Self {
            listener,
            local,
            acceptor,
            settings,
            batch: config.accept_batch.max(1),
            gate,
            accepted: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Task<ServerContext, HttpResponse> for ListenerTask {
    fn name(&self) -> &'static str {
        match self.acceptor {
            Acceptor::Plain => "listener",
            #[cfg(feature = "tls")]
            Acceptor::Tls(_) => "listener:tls",
        }
    }

    fn step(&mut self, cx: &mut TaskContext<'_>) -> Step {
        let now = cx.now();
        for _ in 0..self.batch {
            if self.gate.as_ref().is_some_and(|gate| !gate.allow_at(now)) {
                trace!(addr = %self.local, "accept gate closed");
                break;
            }
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if is_would_block(&e) => break,
                Err(e) => {
                    warn!(addr = %self.local, error = %e, "accept failed");
                    break;
                }
            };
            if let Some(gate) = &mut self.gate {
                gate.record_at(now);
            }

            let transport = match self.acceptor.wrap(stream) {
                Ok(transport) => transport,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "cannot set up connection");
                    continue;
                }
            };
            match cx.spawn(ConnectionTask::new(transport, self.settings.clone())) {
                Ok(id) => {
                    self.accepted += 1;
                    debug!(peer = %peer, task = %id, kind = self.acceptor.name(), "connection accepted");
                }
                Err(e) => warn!(peer = %peer, error = %e, "dropping connection"),
            }
        }
        Step::Pending
    }

    fn cleanup(&mut self, _shared: &mut ServerContext) {
        info!(addr = %self.local, accepted = self.accepted, "listener closed");
    }
}
