//! A small weather API server on a cooperative single-threaded scheduler.
//!
//! Every accepted connection, every upstream lookup and the listeners
//! themselves are tasks stepped by one [`runtime::Scheduler`]. Nothing
//! blocks: sockets are non-blocking and each task yields when it would wait.

pub mod backend;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod http;
pub mod logging;
pub mod net;
pub mod provider;
pub mod ratelimit;
pub mod runtime;

pub use config::ServerConfig;
pub use error::ServerError;
pub use net::server::Server;
