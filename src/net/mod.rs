pub mod buffer;
pub mod client;
pub mod connection;
pub mod listener;
pub mod server;
#[cfg(feature = "tls")]
pub mod tls;
pub mod transport;
