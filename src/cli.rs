//! Command line: `server [PORT [BIND_ADDRESS]]` plus optional flags.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::{ConfigError, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "server", version, about = "Weather API server")]
pub struct Cli {
    /// Port for plain HTTP (default 10480)
    pub port: Option<u16>,

    /// Address to bind (default 127.0.0.1)
    pub bind_address: Option<IpAddr>,

    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable the TLS listener on this port
    #[arg(long)]
    pub tls_port: Option<u16>,

    /// PEM certificate chain for the TLS listener
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// PEM private key for the TLS listener
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Default log filter; RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Loads the config file, if any, and applies the command line on top.
    pub fn into_config(self) -> Result<ServerConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(addr) = self.bind_address {
            config.address = addr;
        }
        if self.tls_port.is_some() || self.cert.is_some() || self.key.is_some() {
            let mut tls = config.tls.take().unwrap_or_default();
            if let Some(port) = self.tls_port {
                tls.port = port;
            }
            if let Some(cert) = self.cert {
                tls.cert = cert;
            }
            if let Some(key) = self.key {
                tls.key = key;
            }
            config.tls = Some(tls);
        }
        Ok(config)
    }
}
