//! TLS variant of [`Transport`] on top of rustls.
//!
//! The handshake is driven transparently by the first reads and writes. Both
//! socket-level and handshake-level stalls surface as "would block".
//! Encrypted output can sit inside rustls after a write returns, so the
//! connection must call [`Transport::flush`] until it is ready before closing.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::Poll;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection};

use super::transport::{ReadOutcome, Transport, WriteOutcome, is_would_block};

#[derive(Debug, thiserror::Error)]
pub enum TlsSetupError {
    #[error("failed to read certificates from {path}: {reason}")]
    Certificates { path: PathBuf, reason: String },
    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),
    #[error("failed to read private key from {path}: {reason}")]
    PrivateKey { path: PathBuf, reason: String },
    #[error("tls configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Builds the shared server configuration from PEM files.
pub fn load_server_config(cert: &Path, key: &Path) -> Result<Arc<ServerConfig>, TlsSetupError> {
    let certs = CertificateDer::pem_file_iter(cert)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| TlsSetupError::Certificates {
            path: cert.to_path_buf(),
            reason: format!("{e:?}"),
        })?;
    if certs.is_empty() {
        return Err(TlsSetupError::NoCertificate(cert.to_path_buf()));
    }
    let key = PrivateKeyDer::from_pem_file(key).map_err(|e| TlsSetupError::PrivateKey {
        path: key.to_path_buf(),
        reason: format!("{e:?}"),
    })?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

enum Fill {
    Progress,
    WouldBlock,
    Eof,
}

pub struct TlsTransport {
    sock: TcpStream,
    conn: ServerConnection,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl TlsTransport {
    pub fn new(sock: TcpStream, config: Arc<ServerConfig>) -> io::Result<Self> {
        sock.set_nonblocking(true)?;
        let conn = ServerConnection::new(config).map_err(io::Error::other)?;
        let peer = sock.peer_addr().ok();
        Ok(Self {
            sock,
            conn,
            peer,
            closed: false,
        })
    }

    fn flush_tls(&mut self) -> io::Result<Poll<()>> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.sock) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(_) => {}
                Err(e) if is_would_block(&e) => return Ok(Poll::Pending),
                Err(e) => return Err(e),
            }
        }
        Ok(Poll::Ready(()))
    }

    fn fill(&mut self) -> io::Result<Fill> {
        match self.conn.read_tls(&mut self.sock) {
            Ok(0) => Ok(Fill::Eof),
            Ok(_) => match self.conn.process_new_packets() {
                Ok(_) => Ok(Fill::Progress),
                Err(e) => {
                    // Let the peer see the alert before failing.
                    let _ = self.flush_tls();
                    Err(io::Error::new(ErrorKind::InvalidData, e))
                }
            },
            Err(e) if is_would_block(&e) => Ok(Fill::WouldBlock),
            Err(e) => Err(e),
        }
    }
}

impl Transport for TlsTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        if self.closed {
            return Ok(ReadOutcome::Eof);
        }
        loop {
            match self.conn.reader().read(buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            // Handshake replies go out before waiting on more input.
            self.flush_tls()?;
            match self.fill()? {
                Fill::Progress => continue,
                Fill::WouldBlock => return Ok(ReadOutcome::WouldBlock),
                Fill::Eof => return Ok(ReadOutcome::Eof),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<WriteOutcome> {
        if self.closed {
            return Err(io::Error::from(ErrorKind::NotConnected));
        }
        while self.conn.is_handshaking() {
            if self.flush_tls()?.is_pending() {
                return Ok(WriteOutcome::WouldBlock);
            }
            match self.fill()? {
                Fill::Progress => {}
                Fill::WouldBlock => return Ok(WriteOutcome::WouldBlock),
                Fill::Eof => return Err(io::Error::from(ErrorKind::UnexpectedEof)),
            }
        }
        // Accept more plaintext only once earlier records left the socket.
        if self.flush_tls()?.is_pending() {
            return Ok(WriteOutcome::WouldBlock);
        }
        let n = self.conn.writer().write(buf)?;
        if n == 0 && !buf.is_empty() {
            return Ok(WriteOutcome::WouldBlock);
        }
        self.flush_tls()?;
        Ok(WriteOutcome::Written(n))
    }

    fn flush(&mut self) -> io::Result<Poll<()>> {
        self.flush_tls()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.conn.send_close_notify();
        let _ = self.flush_tls();
        let _ = self.sock.shutdown(Shutdown::Both);
        self.closed = true;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn kind(&self) -> &'static str {
        if self.conn.is_handshaking() { "tls-handshake" } else { "tls" }
    }
}
