//! Byte transport under a connection: plain TCP or TLS.
//!
//! Every call is non-blocking. "Would block" is a normal outcome meaning
//! "come back next tick"; only real failures surface as `Err`.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::task::Poll;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    Eof,
    WouldBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(usize),
    WouldBlock,
}

pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    fn write(&mut self, buf: &[u8]) -> io::Result<WriteOutcome>;

    /// Pushes out anything the transport buffered internally.
    fn flush(&mut self) -> io::Result<Poll<()>> {
        Ok(Poll::Ready(()))
    }

    fn close(&mut self);

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn kind(&self) -> &'static str;
}

pub struct PlainTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl PlainTransport {
    /// Wraps a stream, switching it to non-blocking mode.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self {
            stream,
            peer,
            closed: false,
        })
    }
}

impl Transport for PlainTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        if self.closed {
            return Ok(ReadOutcome::Eof);
        }
        match self.stream.read(buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if is_would_block(&e) => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<WriteOutcome> {
        if self.closed {
            return Err(io::Error::from(ErrorKind::NotConnected));
        }
        match self.stream.write(buf) {
            Ok(0) if !buf.is_empty() => Err(io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => Ok(WriteOutcome::Written(n)),
            Err(e) if is_would_block(&e) => Ok(WriteOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.closed = true;
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn kind(&self) -> &'static str {
        "plain"
    }
}

pub(crate) fn is_would_block(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}
