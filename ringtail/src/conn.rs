//! Reactor-backed TCP connections.

use std::{io, os::fd::RawFd, sync::Arc};

use async_trait::async_trait;
use tracing::debug;

use crate::{reactor::Reactor, wire::ByteStream, Result, RingtailError};

/// A connected socket descriptor and the reactor that drives it.
///
/// Each connection is exclusively owned by the component that created it and
/// is closed exactly once: explicitly through [`Connection::close`] (an
/// asynchronous close on the ring), or by a synchronous fallback in `Drop`
/// when an error path abandons it early.
pub struct Connection {
    fd: RawFd,
    reactor: Arc<Reactor>,
    closed: bool,
}

impl Connection {
    /// Resolves `host:port` and connects through the reactor, trying each
    /// resolved address in turn.
    pub async fn open(reactor: Arc<Reactor>, host: &str, port: u16) -> Result<Self> {
        let mut last: Option<RingtailError> = None;
        for addr in tokio::net::lookup_host((host, port)).await? {
            match reactor.connect(addr).await {
                Ok(fd) => {
                    debug!(%addr, fd, "connected");
                    return Ok(Self::from_raw(reactor, fd));
                }
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, format!("{host} did not resolve"))
                .into()
        }))
    }

    /// Adopts an already-connected descriptor, e.g. one accepted by a
    /// listener. The descriptor must be in blocking mode; the ring reports
    /// `EAGAIN` instead of suspending for nonblocking sockets.
    pub fn from_raw(reactor: Arc<Reactor>, fd: RawFd) -> Self {
        Connection {
            fd,
            reactor,
            closed: false,
        }
    }

    /// Half-closes the write side so the peer's final read completes.
    pub async fn shutdown_write(&self) -> Result<()> {
        self.reactor.shutdown_write(self.fd).await
    }

    /// Closes the descriptor on the ring.
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        self.reactor.close(self.fd).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.closed {
            unsafe { libc::close(self.fd) };
        }
    }
}

#[async_trait]
impl ByteStream for Connection {
    async fn recv(&mut self, buf: Vec<u8>) -> Result<(usize, Vec<u8>)> {
        self.reactor.read(self.fd, buf).await
    }

    async fn send(&mut self, buf: Vec<u8>) -> Result<(usize, Vec<u8>)> {
        self.reactor.write(self.fd, buf).await
    }
}
