//! Protected outbound sockets.
//!
//! Every socket the engine opens toward the real network must be marked so
//! the OS routes it around the virtual interface; otherwise outbound traffic
//! loops straight back into the engine. The embedding layer supplies the
//! marking through [`SocketProtector`], and [`Dialer`] applies it to every
//! socket before connecting.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

/// Marks a raw socket to bypass the virtual interface's routing.
pub trait SocketProtector: Send + Sync {
    /// Returns whether the socket was successfully marked. A `false` return
    /// is logged but not fatal; the connection proceeds and may loop.
    fn protect(&self, fd: RawFd) -> bool;
}

/// No-op protector for environments where routing is handled externally
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProtection;

impl SocketProtector for NoProtection {
    fn protect(&self, _fd: RawFd) -> bool {
        true
    }
}

/// Opens protected outbound sockets with a bounded connect time.
pub struct Dialer {
    protector: Arc<dyn SocketProtector>,
    connect_timeout: Duration,
}

impl Dialer {
    pub fn new(protector: Arc<dyn SocketProtector>, connect_timeout: Duration) -> Self {
        Self {
            protector,
            connect_timeout,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Open a protected TCP connection to `addr`, bounded by the configured
    /// connect timeout.
    pub async fn connect(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        tokio::time::timeout(self.connect_timeout, self.connect_inner(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timeout")
            })?
    }

    async fn connect_inner(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

        let fd = socket.as_raw_fd();
        if !self.protector.protect(fd) {
            warn!(
                "Failed to protect socket fd={}, connection may cause routing loop",
                fd
            );
        } else {
            debug!("Socket fd={} protected", fd);
        }

        socket.set_nonblocking(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)?;

        stream.writable().await?;

        if let Some(e) = stream.take_error()? {
            return Err(e);
        }

        Ok(stream)
    }

    /// Bind a protected UDP socket on an ephemeral port.
    pub async fn bind_udp(&self) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

        let fd = socket.as_raw_fd();
        if !self.protector.protect(fd) {
            warn!("Failed to protect UDP socket fd={}", fd);
        }

        socket.set_nonblocking(true)?;
        let bind_addr = SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0);
        socket.bind(&bind_addr.into())?;

        UdpSocket::from_std(socket.into())
    }
}
