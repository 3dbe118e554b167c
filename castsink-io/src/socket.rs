//! UDP datagram socket wrapper
//!
//! Used by the clock exchange (one blocking request/response against a time
//! server) and by the receiver tools (media datagrams in, feedback out).

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use thiserror::Error;

/// Socket errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Could not resolve host '{0}'")]
    Resolve(String),

    #[error("Invalid socket address")]
    InvalidAddress,
}

impl SocketError {
    /// True when the operation would have blocked or hit its read timeout
    pub fn is_would_block(&self) -> bool {
        matches!(
            self,
            SocketError::Io(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut
        )
    }
}

/// UDP socket
pub struct DatagramSocket {
    inner: UdpSocket,
}

impl DatagramSocket {
    /// Create a socket bound to the given address (blocking mode)
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let socket = new_udp_socket(addr)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;

        Ok(DatagramSocket {
            inner: socket.into(),
        })
    }

    /// Resolve `host:port` and return a socket connected to it
    ///
    /// IPv4 results are preferred, matching what time servers are usually
    /// reached over. Resolution failure is reported as [`SocketError::Resolve`]
    /// so callers can tell it apart from transport failures.
    pub fn connect(host: &str, port: u16) -> Result<Self, SocketError> {
        let remote = resolve(host, port)?;

        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = new_udp_socket(remote)?;
        socket.bind(&local.into())?;
        socket.connect(&remote.into())?;

        tracing::debug!("UDP socket connected to {} ({})", host, remote);

        Ok(DatagramSocket {
            inner: socket.into(),
        })
    }

    /// Switch between blocking and non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), SocketError> {
        self.inner.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Bound blocking receives; `None` waits forever
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SocketError> {
        self.inner.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Set the kernel receive buffer size
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        SockRef::from(&self.inner).set_recv_buffer_size(size)?;
        Ok(())
    }

    /// Get the kernel receive buffer size
    pub fn recv_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(SockRef::from(&self.inner).recv_buffer_size()?)
    }

    /// Get the local address this socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.inner.local_addr()?)
    }

    /// Send to the connected peer
    pub fn send(&self, buf: &[u8]) -> Result<usize, SocketError> {
        Ok(self.inner.send(buf)?)
    }

    /// Receive from the connected peer, retrying on interruption
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        loop {
            match self.inner.recv(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SocketError::Io(e)),
            }
        }
    }

    /// Send data to the given address
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, target)?)
    }

    /// Receive a datagram and its source address, retrying on interruption
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        loop {
            match self.inner.recv_from(buf) {
                Ok(result) => return Ok(result),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SocketError::Io(e)),
            }
        }
    }

    /// Try to clone the socket
    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(DatagramSocket {
            inner: self.inner.try_clone()?,
        })
    }

    /// Convert to a standard UDP socket
    pub fn into_udp_socket(self) -> UdpSocket {
        self.inner
    }
}

fn new_udp_socket(addr: SocketAddr) -> Result<Socket, SocketError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    Ok(Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?)
}

/// Resolve a host name, preferring IPv4 addresses
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, SocketError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| SocketError::Resolve(host.to_string()))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| SocketError::Resolve(host.to_string()))
}
