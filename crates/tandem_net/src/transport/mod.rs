//! # Transport Layer
//!
//! Datagram plumbing underneath the protocol.
//!
//! ## Design
//!
//! - [`Transport`] is the seam: raw datagrams in, raw datagrams out
//! - [`UdpTransport`] is the real, non-blocking socket
//! - [`MemoryNetwork`] is an in-process stand-in with a loss model
//! - [`Channel`] adds compression framing and packet dispatch on top

mod channel;
pub mod compression;
mod memory;

pub use channel::{Channel, TransportStats};
pub use compression::{Compressor, Lz4Compressor, NoCompression};
pub use memory::{MemoryNetwork, MemoryStats, MemoryTransport};

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use thiserror::Error;

/// Errors raised while setting up or using a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// OS error.
        #[source]
        source: io::Error,
    },

    /// A host name did not resolve to any address.
    #[error("cannot resolve `{0}`")]
    Resolve(String),

    /// Any other socket failure.
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Raw datagram endpoint.
pub trait Transport: Send {
    /// Address the endpoint is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Sends one datagram.
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Receives one datagram into `buf`.
    ///
    /// Returns `Ok(None)` when nothing is pending; never blocks.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

/// Non-blocking UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Binds a non-blocking socket to `addr`.
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        Ok(Self { socket, local_addr })
    }

    /// Binds to every interface on `port` (0 picks a free port).
    pub fn bind_port(port: u16) -> Result<Self, TransportError> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], port)))
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, addr)) => Ok(Some((len, addr))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Resolves `host[:port]`, filling in `default_port` when none is given.
pub fn resolve(target: &str, default_port: u16) -> Result<SocketAddr, TransportError> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let with_port = if target.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        target.to_string()
    } else {
        format!("{target}:{default_port}")
    };
    with_port
        .to_socket_addrs()
        .map_err(|_| TransportError::Resolve(target.to_string()))?
        .next()
        .ok_or_else(|| TransportError::Resolve(target.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_literal_and_default_port() {
        assert_eq!(
            resolve("127.0.0.1:6000", 5029).unwrap(),
            "127.0.0.1:6000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(resolve("127.0.0.1", 5029).unwrap().port(), 5029);
        assert_eq!(resolve("localhost:6001", 5029).unwrap().port(), 6001);
    }

    #[test]
    fn test_resolve_garbage_fails() {
        assert!(matches!(
            resolve("not a host name:::", 5029),
            Err(TransportError::Resolve(_))
        ));
    }

    #[test]
    fn test_udp_loopback() {
        let mut a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut buf = [0u8; 64];
        assert!(b.recv_from(&mut buf).unwrap().is_none());

        a.send_to(b"ping", b.local_addr()).unwrap();
        let mut got = None;
        for _ in 0..200 {
            if let Some(hit) = b.recv_from(&mut buf).unwrap() {
                got = Some(hit);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let (len, from) = got.expect("datagram arrives on loopback");
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr());
    }
}
