//! # In-Process Network
//!
//! A datagram hub for tests and the cluster simulator. Every endpoint owns a
//! crossbeam receiver; the hub applies a [`NetworkConditions`] loss model on
//! send.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::trace;

use crate::simulation::{NetworkConditions, SimpleRng};

use super::{Transport, TransportError};

type Datagram = (SocketAddr, Vec<u8>);

/// First port handed out by `bind(0)`.
const EPHEMERAL_BASE: u16 = 40_000;

/// Delivery counters for the whole hub.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Datagrams handed to a receiver.
    pub delivered: u64,
    /// Datagrams lost to the loss model.
    pub dropped: u64,
    /// Extra copies injected.
    pub duplicated: u64,
    /// Datagrams delivered after a later one.
    pub reordered: u64,
}

struct Hub {
    endpoints: HashMap<SocketAddr, Sender<Datagram>>,
    held: HashMap<SocketAddr, Datagram>,
    conditions: NetworkConditions,
    rng: SimpleRng,
    next_port: u16,
    stats: MemoryStats,
}

impl Hub {
    fn deliver(&mut self, to: SocketAddr, datagram: Datagram) {
        if let Some(tx) = self.endpoints.get(&to) {
            if tx.send(datagram).is_ok() {
                self.stats.delivered += 1;
            }
        }
    }

    fn route(&mut self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        if self.conditions.should_drop(self.rng.next()) {
            self.stats.dropped += 1;
            trace!(%from, %to, "datagram dropped");
            return;
        }
        let datagram = (from, data.to_vec());
        if self.conditions.should_reorder(self.rng.next()) && !self.held.contains_key(&to) {
            self.held.insert(to, datagram);
            return;
        }
        if self.conditions.should_duplicate(self.rng.next()) {
            self.stats.duplicated += 1;
            self.deliver(to, datagram.clone());
        }
        self.deliver(to, datagram);
        if let Some(late) = self.held.remove(&to) {
            self.stats.reordered += 1;
            self.deliver(to, late);
        }
    }
}

/// Shared in-process datagram network.
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    /// Creates a network with the given conditions and loss seed.
    #[must_use]
    pub fn new(conditions: NetworkConditions, seed: u64) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                endpoints: HashMap::new(),
                held: HashMap::new(),
                conditions,
                rng: SimpleRng::new(seed),
                next_port: EPHEMERAL_BASE,
                stats: MemoryStats::default(),
            })),
        }
    }

    /// A lossless network.
    #[must_use]
    pub fn perfect() -> Self {
        Self::new(NetworkConditions::PERFECT, 1)
    }

    /// Opens an endpoint on `port`; 0 picks a free one.
    pub fn bind(&self, port: u16) -> Result<MemoryTransport, TransportError> {
        let mut hub = self.hub.lock();
        let port = if port == 0 {
            let mut candidate = hub.next_port;
            while hub.endpoints.contains_key(&Self::addr(candidate)) {
                candidate = candidate.wrapping_add(1).max(EPHEMERAL_BASE);
            }
            hub.next_port = candidate.wrapping_add(1).max(EPHEMERAL_BASE);
            candidate
        } else {
            port
        };
        let addr = Self::addr(port);
        if hub.endpoints.contains_key(&addr) {
            return Err(TransportError::Bind {
                addr,
                source: io::Error::from(io::ErrorKind::AddrInUse),
            });
        }
        let (tx, rx) = unbounded();
        hub.endpoints.insert(addr, tx);
        Ok(MemoryTransport {
            addr,
            inbox: rx,
            hub: Arc::clone(&self.hub),
        })
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), port))
    }

    /// Replaces the loss model.
    pub fn set_conditions(&self, conditions: NetworkConditions) {
        self.hub.lock().conditions = conditions;
    }

    /// Cuts `addr` off; datagrams to it vanish from now on.
    pub fn disconnect(&self, addr: SocketAddr) {
        let mut hub = self.hub.lock();
        hub.endpoints.remove(&addr);
        hub.held.remove(&addr);
    }

    /// Delivery counters.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.hub.lock().stats
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
    addr: SocketAddr,
    inbox: Receiver<Datagram>,
    hub: Arc<Mutex<Hub>>,
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.hub.lock().route(self.addr, addr, data);
        Ok(data.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.inbox.try_recv() {
            Ok((from, data)) => {
                // Truncate like a datagram socket would.
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(Some((len, from)))
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Ok(None),
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.hub.lock().endpoints.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_all(t: &mut MemoryTransport) -> Vec<Vec<u8>> {
        let mut buf = [0u8; 64];
        let mut out = Vec::new();
        while let Some((len, _)) = t.recv_from(&mut buf).unwrap() {
            out.push(buf[..len].to_vec());
        }
        out
    }

    #[test]
    fn test_perfect_delivery_in_order() {
        let net = MemoryNetwork::perfect();
        let mut a = net.bind(0).unwrap();
        let mut b = net.bind(0).unwrap();
        for i in 0..5u8 {
            a.send_to(&[i], b.local_addr()).unwrap();
        }
        assert_eq!(recv_all(&mut b), (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
        assert_eq!(net.stats().delivered, 5);
    }

    #[test]
    fn test_port_in_use() {
        let net = MemoryNetwork::perfect();
        let _host = net.bind(5029).unwrap();
        assert!(matches!(net.bind(5029), Err(TransportError::Bind { .. })));
    }

    #[test]
    fn test_total_loss() {
        let net = MemoryNetwork::new(NetworkConditions::lossy(100), 7);
        let mut a = net.bind(0).unwrap();
        let mut b = net.bind(0).unwrap();
        for _ in 0..10 {
            a.send_to(b"x", b.local_addr()).unwrap();
        }
        assert!(recv_all(&mut b).is_empty());
        assert_eq!(net.stats().dropped, 10);
    }

    #[test]
    fn test_partial_loss_is_partial() {
        let net = MemoryNetwork::new(NetworkConditions::lossy(30), 11);
        let mut a = net.bind(0).unwrap();
        let mut b = net.bind(0).unwrap();
        for _ in 0..200 {
            a.send_to(b"x", b.local_addr()).unwrap();
        }
        let got = recv_all(&mut b).len();
        assert!(got > 80 && got < 190, "delivered {got}");
    }

    #[test]
    fn test_dropped_endpoint_unreachable() {
        let net = MemoryNetwork::perfect();
        let mut a = net.bind(0).unwrap();
        let b = net.bind(0).unwrap();
        let addr = b.local_addr();
        drop(b);
        a.send_to(b"x", addr).unwrap();
        assert_eq!(net.stats().delivered, 0);
        // The port is free again.
        assert!(net.bind(addr.port()).is_ok());
    }
}
