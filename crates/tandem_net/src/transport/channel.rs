//! # Packet Channel
//!
//! Typed packets over a raw [`Transport`].
//!
//! Outgoing packets are encoded into one fixed send buffer, framed for
//! compression and handed to the transport. Incoming datagrams are
//! unframed and every packet they carry is decoded and queued, so several
//! packets can share one datagram.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tracing::{debug, trace, warn};

use crate::codec::{GrowableWriter, Serializer, Writer};
use crate::error::NetResult;
use crate::protocol::{write_body, Packet, PacketBody, PacketRegistry, ProtocolResult};
use crate::MAX_PACKET_SIZE;

use super::compression::{frame, unframe, Compressor};
use super::Transport;

/// Channel statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Datagrams sent.
    pub packets_sent: u64,
    /// Datagrams received.
    pub packets_received: u64,
    /// Bytes sent, after compression.
    pub bytes_sent: u64,
    /// Bytes received, before decompression.
    pub bytes_received: u64,
    /// Send errors.
    pub send_errors: u64,
    /// Receive errors.
    pub recv_errors: u64,
    /// Datagrams sent compressed.
    pub compressed_sent: u64,
}

/// Packet-level endpoint.
pub struct Channel {
    transport: Box<dyn Transport>,
    compressor: Box<dyn Compressor>,
    registry: PacketRegistry,
    compress_threshold: usize,
    send_buffer: Vec<u8>,
    framed: Vec<u8>,
    recv_buffer: Vec<u8>,
    inflated: Vec<u8>,
    inbox: VecDeque<(SocketAddr, Packet)>,
    stats: TransportStats,
}

impl Channel {
    /// Wraps `transport`, compressing datagrams of at least
    /// `compress_threshold` bytes.
    #[must_use]
    pub fn new(
        transport: Box<dyn Transport>,
        compressor: Box<dyn Compressor>,
        compress_threshold: usize,
    ) -> Self {
        Self {
            transport,
            compressor,
            registry: PacketRegistry::standard(),
            compress_threshold,
            send_buffer: vec![0; MAX_PACKET_SIZE],
            framed: Vec::with_capacity(MAX_PACKET_SIZE),
            recv_buffer: vec![0; MAX_PACKET_SIZE],
            inflated: Vec::with_capacity(MAX_PACKET_SIZE),
            inbox: VecDeque::new(),
            stats: TransportStats::default(),
        }
    }

    /// Address of the underlying transport.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Packet kinds this channel decodes. Register extensions here.
    pub fn registry_mut(&mut self) -> &mut PacketRegistry {
        &mut self.registry
    }

    /// Statistics so far.
    #[must_use]
    pub const fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Encoded size of `body`, tag and argument count included.
    pub fn measure<T: PacketBody>(body: &mut T) -> ProtocolResult<usize> {
        let mut out = GrowableWriter::new();
        write_body(body, &mut out)?;
        Ok(out.len())
    }

    /// Sends one packet in its own datagram.
    ///
    /// Returns false when the body chose not to be written or the transport
    /// refused the datagram.
    pub fn send<T: PacketBody>(&mut self, addr: SocketAddr, body: &mut T) -> NetResult<bool> {
        let len = {
            let mut writer = Writer::new(&mut self.send_buffer);
            if !write_body(body, &mut writer)? {
                return Ok(false);
            }
            writer.position()
        };
        trace!(tag = T::TAG, len, %addr, "send");
        Ok(self.transmit(addr, len))
    }

    /// Sends several packets back to back in one datagram.
    pub fn send_packets(&mut self, addr: SocketAddr, packets: &mut [Packet]) -> NetResult<bool> {
        let len = {
            let mut writer = Writer::new(&mut self.send_buffer);
            for packet in packets.iter_mut() {
                packet.write(&mut writer)?;
            }
            writer.position()
        };
        if len == 0 {
            return Ok(false);
        }
        trace!(count = packets.len(), len, %addr, "send batch");
        Ok(self.transmit(addr, len))
    }

    fn transmit(&mut self, addr: SocketAddr, len: usize) -> bool {
        let compressed = frame(
            &self.send_buffer[..len],
            self.compressor.as_mut(),
            self.compress_threshold,
            &mut self.framed,
        );
        match self.transport.send_to(&self.framed, addr) {
            Ok(sent) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += sent as u64;
                if compressed {
                    self.stats.compressed_sent += 1;
                }
                true
            }
            Err(e) => {
                self.stats.send_errors += 1;
                debug!(%addr, error = %e, "send failed");
                false
            }
        }
    }

    /// Returns the next received packet, or `None` when nothing is pending.
    ///
    /// A datagram that fails to decode is discarded as a whole and the error
    /// is returned; socket errors are counted and treated as "nothing
    /// pending".
    pub fn recv(&mut self) -> NetResult<Option<(SocketAddr, Packet)>> {
        loop {
            if let Some(next) = self.inbox.pop_front() {
                return Ok(Some(next));
            }

            let (len, from) = match self.transport.recv_from(&mut self.recv_buffer) {
                Ok(Some(hit)) => hit,
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.stats.recv_errors += 1;
                    warn!(error = %e, "receive failed");
                    return Ok(None);
                }
            };
            self.stats.packets_received += 1;
            self.stats.bytes_received += len as u64;

            let plain = unframe(
                &self.recv_buffer[..len],
                self.compressor.as_mut(),
                MAX_PACKET_SIZE,
                &mut self.inflated,
            )?;
            let packets = self.registry.read_all(plain)?;
            trace!(%from, len, count = packets.len(), "recv");
            self.inbox.extend(packets.into_iter().map(|p| (from, p)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectAck, Exit, GameParams, Go, SetupReady};
    use crate::session::PlayerSet;
    use crate::transport::{Lz4Compressor, MemoryNetwork, NoCompression};

    fn pair(net: &MemoryNetwork) -> (Channel, Channel) {
        let a = Channel::new(Box::new(net.bind(0).unwrap()), Box::new(Lz4Compressor), 64);
        let b = Channel::new(Box::new(net.bind(0).unwrap()), Box::new(Lz4Compressor), 64);
        (a, b)
    }

    #[test]
    fn test_send_and_receive() {
        let net = MemoryNetwork::perfect();
        let (mut a, mut b) = pair(&net);
        assert!(a.send(b.local_addr(), &mut ConnectAck { slot: 2, capacity: 4 }).unwrap());

        let (from, packet) = b.recv().unwrap().expect("packet delivered");
        assert_eq!(from, a.local_addr());
        assert_eq!(packet, Packet::ConnectAck(ConnectAck { slot: 2, capacity: 4 }));
        assert!(b.recv().unwrap().is_none());
        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(b.stats().packets_received, 1);
    }

    #[test]
    fn test_batch_shares_one_datagram() {
        let net = MemoryNetwork::perfect();
        let (mut a, mut b) = pair(&net);
        let mut batch = vec![
            Packet::Go(Go { topology: 0, players: PlayerSet::first_n(2) }),
            Packet::GameParams(GameParams {
                map: "e1m1".into(),
                rng_seed: 9,
                settings: vec![0; 300],
            }),
            Packet::SetupReady(SetupReady),
        ];
        assert!(a.send_packets(b.local_addr(), &mut batch).unwrap());
        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(a.stats().compressed_sent, 1);

        let mut got = Vec::new();
        while let Some((_, packet)) = b.recv().unwrap() {
            got.push(packet);
        }
        assert_eq!(got, batch);
    }

    #[test]
    fn test_garbage_datagram_is_error() {
        let net = MemoryNetwork::perfect();
        let mut raw = net.bind(0).unwrap();
        let mut b = Channel::new(Box::new(net.bind(0).unwrap()), Box::new(NoCompression), 64);
        raw.send_to(&[0x3F, 0, 0], b.local_addr()).unwrap();
        assert!(b.recv().is_err());

        // The bad datagram is gone; the channel keeps working.
        let mut a = Channel::new(Box::new(raw), Box::new(NoCompression), 64);
        a.send(b.local_addr(), &mut Exit::default()).unwrap();
        assert!(matches!(b.recv().unwrap(), Some((_, Packet::Exit(_)))));
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let net = MemoryNetwork::perfect();
        let (mut a, b) = pair(&net);
        let mut params = GameParams {
            map: "m".into(),
            rng_seed: 0,
            settings: vec![1; 1024],
        };
        // Fits: 2 + 2 + 4 + 2 + 1024.
        assert!(a.send(b.local_addr(), &mut params).unwrap());
        assert_eq!(Channel::measure(&mut params).unwrap(), 1034);

        let mut batch = vec![Packet::GameParams(params.clone()), Packet::GameParams(params)];
        assert!(a.send_packets(b.local_addr(), &mut batch).is_err());
    }
}
