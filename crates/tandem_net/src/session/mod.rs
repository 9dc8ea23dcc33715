//! # Session
//!
//! Owned state of one connection attempt: the configuration, the packet
//! channel and the roster. Built once, handed to the handshake and then to
//! the sync engine.

mod player_set;
mod roster;

pub use player_set::{PlayerSet, MASK_WORDS};
pub use roster::{Participant, ParticipantStatus, Roster};

use std::net::SocketAddr;

use tracing::{debug, info};

use crate::config::{NetConfig, Role};
use crate::error::NetResult;
use crate::protocol::{Exit, PacketBody, ProtocolVersion};
use crate::transport::{Channel, Lz4Compressor, MemoryNetwork, Transport, UdpTransport};

/// One node's view of a game session.
pub struct Session {
    /// Validated configuration.
    pub config: NetConfig,
    /// Packet endpoint.
    pub channel: Channel,
    /// Slot table.
    pub roster: Roster,
    /// Version announced in `Connect`.
    pub version: ProtocolVersion,
    role: Role,
}

impl Session {
    /// Creates a session over `transport`.
    pub fn new(config: NetConfig, transport: Box<dyn Transport>) -> NetResult<Self> {
        config.validate()?;
        let role = config.role()?;
        let roster = match role {
            Role::Host { .. } => Roster::new(0),
            Role::Join { addr } => Roster::guest(addr),
        };
        let channel = Channel::new(transport, Box::new(Lz4Compressor), config.compress_threshold);
        info!(addr = %channel.local_addr(), ?role, "session opened");
        Ok(Self {
            config,
            channel,
            roster,
            version: ProtocolVersion::CURRENT,
            role,
        })
    }

    /// Opens a UDP session: hosts bind the configured port, guests any port.
    pub fn udp(config: NetConfig) -> NetResult<Self> {
        let port = match config.role()? {
            Role::Host { .. } => config.port,
            Role::Join { .. } => 0,
        };
        let transport = UdpTransport::bind_port(port)?;
        Self::new(config, Box::new(transport))
    }

    /// Opens a session on an in-process network.
    pub fn memory(config: NetConfig, network: &MemoryNetwork) -> NetResult<Self> {
        let port = match config.role()? {
            Role::Host { .. } => config.port,
            Role::Join { .. } => 0,
        };
        let transport = network.bind(port)?;
        Self::new(config, Box::new(transport))
    }

    /// Host or guest.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// True when this node hosts the lobby.
    #[must_use]
    pub const fn is_host(&self) -> bool {
        matches!(self.role, Role::Host { .. })
    }

    /// Address of the local endpoint.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    /// Sends `body` to the participant in `slot`; false when it has no address.
    pub fn send_to_slot<T: PacketBody>(&mut self, slot: u8, body: &mut T) -> NetResult<bool> {
        match self.roster.addr(slot) {
            Some(addr) => self.channel.send(addr, body),
            None => Ok(false),
        }
    }

    /// Tells every remote participant that we are leaving, `repeat` times.
    pub fn announce_exit(&mut self, successor: u8, repeat: usize) -> NetResult<()> {
        let targets: Vec<SocketAddr> = self
            .roster
            .participants()
            .filter_map(|p| p.addr)
            .collect();
        debug!(targets = targets.len(), successor, "announcing exit");
        for _ in 0..repeat {
            for &addr in &targets {
                self.channel.send(addr, &mut Exit { successor })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Packet, NO_SUCCESSOR};

    #[test]
    fn test_host_and_guest_rosters() {
        let net = MemoryNetwork::perfect();
        let host = Session::memory(
            NetConfig {
                host_players: 2,
                ..NetConfig::default()
            },
            &net,
        )
        .unwrap();
        assert!(host.is_host());
        assert!(host.roster.is_arbitrator());

        let guest = Session::memory(
            NetConfig {
                join: Some(host.local_addr().to_string()),
                ..NetConfig::default()
            },
            &net,
        )
        .unwrap();
        assert!(!guest.is_host());
        assert_eq!(guest.roster.addr(0), Some(host.local_addr()));
        assert!(!guest.roster.has_local_slot());
    }

    #[test]
    fn test_invalid_config_refused() {
        let net = MemoryNetwork::perfect();
        let config = NetConfig {
            ticdup: 0,
            ..NetConfig::default()
        };
        assert!(Session::memory(config, &net).is_err());
    }

    #[test]
    fn test_announce_exit_reaches_host() {
        let net = MemoryNetwork::perfect();
        let mut host = Session::memory(NetConfig::default(), &net).unwrap();
        let mut guest = Session::memory(
            NetConfig {
                join: Some(host.local_addr().to_string()),
                ..NetConfig::default()
            },
            &net,
        )
        .unwrap();
        guest.announce_exit(NO_SUCCESSOR, 3).unwrap();
        let mut exits = 0;
        while let Some((_, packet)) = host.channel.recv().unwrap() {
            assert!(matches!(packet, Packet::Exit(Exit { successor: NO_SUCCESSOR })));
            exits += 1;
        }
        assert_eq!(exits, 3);
    }
}
