//! # Session Configuration
//!
//! Everything a node needs before it opens a socket, loadable from TOML.
//!
//! ```toml
//! ticdup = 1
//! port = 5029
//! topology = "auto"
//! host_players = 4
//! password = "hunter2"
//! ```
//!
//! A node hosts when `join` is unset and joins `join` otherwise.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};
use crate::protocol::{Topology, MAX_INFO_LEN, MAX_NAME_LEN, MAX_PASSWORD_LEN, MAX_SETTINGS_LEN};
use crate::transport::resolve;
use crate::{DEFAULT_PORT, DEFAULT_STALL_TIMEOUT_MS, MAX_PLAYERS, MAX_TICDUP};

/// Largest player count that still uses peer-to-peer under `auto`.
pub const AUTO_P2P_LIMIT: usize = 4;

/// Requested topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyMode {
    /// Peer-to-peer for small games, star for large ones.
    #[default]
    Auto,
    /// Always peer-to-peer.
    PeerToPeer,
    /// Always star.
    Star,
}

impl TopologyMode {
    /// Concrete topology for a game of `players` participants.
    #[must_use]
    pub const fn resolve(self, players: usize) -> Topology {
        match self {
            Self::Auto if players <= AUTO_P2P_LIMIT => Topology::PeerToPeer,
            Self::Auto | Self::Star => Topology::Star,
            Self::PeerToPeer => Topology::PeerToPeer,
        }
    }
}

/// What this node does in the lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Host a game for `players` participants, host included.
    Host {
        /// Expected participant count.
        players: u8,
    },
    /// Join the host at `addr`.
    Join {
        /// Resolved host address.
        addr: SocketAddr,
    },
}

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Simulation ticks per network tick (1-5).
    pub ticdup: u8,
    /// UDP port to bind when hosting.
    pub port: u16,
    /// Topology override.
    pub topology: TopologyMode,
    /// Shared password; empty for none.
    pub password: String,
    /// Participants to wait for when hosting.
    pub host_players: u8,
    /// Host to join, as `addr[:port]`.
    pub join: Option<String>,
    /// Simulation ticks per second.
    pub tick_rate: u32,
    /// Handshake polling interval.
    pub poll_interval_ms: u64,
    /// Time without progress before a stall is declared.
    pub stall_timeout_ms: u64,
    /// Datagrams at least this long are offered to the compressor.
    pub compress_threshold: usize,
    /// Checksum of the loaded content, compared by the host.
    pub content_hash: u32,
    /// Identity string sent in the lobby.
    pub user_info: String,
    /// Setup string sent during the info exchange.
    pub setup_info: String,
    /// Map the host starts on.
    pub map: String,
    /// Opaque game settings the host distributes.
    pub settings: String,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            ticdup: 1,
            port: DEFAULT_PORT,
            topology: TopologyMode::Auto,
            password: String::new(),
            host_players: 1,
            join: None,
            tick_rate: 35,
            poll_interval_ms: 50,
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT_MS,
            compress_threshold: 128,
            content_hash: 0,
            user_info: String::new(),
            setup_info: String::new(),
            map: String::from("map01"),
            settings: String::new(),
        }
    }
}

fn check(ok: bool, message: impl FnOnce() -> String) -> NetResult<()> {
    if ok {
        Ok(())
    } else {
        Err(NetError::Config(message()))
    }
}

impl NetConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(text: &str) -> NetResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| NetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> NetResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| NetError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> NetResult<String> {
        toml::to_string_pretty(self).map_err(|e| NetError::Config(e.to_string()))
    }

    /// Rejects out-of-range values.
    pub fn validate(&self) -> NetResult<()> {
        check((1..=MAX_TICDUP).contains(&self.ticdup), || {
            format!("ticdup must be 1..={MAX_TICDUP}, got {}", self.ticdup)
        })?;
        check(
            (1..=MAX_PLAYERS).contains(&usize::from(self.host_players)),
            || format!("host_players must be 1..={MAX_PLAYERS}, got {}", self.host_players),
        )?;
        check(self.join.is_none() || self.host_players == 1, || {
            "a node cannot both host and join".to_string()
        })?;
        check((1..=1000).contains(&self.tick_rate), || {
            format!("tick_rate must be 1..=1000, got {}", self.tick_rate)
        })?;
        check(self.poll_interval_ms > 0, || "poll_interval_ms must be positive".to_string())?;
        check(self.stall_timeout_ms > 0, || "stall_timeout_ms must be positive".to_string())?;
        check(self.password.len() <= MAX_PASSWORD_LEN, || {
            format!("password longer than {MAX_PASSWORD_LEN} bytes")
        })?;
        check(
            self.user_info.len() <= MAX_INFO_LEN && self.setup_info.len() <= MAX_INFO_LEN,
            || format!("info strings are limited to {MAX_INFO_LEN} bytes"),
        )?;
        check(self.map.len() <= MAX_NAME_LEN, || {
            format!("map name longer than {MAX_NAME_LEN} bytes")
        })?;
        check(self.settings.len() <= MAX_SETTINGS_LEN, || {
            format!("settings longer than {MAX_SETTINGS_LEN} bytes")
        })
    }

    /// Host or join, with the join target resolved.
    pub fn role(&self) -> NetResult<Role> {
        match &self.join {
            Some(target) => Ok(Role::Join {
                addr: resolve(target, DEFAULT_PORT)?,
            }),
            None => Ok(Role::Host {
                players: self.host_players,
            }),
        }
    }

    /// Milliseconds per simulation tick.
    #[must_use]
    pub fn tick_ms(&self) -> u64 {
        (1000 / u64::from(self.tick_rate.max(1))).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetConfig::default();
        config.validate().unwrap();
        assert_eq!(config.role().unwrap(), Role::Host { players: 1 });
        assert_eq!(config.tick_ms(), 28);
    }

    #[test]
    fn test_parse_partial_document() {
        let config = NetConfig::from_toml_str(
            r#"
            ticdup = 2
            topology = "peer-to-peer"
            join = "127.0.0.1"
            "#,
        )
        .unwrap();
        assert_eq!(config.ticdup, 2);
        assert_eq!(config.topology, TopologyMode::PeerToPeer);
        assert_eq!(
            config.role().unwrap(),
            Role::Join {
                addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))
            }
        );
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(matches!(
            NetConfig::from_toml_str("ticdup = 6"),
            Err(NetError::Config(_))
        ));
        assert!(NetConfig::from_toml_str("host_players = 17").is_err());
        assert!(NetConfig::from_toml_str("host_players = 2\njoin = \"10.0.0.1\"").is_err());
        assert!(NetConfig::from_toml_str("topology = \"mesh\"").is_err());
    }

    #[test]
    fn test_auto_topology() {
        assert_eq!(TopologyMode::Auto.resolve(4), Topology::PeerToPeer);
        assert_eq!(TopologyMode::Auto.resolve(5), Topology::Star);
        assert_eq!(TopologyMode::Star.resolve(2), Topology::Star);
        assert_eq!(TopologyMode::PeerToPeer.resolve(8), Topology::PeerToPeer);
    }

    #[test]
    fn test_toml_output_reparses() {
        let config = NetConfig {
            host_players: 3,
            password: "pw".into(),
            ..NetConfig::default()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(NetConfig::from_toml_str(&text).unwrap(), config);
    }
}
