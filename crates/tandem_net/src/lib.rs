//! # Tandem - Lockstep Session Protocol
//!
//! Deterministic lockstep networking for up to 16 participants over UDP.
//! Every node runs the same simulation; only input commands travel.
//!
//! ## Architecture
//!
//! - **Codec**: one field sequence per wire structure, run as write, read or measure
//! - **Protocol**: tagged packets, delta-encoded input commands, tick packets
//! - **Transport**: UDP or in-process datagrams with optional LZ4
//! - **Handshake**: lobby formation, then setup exchange through the arbitrator
//! - **Sync**: per-participant sequenced streams gated on the slowest peer
//!
//! ## Session Lifecycle
//!
//! ```text
//! HOST                                  GUEST
//!   |<------------- Connect -------------|
//!   |-------------- ConnectAck --------->|
//!   |<------------- UserInfo ------------|
//!   |--- GameInfo, UserInfo (others) --->|
//!   |-------------- Go ----------------->|   lobby closed
//!   |<------------- Setup ---------------|
//!   |--- Setup (others), GameParams ---->|
//!   |-------------- SetupReady --------->|   handshake done
//!   |<============ Tick packets ========>|   lockstep
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use tandem_net::{Handshake, HandshakeOutcome, LogProgress, NetConfig, Session, SyncEngine, SystemClock};
//!
//! let mut session = Session::udp(NetConfig::load("tandem.toml")?)?;
//! let clock = SystemClock::new();
//! let handshake = Handshake::new(&mut session, clock.now_millis());
//! if let HandshakeOutcome::Started(start) = handshake.run(&mut session, &mut LogProgress::new(), &clock)? {
//!     let mut engine = SyncEngine::new(session, start, clock.now_millis());
//!     loop {
//!         engine.frame(&mut game, clock.now_millis())?;
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod codec;
pub mod config;
pub mod error;
pub mod handshake;
pub mod integration;
pub mod protocol;
pub mod session;
pub mod simulation;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use config::{NetConfig, Role, TopologyMode};
pub use error::{NetError, NetResult, Rejection};
pub use handshake::{Handshake, HandshakeOutcome, HandshakePoll, StartInfo};
pub use integration::{
    Clock, DeterministicSim, LogProgress, ManualClock, ProgressReporter, ScriptedProgress,
    Simulation, SystemClock, TickInputs,
};
pub use protocol::{InputCommand, Packet, PacketRegistry, Topology};
pub use session::{PlayerSet, Roster, Session};
pub use simulation::{ClusterConfig, LocalCluster, NetworkConditions};
pub use sync::{FrameReport, SyncEngine};
pub use transport::{MemoryNetwork, UdpTransport};

/// Most participants in one game.
pub const MAX_PLAYERS: usize = 16;

/// Largest datagram sent, after compression.
///
/// 1200 bytes stays below every common path MTU.
pub const MAX_PACKET_SIZE: usize = 1200;

/// Port a host binds when none is configured.
pub const DEFAULT_PORT: u16 = 5029;

/// Tick records kept per participant.
pub const RING_DEPTH: usize = 64;

/// Network ticks the local stream may run ahead of what is consumed and
/// acknowledged.
pub const MAX_SEND_AHEAD: u32 = 32;

/// Most tics carried per player block in one tick packet.
pub const MAX_TICS_PER_PACKET: usize = 32;

/// Round-trip samples averaged per participant.
pub const LATENCY_WINDOW: usize = 8;

/// Silence after which the game declares a stall.
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 3000;

/// Copies of an `Exit` sent when leaving.
pub const EXIT_REPEAT: usize = 3;

/// Copies of `Go` and `SetupReady` sent when a phase closes.
pub const GO_REPEAT: usize = 3;

/// Highest simulation ticks per network tick.
pub const MAX_TICDUP: u8 = 5;
