//! # Packet Definitions
//!
//! Every handshake and control packet, described once as a field sequence.
//!
//! ## Wire shape
//!
//! ```text
//! ┌─────────┬───────────┬──────────────────────────┐
//! │ tag (1) │ argc (1)  │ fields...                │
//! └─────────┴───────────┴──────────────────────────┘
//! ```
//!
//! `argc` is the number of top-level fields the sender wrote. Readers check
//! it against the kind's declared count and against the number of fields the
//! decode routine actually consumed.

use crate::codec::{CodecResult, LengthLimit, LengthPrefix, Reader, Serializer};
use crate::session::PlayerSet;

use super::registry::{read_body, write_body};
use super::tick::TickPacket;
use super::ProtocolResult;

/// Longest user-info or setup string.
pub const MAX_INFO_LEN: usize = 1024;

/// Longest password.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Longest map name or address string.
pub const MAX_NAME_LEN: usize = 64;

/// Longest opaque settings blob in the game parameters.
pub const MAX_SETTINGS_LEN: usize = 1024;

/// Exit value meaning "no nominated successor".
pub const NO_SUCCESSOR: u8 = u8::MAX;

/// Built-in packet tags.
///
/// Tags stay below `0x80`; the high bit of the first datagram byte marks a
/// compressed payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Guest asks to join.
    Connect = 0x01,
    /// Host grants a slot.
    ConnectAck = 0x02,
    /// Host refuses a guest.
    Reject = 0x03,
    /// Identity info for one participant.
    UserInfo = 0x04,
    /// Guest acknowledges the identity infos it holds.
    UserInfoAck = 0x05,
    /// Tentative game settings.
    GameInfo = 0x06,
    /// Guest acknowledges the game settings.
    GameInfoAck = 0x07,
    /// Lobby heartbeat with the connected count.
    Heartbeat = 0x08,
    /// Lobby is closed; the game starts.
    Go = 0x09,
    /// Participant is leaving.
    Exit = 0x0A,
    /// Per-player setup info (exchange phase).
    Setup = 0x10,
    /// Arbitrator acknowledges a guest's setup.
    SetupAck = 0x11,
    /// Guest reports which setups it holds.
    KnownPlayers = 0x12,
    /// Authoritative game parameters.
    GameParams = 0x13,
    /// Guest acknowledges the game parameters.
    GameParamsAck = 0x14,
    /// Exchange phase is complete.
    SetupReady = 0x15,
    /// Steady-state tick data.
    Tick = 0x20,
    /// Round-trip probe.
    LatencyProbe = 0x21,
    /// Round-trip probe echo.
    LatencyAck = 0x22,
}

impl PacketType {
    /// Smallest tag available to extension packets.
    pub const FIRST_EXTENSION_TAG: u8 = 0x40;

    /// Highest tag any packet may use.
    pub const MAX_TAG: u8 = 0x7F;
}

/// Negotiated communication shape for the steady-state phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Topology {
    /// Every participant sends its own ticks to every other participant.
    #[default]
    PeerToPeer = 0,
    /// Guests send only to the arbitrator, which relays everything.
    Star = 1,
}

impl Topology {
    /// Decodes the wire value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::PeerToPeer),
            1 => Some(Self::Star),
            _ => None,
        }
    }
}

/// Protocol version triple carried by [`Connect`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    /// Breaking changes.
    pub major: u16,
    /// Compatible additions.
    pub minor: u16,
    /// Fixes.
    pub revision: u16,
}

impl ProtocolVersion {
    /// Version spoken by this build.
    pub const CURRENT: Self = Self {
        major: 1,
        minor: 0,
        revision: 0,
    };

    fn serialize<S: Serializer>(&mut self, s: &mut S) -> CodecResult<()> {
        s.u16(&mut self.major)?;
        s.u16(&mut self.minor)?;
        s.u16(&mut self.revision)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// Counts top-level fields while forwarding them to a serializer.
pub struct Args<'s, S> {
    serializer: &'s mut S,
    count: u8,
}

impl<'s, S: Serializer> Args<'s, S> {
    pub(crate) fn new(serializer: &'s mut S) -> Self {
        Self {
            serializer,
            count: 0,
        }
    }

    /// Fields processed so far.
    #[must_use]
    pub const fn count(&self) -> u8 {
        self.count
    }

    /// Direction of the underlying serializer.
    #[must_use]
    pub fn is_decoding(&self) -> bool {
        self.serializer.is_decoding()
    }

    fn counted(&mut self, result: CodecResult<()>) -> CodecResult<()> {
        result?;
        self.count = self.count.saturating_add(1);
        Ok(())
    }

    /// One `u8` field.
    pub fn u8(&mut self, value: &mut u8) -> CodecResult<()> {
        let r = self.serializer.u8(value);
        self.counted(r)
    }

    /// One `u16` field.
    pub fn u16(&mut self, value: &mut u16) -> CodecResult<()> {
        let r = self.serializer.u16(value);
        self.counted(r)
    }

    /// One `u32` field.
    pub fn u32(&mut self, value: &mut u32) -> CodecResult<()> {
        let r = self.serializer.u32(value);
        self.counted(r)
    }

    /// One string field.
    pub fn string(
        &mut self,
        value: &mut String,
        prefix: LengthPrefix,
        limit: LengthLimit,
    ) -> CodecResult<()> {
        let r = self.serializer.string(value, prefix, limit);
        self.counted(r)
    }

    /// One byte-array field.
    pub fn bytes(
        &mut self,
        value: &mut Vec<u8>,
        prefix: LengthPrefix,
        limit: LengthLimit,
    ) -> CodecResult<()> {
        let r = self.serializer.bytes(value, prefix, limit);
        self.counted(r)
    }

    /// One player-set field.
    pub fn set(&mut self, value: &mut PlayerSet) -> CodecResult<()> {
        let r = value.serialize(&mut *self.serializer);
        self.counted(r)
    }

    /// One compound field made of several primitives.
    pub fn nested(&mut self, f: impl FnOnce(&mut S) -> CodecResult<()>) -> CodecResult<()> {
        let r = f(&mut *self.serializer);
        self.counted(r)
    }
}

/// A packet kind: a tag, a declared field count and a field sequence.
pub trait PacketBody: Default {
    /// Wire tag.
    const TAG: u8;
    /// Number of top-level fields.
    const ARG_COUNT: u8;

    /// Runs the field sequence against `args`.
    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()>;

    /// False when the packet carries nothing worth sending.
    fn should_write(&self) -> bool {
        true
    }
}

/// A packet of a registered extension kind, kept in encoded form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawPacket {
    /// Extension tag.
    pub tag: u8,
    /// Full encoding, tag and argument count included.
    pub bytes: Vec<u8>,
}

impl RawPacket {
    /// Decodes the body as extension kind `T`.
    pub fn decode_as<T: PacketBody>(&self) -> ProtocolResult<T> {
        read_body::<T>(&mut Reader::new(&self.bytes))
    }

    fn write<S: Serializer>(&mut self, s: &mut S) -> ProtocolResult<bool> {
        s.raw(&mut self.bytes)?;
        Ok(true)
    }
}

macro_rules! packet_set {
    ($($variant:ident($body:ty)),* $(,)?) => {
        /// Every packet the protocol knows, as one closed sum type.
        #[derive(Clone, Debug, PartialEq)]
        pub enum Packet {
            $(
                #[doc = concat!("A `", stringify!($variant), "` packet.")]
                $variant($body),
            )*
            /// A packet of a registered extension kind.
            Extension(RawPacket),
        }

        impl Packet {
            /// Wire tag of this packet.
            #[must_use]
            pub fn tag(&self) -> u8 {
                match self {
                    $(Self::$variant(_) => <$body as PacketBody>::TAG,)*
                    Self::Extension(raw) => raw.tag,
                }
            }

            /// Writes the packet; `Ok(false)` when it chose not to be written.
            pub fn write<S: Serializer>(&mut self, s: &mut S) -> ProtocolResult<bool> {
                match self {
                    $(Self::$variant(body) => write_body(body, s),)*
                    Self::Extension(raw) => raw.write(s),
                }
            }
        }

        $(
            impl From<$body> for Packet {
                fn from(body: $body) -> Self {
                    Self::$variant(body)
                }
            }
        )*
    };
}

packet_set! {
    Connect(Connect),
    ConnectAck(ConnectAck),
    Reject(Reject),
    UserInfo(UserInfo),
    UserInfoAck(UserInfoAck),
    GameInfo(GameInfo),
    GameInfoAck(GameInfoAck),
    Heartbeat(Heartbeat),
    Go(Go),
    Exit(Exit),
    Setup(Setup),
    SetupAck(SetupAck),
    KnownPlayers(KnownPlayers),
    GameParams(GameParams),
    GameParamsAck(GameParamsAck),
    SetupReady(SetupReady),
    Tick(TickPacket),
    LatencyProbe(LatencyProbe),
    LatencyAck(LatencyAck),
}

// ============================================================================
// LOBBY (PHASE A)
// ============================================================================

/// Guest asks the host for a slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Connect {
    /// Guest's protocol version.
    pub version: ProtocolVersion,
    /// Password offered (empty for none).
    pub password: String,
    /// Checksum of the guest's loaded content.
    pub content_hash: u32,
}

impl PacketBody for Connect {
    const TAG: u8 = PacketType::Connect as u8;
    const ARG_COUNT: u8 = 3;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.nested(|s| self.version.serialize(s))?;
        args.string(
            &mut self.password,
            LengthPrefix::U8,
            LengthLimit::AtMost(MAX_PASSWORD_LEN),
        )?;
        args.u32(&mut self.content_hash)
    }
}

/// Host grants the guest a slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectAck {
    /// Slot assigned to the guest.
    pub slot: u8,
    /// Total participants the host expects.
    pub capacity: u8,
}

impl PacketBody for ConnectAck {
    const TAG: u8 = PacketType::ConnectAck as u8;
    const ARG_COUNT: u8 = 2;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.u8(&mut self.slot)?;
        args.u8(&mut self.capacity)
    }
}

/// Host refuses the guest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reject {
    /// Wire value of a [`Rejection`](crate::Rejection).
    pub reason: u8,
}

impl PacketBody for Reject {
    const TAG: u8 = PacketType::Reject as u8;
    const ARG_COUNT: u8 = 1;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.u8(&mut self.reason)
    }
}

/// Identity info for one participant, relayed by the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    /// Slot the info belongs to.
    pub slot: u8,
    /// Address the host sees for that slot (empty for the host itself).
    pub addr: String,
    /// Opaque `key\value` identity string.
    pub info: String,
}

impl PacketBody for UserInfo {
    const TAG: u8 = PacketType::UserInfo as u8;
    const ARG_COUNT: u8 = 3;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.u8(&mut self.slot)?;
        args.string(&mut self.addr, LengthPrefix::U8, LengthLimit::AtMost(MAX_NAME_LEN))?;
        args.string(&mut self.info, LengthPrefix::U16, LengthLimit::AtMost(MAX_INFO_LEN))
    }
}

/// Guest reports whose identity infos it holds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfoAck {
    /// Slots whose info the guest holds.
    pub known: PlayerSet,
}

impl PacketBody for UserInfoAck {
    const TAG: u8 = PacketType::UserInfoAck as u8;
    const ARG_COUNT: u8 = 1;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.set(&mut self.known)
    }
}

/// Tentative game settings sent to every waiting guest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GameInfo {
    /// Simulation ticks per network tick.
    pub ticdup: u8,
    /// Topology the host currently intends to use.
    pub topology: u8,
}

impl PacketBody for GameInfo {
    const TAG: u8 = PacketType::GameInfo as u8;
    const ARG_COUNT: u8 = 2;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.u8(&mut self.ticdup)?;
        args.u8(&mut self.topology)
    }
}

/// Guest acknowledges [`GameInfo`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GameInfoAck;

impl PacketBody for GameInfoAck {
    const TAG: u8 = PacketType::GameInfoAck as u8;
    const ARG_COUNT: u8 = 0;

    fn fields<S: Serializer>(&mut self, _args: &mut Args<'_, S>) -> CodecResult<()> {
        Ok(())
    }
}

/// Lobby heartbeat sent to ready guests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Heartbeat {
    /// Participants currently connected, host included.
    pub connected: u8,
    /// Participants the host is waiting for.
    pub capacity: u8,
}

impl PacketBody for Heartbeat {
    const TAG: u8 = PacketType::Heartbeat as u8;
    const ARG_COUNT: u8 = 2;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.u8(&mut self.connected)?;
        args.u8(&mut self.capacity)
    }
}

/// The lobby is closed and the game is starting.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Go {
    /// Final topology.
    pub topology: u8,
    /// Final set of participants.
    pub players: PlayerSet,
}

impl PacketBody for Go {
    const TAG: u8 = PacketType::Go as u8;
    const ARG_COUNT: u8 = 2;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.u8(&mut self.topology)?;
        args.set(&mut self.players)
    }
}

/// The sender is leaving the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exit {
    /// Nominated arbitrator successor, or [`NO_SUCCESSOR`].
    pub successor: u8,
}

impl Default for Exit {
    fn default() -> Self {
        Self {
            successor: NO_SUCCESSOR,
        }
    }
}

impl PacketBody for Exit {
    const TAG: u8 = PacketType::Exit as u8;
    const ARG_COUNT: u8 = 1;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.u8(&mut self.successor)
    }
}

// ============================================================================
// INFO EXCHANGE (PHASE B)
// ============================================================================

/// One participant's setup info.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Setup {
    /// Slot the setup belongs to.
    pub slot: u8,
    /// Opaque setup string.
    pub info: String,
}

impl PacketBody for Setup {
    const TAG: u8 = PacketType::Setup as u8;
    const ARG_COUNT: u8 = 2;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.u8(&mut self.slot)?;
        args.string(&mut self.info, LengthPrefix::U16, LengthLimit::AtMost(MAX_INFO_LEN))
    }
}

/// Arbitrator acknowledges a guest's own setup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetupAck {
    /// Slot whose setup was stored.
    pub slot: u8,
}

impl PacketBody for SetupAck {
    const TAG: u8 = PacketType::SetupAck as u8;
    const ARG_COUNT: u8 = 1;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.u8(&mut self.slot)
    }
}

/// Guest reports which setups it holds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KnownPlayers {
    /// Slots whose setup the guest holds.
    pub known: PlayerSet,
}

impl PacketBody for KnownPlayers {
    const TAG: u8 = PacketType::KnownPlayers as u8;
    const ARG_COUNT: u8 = 1;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.set(&mut self.known)
    }

    fn should_write(&self) -> bool {
        !self.known.is_empty()
    }
}

/// Authoritative game parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GameParams {
    /// Map to start on.
    pub map: String,
    /// Seed for the shared random stream.
    pub rng_seed: u32,
    /// Opaque game configuration.
    pub settings: Vec<u8>,
}

impl PacketBody for GameParams {
    const TAG: u8 = PacketType::GameParams as u8;
    const ARG_COUNT: u8 = 3;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.string(&mut self.map, LengthPrefix::U8, LengthLimit::AtMost(MAX_NAME_LEN))?;
        args.u32(&mut self.rng_seed)?;
        args.bytes(
            &mut self.settings,
            LengthPrefix::U16,
            LengthLimit::AtMost(MAX_SETTINGS_LEN),
        )
    }
}

/// Guest acknowledges [`GameParams`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GameParamsAck;

impl PacketBody for GameParamsAck {
    const TAG: u8 = PacketType::GameParamsAck as u8;
    const ARG_COUNT: u8 = 0;

    fn fields<S: Serializer>(&mut self, _args: &mut Args<'_, S>) -> CodecResult<()> {
        Ok(())
    }
}

/// Everyone knows everyone; the exchange phase is over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetupReady;

impl PacketBody for SetupReady {
    const TAG: u8 = PacketType::SetupReady as u8;
    const ARG_COUNT: u8 = 0;

    fn fields<S: Serializer>(&mut self, _args: &mut Args<'_, S>) -> CodecResult<()> {
        Ok(())
    }
}

// ============================================================================
// STEADY STATE
// ============================================================================

/// Round-trip probe.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LatencyProbe {
    /// Rolling probe index.
    pub index: u8,
    /// The prober's current average for the receiver, in milliseconds.
    pub reported_ms: u16,
}

impl PacketBody for LatencyProbe {
    const TAG: u8 = PacketType::LatencyProbe as u8;
    const ARG_COUNT: u8 = 2;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.u8(&mut self.index)?;
        args.u16(&mut self.reported_ms)
    }
}

/// Echo of a [`LatencyProbe`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LatencyAck {
    /// Index of the probe being answered.
    pub index: u8,
}

impl PacketBody for LatencyAck {
    const TAG: u8 = PacketType::LatencyAck as u8;
    const ARG_COUNT: u8 = 1;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.u8(&mut self.index)
    }
}
