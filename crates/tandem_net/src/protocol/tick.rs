//! # Tick Packet
//!
//! The only packet exchanged once the game is running.
//!
//! ```text
//! flags (1) │ base seq (4) │ ack seq (4) │ consistency base (4) │ consistency ack (4)
//! [quitters: count (1) + slots]                       (FLAG_QUITTERS)
//! player count (1) │ tic count (1)
//! per player:
//!   slot (1) │ [latency ms (2)] │ checksum count (1) │ checksums (2 each)
//!   per tic: offset (1) │ event bytes (2 + n) │ command delta (1..)
//! ```
//!
//! Every player block carries the same tic count; tic `i` of a block is
//! sequence `base + offset`. Checksum `j` of a block belongs to sequence
//! `consistency base + j`.

use crate::codec::{CodecError, CodecResult, LengthLimit, LengthPrefix, Serializer};
use crate::MAX_PLAYERS;

use super::command::CommandDelta;
use super::packets::{Args, PacketBody, PacketType};

/// Sender is missing data from the receiver and asks for a resend.
pub const FLAG_RETRANSMIT: u8 = 1 << 0;
/// A quitter list follows the header.
pub const FLAG_QUITTERS: u8 = 1 << 1;
/// Player blocks carry an average latency (star topology).
pub const FLAG_LATENCY: u8 = 1 << 2;

/// Largest event blob attached to one tic.
pub const MAX_EVENT_BYTES: usize = 1024;

/// One tic of one player.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TicEntry {
    /// Sequence offset from the packet's base.
    pub offset: u8,
    /// Net-event bytes queued for the tic.
    pub events: Vec<u8>,
    /// Command relative to the player's previous command.
    pub delta: CommandDelta,
}

impl TicEntry {
    fn serialize<S: Serializer>(&mut self, s: &mut S) -> CodecResult<()> {
        s.u8(&mut self.offset)?;
        s.bytes(
            &mut self.events,
            LengthPrefix::U16,
            LengthLimit::AtMost(MAX_EVENT_BYTES),
        )?;
        self.delta.serialize(s)
    }
}

/// Everything a packet says about one player.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlayerBlock {
    /// Player slot.
    pub slot: u8,
    /// Average round-trip latency, present with [`FLAG_LATENCY`].
    pub latency_ms: u16,
    /// Consistency checksums starting at the packet's consistency base.
    pub consistency: Vec<u16>,
    /// Tics starting at the packet's base sequence.
    pub tics: Vec<TicEntry>,
}

fn count_u8(len: usize, what: &'static str) -> CodecResult<u8> {
    u8::try_from(len).map_err(|_| CodecError::InvalidValue {
        what,
        value: len as u64,
    })
}

impl PlayerBlock {
    fn serialize<S: Serializer>(
        &mut self,
        s: &mut S,
        with_latency: bool,
        tic_count: usize,
    ) -> CodecResult<()> {
        s.u8(&mut self.slot)?;
        if usize::from(self.slot) >= MAX_PLAYERS {
            return Err(CodecError::InvalidValue {
                what: "player slot",
                value: u64::from(self.slot),
            });
        }
        if with_latency {
            s.u16(&mut self.latency_ms)?;
        }

        let mut checksums = count_u8(self.consistency.len(), "checksum count")?;
        s.u8(&mut checksums)?;
        if s.is_decoding() {
            self.consistency.resize(usize::from(checksums), 0);
        }
        for value in &mut self.consistency {
            s.u16(value)?;
        }

        if s.is_decoding() {
            self.tics.resize_with(tic_count, TicEntry::default);
        } else if self.tics.len() != tic_count {
            return Err(CodecError::InvalidValue {
                what: "tic count of player block",
                value: self.tics.len() as u64,
            });
        }
        for tic in &mut self.tics {
            tic.serialize(s)?;
        }
        Ok(())
    }
}

/// Steady-state tick packet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickPacket {
    /// `FLAG_*` bits.
    pub flags: u8,
    /// Sequence of tic offset zero.
    pub base_sequence: u32,
    /// Last sequence the sender has confirmed from the receiver.
    pub ack_sequence: u32,
    /// Sequence of the first checksum in every block.
    pub consistency_base: u32,
    /// Last sequence whose checksums the sender holds from the receiver.
    pub consistency_ack: u32,
    /// Slots that left the session (with [`FLAG_QUITTERS`]).
    pub quitters: Vec<u8>,
    /// Per-player data.
    pub players: Vec<PlayerBlock>,
}

impl TickPacket {
    /// Tics per player block.
    #[must_use]
    pub fn tic_count(&self) -> usize {
        self.players.first().map_or(0, |p| p.tics.len())
    }

    /// True when `flag` is set.
    #[inline]
    #[must_use]
    pub const fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

impl PacketBody for TickPacket {
    const TAG: u8 = PacketType::Tick as u8;
    const ARG_COUNT: u8 = 7;

    fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
        args.u8(&mut self.flags)?;
        let flags = self.flags;
        args.u32(&mut self.base_sequence)?;
        args.u32(&mut self.ack_sequence)?;
        args.u32(&mut self.consistency_base)?;
        args.u32(&mut self.consistency_ack)?;

        let quitters = &mut self.quitters;
        args.nested(|s| {
            if flags & FLAG_QUITTERS == 0 {
                return Ok(());
            }
            s.bytes(quitters, LengthPrefix::U8, LengthLimit::AtMost(MAX_PLAYERS))
        })?;

        let with_latency = flags & FLAG_LATENCY != 0;
        let players = &mut self.players;
        args.nested(|s| {
            let mut player_count = count_u8(players.len(), "player count")?;
            let mut tic_count =
                count_u8(players.first().map_or(0, |p| p.tics.len()), "tic count")?;
            s.u8(&mut player_count)?;
            s.u8(&mut tic_count)?;
            if s.is_decoding() {
                if usize::from(player_count) > MAX_PLAYERS {
                    return Err(CodecError::InvalidValue {
                        what: "player count",
                        value: u64::from(player_count),
                    });
                }
                players.resize_with(usize::from(player_count), PlayerBlock::default);
            }
            for block in players.iter_mut() {
                block.serialize(s, with_latency, usize::from(tic_count))?;
            }
            Ok(())
        })
    }

    fn should_write(&self) -> bool {
        self.flags != 0
            || !self.players.is_empty()
            || self.ack_sequence != 0
            || self.consistency_ack != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{GrowableWriter, Measurer, Reader};
    use crate::protocol::command::InputCommand;
    use crate::protocol::registry::{read_body, skip_body, write_body};

    fn tic(offset: u8, forward: i16, events: &[u8]) -> TicEntry {
        let mut cmd = InputCommand::NEUTRAL;
        cmd.axes[3] = forward;
        TicEntry {
            offset,
            events: events.to_vec(),
            delta: CommandDelta::between(&InputCommand::NEUTRAL, &cmd),
        }
    }

    fn sample() -> TickPacket {
        TickPacket {
            flags: FLAG_LATENCY | FLAG_QUITTERS,
            base_sequence: 41,
            ack_sequence: 39,
            consistency_base: 30,
            consistency_ack: 28,
            quitters: vec![3],
            players: vec![
                PlayerBlock {
                    slot: 0,
                    latency_ms: 0,
                    consistency: vec![0xAAAA, 0xBBBB],
                    tics: vec![tic(0, 10, &[1, 2, 3]), tic(1, 20, &[])],
                },
                PlayerBlock {
                    slot: 2,
                    latency_ms: 85,
                    consistency: vec![],
                    tics: vec![tic(0, -5, &[]), tic(1, -5, &[9])],
                },
            ],
        }
    }

    #[test]
    fn test_tick_packet_decode_matches() {
        let mut packet = sample();
        let mut out = GrowableWriter::new();
        assert!(write_body(&mut packet, &mut out).unwrap());
        let bytes = out.into_inner();

        let back: TickPacket = read_body(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(back, packet);
        assert_eq!(back.tic_count(), 2);

        let skipped = skip_body::<TickPacket>(&mut Measurer::new(&bytes)).unwrap();
        assert_eq!(skipped, bytes.len());
    }

    #[test]
    fn test_latency_only_with_flag() {
        let mut with = sample();
        let mut without = sample();
        without.flags &= !FLAG_LATENCY;
        let (mut a, mut b) = (GrowableWriter::new(), GrowableWriter::new());
        write_body(&mut with, &mut a).unwrap();
        write_body(&mut without, &mut b).unwrap();
        assert_eq!(a.len(), b.len() + 2 * 2);
    }

    #[test]
    fn test_quitters_absent_without_flag() {
        let mut packet = sample();
        packet.flags = 0;
        let mut out = GrowableWriter::new();
        write_body(&mut packet, &mut out).unwrap();
        let back: TickPacket = read_body(&mut Reader::new(out.as_slice())).unwrap();
        assert!(back.quitters.is_empty());
    }

    #[test]
    fn test_ragged_blocks_rejected() {
        let mut packet = sample();
        packet.players[1].tics.pop();
        let mut out = GrowableWriter::new();
        assert!(write_body(&mut packet, &mut out).is_err());
    }

    #[test]
    fn test_empty_packet_not_written() {
        let mut packet = TickPacket::default();
        let mut out = GrowableWriter::new();
        assert!(!write_body(&mut packet, &mut out).unwrap());
        packet.ack_sequence = 1;
        assert!(write_body(&mut packet, &mut out).unwrap());
    }
}
