//! # Peer State
//!
//! Per-participant sequence tracking for the lockstep engine.
//!
//! ## Design
//!
//! - Fixed-depth ring of tick records, indexed by `sequence % RING_DEPTH`
//!   and validated by the stored sequence, so stale slots never alias
//! - Strict in-order acceptance: only `current + 1` is taken, a gap raises
//!   the missing flag instead of buffering
//! - Desync is sticky: the first divergence is remembered forever

use crate::protocol::{CommandDelta, InputCommand};
use crate::RING_DEPTH;

use super::latency::LatencyTracker;

/// One network tick of one participant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickRecord {
    /// Sequence of the tick; 0 marks an empty slot.
    pub sequence: u32,
    /// Decoded command.
    pub command: InputCommand,
    /// Net-event bytes produced on the tick.
    pub events: Vec<u8>,
}

/// Backlog of recent tick records.
#[derive(Clone, Debug)]
pub struct TickRing {
    records: Vec<TickRecord>,
}

impl TickRing {
    /// Creates an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: vec![TickRecord::default(); RING_DEPTH],
        }
    }

    #[inline]
    fn index(sequence: u32) -> usize {
        sequence as usize % RING_DEPTH
    }

    /// Stores a record, overwriting whatever shared its slot.
    pub fn insert(&mut self, sequence: u32, command: InputCommand, events: Vec<u8>) {
        self.records[Self::index(sequence)] = TickRecord {
            sequence,
            command,
            events,
        };
    }

    /// Record for `sequence`, if still held.
    #[must_use]
    pub fn get(&self, sequence: u32) -> Option<&TickRecord> {
        let record = &self.records[Self::index(sequence)];
        (sequence != 0 && record.sequence == sequence).then_some(record)
    }

    /// Delta basis for the tick after `sequence`.
    ///
    /// Sequence 0 is the start of the stream, whose basis is neutral.
    #[must_use]
    pub fn basis(&self, sequence: u32) -> Option<InputCommand> {
        if sequence == 0 {
            return Some(InputCommand::NEUTRAL);
        }
        self.get(sequence).map(|r| r.command)
    }
}

impl Default for TickRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Recent consistency checksums keyed by sequence.
#[derive(Clone, Debug)]
pub struct ConsistencyRing {
    entries: [(u32, u16); RING_DEPTH],
}

impl ConsistencyRing {
    /// Creates an empty ring.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [(0, 0); RING_DEPTH],
        }
    }

    /// Stores the checksum of `sequence`.
    pub fn insert(&mut self, sequence: u32, checksum: u16) {
        self.entries[sequence as usize % RING_DEPTH] = (sequence, checksum);
    }

    /// Checksum of `sequence`, if still held.
    #[must_use]
    pub fn get(&self, sequence: u32) -> Option<u16> {
        let (stored, checksum) = self.entries[sequence as usize % RING_DEPTH];
        (sequence != 0 && stored == sequence).then_some(checksum)
    }
}

impl Default for ConsistencyRing {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to one received tic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TicOutcome {
    /// Next in order; stored.
    Accepted,
    /// Already held.
    Duplicate,
    /// Ahead of the stream or outside the backlog; missing flag raised.
    Gap,
}

/// Everything one node tracks about one participant (itself included).
#[derive(Clone, Debug)]
pub struct PeerState {
    pub(crate) ring: TickRing,
    pub(crate) checksums: ConsistencyRing,
    /// Highest sequence held from this participant.
    pub(crate) current_sequence: u32,
    /// Highest sequence this participant confirmed from us.
    pub(crate) sequence_ack: u32,
    /// Highest sequence sent to this participant.
    pub(crate) sent_up_to: u32,
    /// We lack data from this participant and ask for a resend.
    pub(crate) missing: bool,
    /// This participant is holding the game up.
    pub(crate) waiting: bool,
    desynced: bool,
    first_desync: Option<u32>,
    /// Highest own checksum this participant confirmed.
    pub(crate) cons_ack: u32,
    /// Highest own checksum sent to this participant.
    pub(crate) cons_sent: u32,
    /// Highest checksum received from this participant.
    pub(crate) cons_recv: u32,
    pub(crate) latency: LatencyTracker,
    pub(crate) reported_latency_ms: u16,
    pub(crate) last_recv_ms: u64,
    pub(crate) last_send_ms: u64,
}

impl PeerState {
    /// Fresh state, as at game start.
    #[must_use]
    pub fn new(now_ms: u64) -> Self {
        Self {
            ring: TickRing::new(),
            checksums: ConsistencyRing::new(),
            current_sequence: 0,
            sequence_ack: 0,
            sent_up_to: 0,
            missing: false,
            waiting: false,
            desynced: false,
            first_desync: None,
            cons_ack: 0,
            cons_sent: 0,
            cons_recv: 0,
            latency: LatencyTracker::new(),
            reported_latency_ms: 0,
            last_recv_ms: now_ms,
            last_send_ms: now_ms,
        }
    }

    /// Highest sequence held from this participant.
    #[must_use]
    pub const fn current_sequence(&self) -> u32 {
        self.current_sequence
    }

    /// Highest sequence this participant has confirmed from us.
    #[must_use]
    pub const fn sequence_ack(&self) -> u32 {
        self.sequence_ack
    }

    /// True while a resend is being requested from this participant.
    #[must_use]
    pub const fn is_missing(&self) -> bool {
        self.missing
    }

    /// True while the game is stalled on this participant.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// True once any checksum from this participant disagreed with ours.
    #[must_use]
    pub const fn is_desynced(&self) -> bool {
        self.desynced
    }

    /// Sequence of the first disagreeing checksum.
    #[must_use]
    pub const fn first_desync(&self) -> Option<u32> {
        self.first_desync
    }

    /// Average measured round trip to this participant.
    #[must_use]
    pub fn average_latency_ms(&self) -> u16 {
        self.latency.average_ms()
    }

    /// Latency reported for this participant by the authority or the peer.
    #[must_use]
    pub const fn reported_latency_ms(&self) -> u16 {
        self.reported_latency_ms
    }

    /// Time the last packet arrived from this participant.
    #[must_use]
    pub const fn last_recv_ms(&self) -> u64 {
        self.last_recv_ms
    }

    /// Tick backlog.
    #[must_use]
    pub const fn ring(&self) -> &TickRing {
        &self.ring
    }

    /// Appends the next tick of the local stream.
    pub(crate) fn push_local(&mut self, command: InputCommand, events: Vec<u8>) -> u32 {
        let sequence = self.current_sequence + 1;
        self.ring.insert(sequence, command, events);
        self.current_sequence = sequence;
        sequence
    }

    /// Offers a received tic; sequences beyond `limit` would overwrite
    /// records still needed and count as a gap.
    pub(crate) fn accept_tic(
        &mut self,
        sequence: u32,
        delta: &CommandDelta,
        events: Vec<u8>,
        limit: u32,
    ) -> TicOutcome {
        if sequence <= self.current_sequence {
            return TicOutcome::Duplicate;
        }
        if sequence != self.current_sequence + 1 || sequence > limit {
            self.missing = true;
            return TicOutcome::Gap;
        }
        let Some(basis) = self.ring.basis(self.current_sequence) else {
            self.missing = true;
            return TicOutcome::Gap;
        };
        self.ring.insert(sequence, delta.apply(&basis), events);
        self.current_sequence = sequence;
        self.waiting = false;
        TicOutcome::Accepted
    }

    /// Stores checksums this participant computed, the first one being for
    /// `base`. Returns the sequences newly stored.
    ///
    /// Only a batch that continues `cons_recv` is taken, so the ack never
    /// covers a checksum we did not see. A gap is skipped only once the
    /// sender can no longer hold the missing values.
    pub(crate) fn store_checksums(&mut self, base: u32, values: &[u16]) -> Vec<(u32, u16)> {
        let mut stored = Vec::new();
        if base == 0 || values.is_empty() {
            return stored;
        }
        let last = base + values.len() as u32 - 1;
        let oldest_held = last.saturating_sub(RING_DEPTH as u32 - 1);
        if base > self.cons_recv + 1 && oldest_held <= self.cons_recv + 1 {
            return stored;
        }
        for (sequence, &value) in (base..).zip(values) {
            if sequence <= self.cons_recv {
                continue;
            }
            self.checksums.insert(sequence, value);
            self.cons_recv = sequence;
            stored.push((sequence, value));
        }
        stored
    }

    /// Compares our checksum of `sequence` with theirs; true on the first
    /// divergence only.
    pub(crate) fn compare(&mut self, sequence: u32, ours: u16, theirs: u16) -> bool {
        if ours == theirs || self.desynced {
            return false;
        }
        self.desynced = true;
        self.first_desync = Some(sequence);
        true
    }

    /// Rewinds resend cursors to what this participant confirmed.
    pub(crate) fn rewind(&mut self) {
        self.sent_up_to = self.sequence_ack;
        self.cons_sent = self.cons_ack;
    }
}
