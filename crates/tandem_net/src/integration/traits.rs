//! # Integration Traits
//!
//! Traits the embedding game implements so the core can drive it.
//!
//! The core never touches game state directly. It hands the simulation one
//! tick's worth of commands and event bytes at a time, asks it for local
//! input and for a digest of its state, and reports handshake progress
//! through a [`ProgressReporter`].

use std::cell::Cell;
use std::time::Instant;

use tracing::info;

use crate::codec::Reader;
use crate::protocol::InputCommand;
use crate::session::PlayerSet;

// ============================================================================
// SIMULATION
// ============================================================================

/// Everything one simulation tick consumes.
#[derive(Clone, Copy, Debug)]
pub struct TickInputs<'a> {
    /// Simulation tick being run (0-based).
    pub tick: u64,
    /// Participants in the game.
    pub players: PlayerSet,
    commands: &'a [InputCommand],
    events: &'a [Vec<u8>],
}

impl<'a> TickInputs<'a> {
    /// Bundles per-slot commands and event blobs, both indexed by slot.
    #[must_use]
    pub const fn new(
        tick: u64,
        players: PlayerSet,
        commands: &'a [InputCommand],
        events: &'a [Vec<u8>],
    ) -> Self {
        Self {
            tick,
            players,
            commands,
            events,
        }
    }

    /// Command of `slot`; neutral for absent players.
    #[must_use]
    pub fn command(&self, slot: u8) -> InputCommand {
        self.commands
            .get(usize::from(slot))
            .copied()
            .unwrap_or(InputCommand::NEUTRAL)
    }

    /// Raw event bytes of `slot` for this tick.
    #[must_use]
    pub fn raw_events(&self, slot: u8) -> &'a [u8] {
        self.events
            .get(usize::from(slot))
            .map_or(&[][..], Vec::as_slice)
    }

    /// Reader over the event bytes of `slot`.
    #[must_use]
    pub fn events(&self, slot: u8) -> Reader<'a> {
        Reader::new(self.raw_events(slot))
    }
}

/// The deterministic game being kept in lockstep.
pub trait Simulation {
    /// Advances the game by one tick.
    fn run_tick(&mut self, inputs: &TickInputs<'_>);

    /// Samples local input for real tick `tick`.
    fn sample_input(&mut self, tick: u64) -> InputCommand;

    /// Small digest of the current game state.
    fn consistency_checksum(&self) -> u16;
}

// ============================================================================
// TIME
// ============================================================================

/// Millisecond wall clock.
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin.
    fn now_millis(&self) -> u64;
}

/// Real time since construction.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Starts the clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Clock advanced by hand, for tests and in-process clusters.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    #[must_use]
    pub const fn new(start: u64) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.get()
    }
}

// ============================================================================
// HANDSHAKE PROGRESS
// ============================================================================

/// User-facing side of the handshake.
pub trait ProgressReporter {
    /// Shows how far the current phase has come.
    fn present_progress(&mut self, phase: &str, current: usize, total: usize);

    /// True when the host should start with whoever has joined.
    fn should_force_start(&mut self) -> bool {
        false
    }

    /// True when the user gave up waiting.
    fn abort_requested(&mut self) -> bool {
        false
    }
}

/// Reports progress through `tracing`, once per change.
#[derive(Debug, Default)]
pub struct LogProgress {
    last: Option<(String, usize, usize)>,
}

impl LogProgress {
    /// Creates a reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressReporter for LogProgress {
    fn present_progress(&mut self, phase: &str, current: usize, total: usize) {
        let unchanged = self
            .last
            .as_ref()
            .is_some_and(|(p, c, t)| p == phase && *c == current && *t == total);
        if !unchanged {
            info!(phase, current, total, "handshake progress");
            self.last = Some((phase.to_string(), current, total));
        }
    }
}

/// Silent reporter with fixed answers, for scripted runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptedProgress {
    /// Answer to [`ProgressReporter::should_force_start`].
    pub force_start: bool,
    /// Answer to [`ProgressReporter::abort_requested`].
    pub abort: bool,
}

impl ProgressReporter for ScriptedProgress {
    fn present_progress(&mut self, _phase: &str, _current: usize, _total: usize) {}

    fn should_force_start(&mut self) -> bool {
        self.force_start
    }

    fn abort_requested(&mut self) -> bool {
        self.abort
    }
}

// ============================================================================
// MOCK IMPLEMENTATIONS (For Testing)
// ============================================================================

fn fnv(state: u32, bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(state, |h, &b| (h ^ u32::from(b)).wrapping_mul(0x0100_0193))
}

/// Deterministic stand-in game.
///
/// Its state is a hash over every command and event byte it has consumed,
/// so two instances fed the same inputs report the same checksum.
#[derive(Clone, Debug)]
pub struct DeterministicSim {
    seed: u32,
    state: u32,
    ticks_run: u64,
    events_seen: usize,
}

impl DeterministicSim {
    /// Creates a game whose local input pattern depends on `seed`.
    #[must_use]
    pub const fn new(seed: u32) -> Self {
        Self {
            seed,
            state: 0x811C_9DC5,
            ticks_run: 0,
            events_seen: 0,
        }
    }

    /// Ticks run so far.
    #[must_use]
    pub const fn ticks_run(&self) -> u64 {
        self.ticks_run
    }

    /// Event bytes consumed so far.
    #[must_use]
    pub const fn events_seen(&self) -> usize {
        self.events_seen
    }

    /// Full state hash.
    #[must_use]
    pub const fn state(&self) -> u32 {
        self.state
    }

    /// Perturbs the state so later checksums diverge.
    pub fn corrupt(&mut self) {
        self.state ^= 0x5A5A_5A5A;
    }
}

impl Simulation for DeterministicSim {
    fn run_tick(&mut self, inputs: &TickInputs<'_>) {
        let mut state = fnv(self.state, &inputs.tick.to_le_bytes());
        for slot in inputs.players.iter() {
            let command = inputs.command(slot);
            state = fnv(state, &[slot]);
            state = fnv(state, &command.buttons.to_le_bytes());
            for axis in command.axes {
                state = fnv(state, &axis.to_le_bytes());
            }
            let events = inputs.raw_events(slot);
            state = fnv(state, events);
            self.events_seen += events.len();
        }
        self.state = state;
        self.ticks_run += 1;
    }

    fn sample_input(&mut self, tick: u64) -> InputCommand {
        let phase = (tick as u32).wrapping_add(self.seed.wrapping_mul(7));
        let mut axes = [0i16; crate::protocol::AXIS_COUNT];
        axes[crate::protocol::AXIS_FORWARD] = ((phase % 50) as i16 - 25) * 100;
        axes[crate::protocol::AXIS_YAW] = if phase % 16 < 8 { 320 } else { -320 };
        InputCommand::new((phase / 10) & 0x1F, axes)
    }

    fn consistency_checksum(&self) -> u16 {
        (self.state ^ (self.state >> 16)) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{LengthLimit, LengthPrefix, Serializer};

    #[test]
    fn test_identical_inputs_identical_checksums() {
        let mut a = DeterministicSim::new(1);
        let mut b = DeterministicSim::new(2);
        let commands = [a.sample_input(0), b.sample_input(0)];
        let events = vec![vec![1, 2], Vec::new()];
        let inputs = TickInputs::new(0, PlayerSet::first_n(2), &commands, &events);
        a.run_tick(&inputs);
        b.run_tick(&inputs);
        assert_eq!(a.consistency_checksum(), b.consistency_checksum());
        assert_eq!(a.events_seen(), 2);

        b.corrupt();
        assert_ne!(a.consistency_checksum(), b.consistency_checksum());
    }

    #[test]
    fn test_event_reader() {
        let mut bytes = Vec::new();
        {
            let mut w = crate::codec::GrowableWriter::new();
            w.string(&mut "hello".to_string(), LengthPrefix::U8, LengthLimit::Any).unwrap();
            bytes.extend_from_slice(w.as_slice());
        }
        let events = vec![Vec::new(), bytes];
        let inputs = TickInputs::new(3, PlayerSet::first_n(2), &[], &events);
        let mut reader = inputs.events(1);
        let mut text = String::new();
        reader.string(&mut text, LengthPrefix::U8, LengthLimit::Any).unwrap();
        assert_eq!(text, "hello");
        assert!(inputs.raw_events(0).is_empty());
        assert!(inputs.raw_events(9).is_empty());
        assert_eq!(inputs.command(1), InputCommand::NEUTRAL);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        clock.advance(28);
        assert_eq!(clock.now_millis(), 128);
    }

    #[test]
    fn test_log_progress_dedup() {
        let mut progress = LogProgress::new();
        progress.present_progress("lobby", 1, 2);
        progress.present_progress("lobby", 1, 2);
        assert!(!progress.should_force_start());
        assert!(!progress.abort_requested());
    }
}
