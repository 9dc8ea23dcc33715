//! # Lockstep Engine
//!
//! Steady-state tick exchange once the handshake has finished.
//!
//! ## Frame Order
//!
//! ```text
//! receive ──► probe latency ──► sample input ──► run simulation
//!                                                      │
//!            send tick packets ◄── stall check ◄───────┘
//! ```
//!
//! The simulation never runs past the lowest sequence held from every
//! participant. Each participant's stream is sequenced on its own and
//! accepted strictly in order; gaps are repaired by retransmit requests
//! that ride on the normal send cycle.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::error::{NetResult, Rejection};
use crate::handshake::StartInfo;
use crate::integration::{Simulation, TickInputs};
use crate::protocol::{
    collapse_ticdup, CommandDelta, Go, InputCommand, LatencyAck, LatencyProbe, Packet,
    PlayerBlock, Reject, SetupReady, TicEntry, TickPacket, Topology, FLAG_LATENCY,
    FLAG_QUITTERS, FLAG_RETRANSMIT, NO_SUCCESSOR,
};
use crate::session::{ParticipantStatus, PlayerSet, Session};
use crate::transport::Channel;
use crate::{EXIT_REPEAT, MAX_PACKET_SIZE, MAX_PLAYERS, MAX_SEND_AHEAD, MAX_TICS_PER_PACKET, RING_DEPTH};

use super::clock::{FrameStats, TickClock};
use super::events::NetEventStream;
use super::latency::equalization_delay;
use super::peer::{ConsistencyRing, PeerState, TicOutcome};

/// Quiet time after which the latest tick is resent as a keep-alive.
pub const HEARTBEAT_MS: u64 = 100;

/// Interval between latency probes.
pub const PROBE_INTERVAL_MS: u64 = 250;

/// Frames a quitter list rides on outgoing packets.
const QUITTER_REPEAT: u8 = 8;

/// What one call to [`SyncEngine::frame`] did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// Simulation ticks run.
    pub ticks_run: u32,
    /// Network ticks generated from local input.
    pub generated: u32,
    /// Participants the game is stalled on.
    pub waiting_on: PlayerSet,
    /// Participants that left.
    pub departed: Vec<u8>,
    /// New arbitrator, when it changed.
    pub new_arbitrator: Option<u8>,
    /// Participants whose checksums diverged for the first time.
    pub desynced: PlayerSet,
}

/// Lockstep tick synchronization over an established session.
pub struct SyncEngine {
    session: Session,
    start: StartInfo,
    local: u8,
    topology: Topology,
    ticdup: u64,
    in_game: PlayerSet,
    peers: Vec<PeerState>,
    own_checksums: ConsistencyRing,
    /// Highest sequence with a local checksum.
    checksummed: u32,
    clock: TickClock,
    /// Real ticks run by the simulation.
    gametic: u64,
    /// Real ticks sampled from local input.
    generated: u64,
    samples: Vec<InputCommand>,
    delay_queue: VecDeque<InputCommand>,
    input_delay: u8,
    events: NetEventStream,
    single_step: bool,
    loading: bool,
    last_lowest: u32,
    last_progress_ms: u64,
    last_probe_ms: u64,
    quitters: Vec<u8>,
    quitter_frames: u8,
    report: FrameReport,
}

impl SyncEngine {
    /// Takes over `session` after the handshake reported `start`.
    #[must_use]
    pub fn new(mut session: Session, start: StartInfo, now_ms: u64) -> Self {
        session.roster.retain(start.players);
        session.roster.set_all_status(ParticipantStatus::InGame);
        session.roster.set_arbitrator(start.arbitrator);
        let clock = TickClock::new(session.config.tick_rate, now_ms);
        info!(
            local = start.local,
            players = start.players.len(),
            topology = ?start.topology,
            ticdup = start.ticdup,
            "lockstep started"
        );
        Self {
            local: start.local,
            topology: start.topology,
            ticdup: u64::from(start.ticdup.max(1)),
            in_game: start.players,
            peers: (0..MAX_PLAYERS).map(|_| PeerState::new(now_ms)).collect(),
            own_checksums: ConsistencyRing::new(),
            checksummed: 0,
            clock,
            gametic: 0,
            generated: 0,
            samples: Vec::new(),
            delay_queue: VecDeque::new(),
            input_delay: 0,
            events: NetEventStream::new(),
            single_step: false,
            loading: false,
            last_lowest: 0,
            last_progress_ms: now_ms,
            last_probe_ms: now_ms,
            quitters: Vec::new(),
            quitter_frames: 0,
            report: FrameReport::default(),
            session,
            start,
        }
    }

    /// Runs one frame: receive, sample, simulate, send.
    ///
    /// A datagram that fails to decode aborts the frame with the decode
    /// error; the datagram is dropped and the next frame carries on.
    pub fn frame(&mut self, sim: &mut dyn Simulation, now_ms: u64) -> NetResult<FrameReport> {
        self.receive(now_ms)?;
        self.probe_latency(now_ms)?;
        self.update_input_delay();
        self.generate(sim, now_ms);
        self.run_simulation(sim, now_ms);
        self.detect_stall(now_ms);
        self.send_ticks(now_ms)?;
        if self.quitter_frames > 0 {
            self.quitter_frames -= 1;
            if self.quitter_frames == 0 {
                self.quitters.clear();
            }
        }
        Ok(std::mem::take(&mut self.report))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Event bytes attached to the next generated tick.
    pub fn events(&mut self) -> &mut NetEventStream {
        &mut self.events
    }

    /// Limits the simulation to one tick per frame while set.
    pub fn set_single_step(&mut self, enabled: bool) {
        self.single_step = enabled;
    }

    /// Limits the simulation to one tick per frame while a level loads.
    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    /// State tracked for `slot`, while it is in the game.
    #[must_use]
    pub fn peer(&self, slot: u8) -> Option<&PeerState> {
        self.in_game
            .contains(slot)
            .then(|| &self.peers[usize::from(slot)])
    }

    /// Lowest sequence held from every participant.
    #[must_use]
    pub fn lowest_sequence(&self) -> u32 {
        self.in_game
            .iter()
            .map(|slot| self.peers[usize::from(slot)].current_sequence)
            .min()
            .unwrap_or(0)
    }

    /// Simulation ticks run so far.
    #[must_use]
    pub const fn gametic(&self) -> u64 {
        self.gametic
    }

    /// Participants still in the game.
    #[must_use]
    pub const fn players(&self) -> PlayerSet {
        self.in_game
    }

    /// Local slot.
    #[must_use]
    pub const fn local_slot(&self) -> u8 {
        self.local
    }

    /// Current arbitrator.
    #[must_use]
    pub const fn arbitrator(&self) -> u8 {
        self.session.roster.arbitrator()
    }

    /// Negotiated topology.
    #[must_use]
    pub const fn topology(&self) -> Topology {
        self.topology
    }

    /// Input delay applied to local commands, in network ticks.
    #[must_use]
    pub const fn input_delay(&self) -> u8 {
        self.input_delay
    }

    /// Participants whose checksums ever disagreed with ours.
    #[must_use]
    pub fn desynced(&self) -> PlayerSet {
        self.in_game
            .iter()
            .filter(|&slot| self.peers[usize::from(slot)].is_desynced())
            .collect()
    }

    /// True once any participant diverged.
    #[must_use]
    pub fn is_desynced(&self) -> bool {
        !self.desynced().is_empty()
    }

    /// Handshake outcome the game started from.
    #[must_use]
    pub const fn start_info(&self) -> &StartInfo {
        &self.start
    }

    /// Underlying session.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Frame statistics.
    #[must_use]
    pub const fn frame_stats(&self) -> &FrameStats {
        self.clock.stats()
    }

    /// Time until the next simulation tick is due.
    #[must_use]
    pub fn until_next_tick(&self, now_ms: u64) -> Duration {
        self.clock.until_tick(self.clock.entered(now_ms), now_ms)
    }

    // ------------------------------------------------------------------
    // Departure
    // ------------------------------------------------------------------

    /// Evicts `slot` on the caller's decision; reported by the next frame.
    pub fn drop_participant(&mut self, slot: u8, now_ms: u64) -> bool {
        let present = slot != self.local && self.in_game.contains(slot);
        self.depart(slot, None, now_ms);
        present
    }

    /// Tells everyone we are leaving, nominating a successor when we hold
    /// the arbitrator role.
    pub fn leave(&mut self) -> NetResult<()> {
        let successor = if self.session.roster.is_arbitrator() {
            let mut others = self.in_game;
            others.remove(self.local);
            others.first().unwrap_or(NO_SUCCESSOR)
        } else {
            NO_SUCCESSOR
        };
        info!(successor, "leaving game");
        self.session.announce_exit(successor, EXIT_REPEAT)
    }

    fn depart(&mut self, slot: u8, nominee: Option<u8>, now_ms: u64) {
        if slot == self.local || !self.in_game.contains(slot) {
            return;
        }
        self.in_game.remove(slot);
        self.session.roster.remove(slot);
        self.peers[usize::from(slot)] = PeerState::new(now_ms);
        self.report.departed.push(slot);
        info!(slot, remaining = self.in_game.len(), "participant left");

        if let Some(successor) = self.session.roster.migrate_arbitrator(slot, nominee) {
            self.report.new_arbitrator = Some(successor);
            if self.topology == Topology::Star {
                // Measurements against the old hub say nothing about the new one.
                for remote in self.in_game.iter().filter(|&s| s != self.local) {
                    let peer = &mut self.peers[usize::from(remote)];
                    peer.latency.reset();
                    peer.reported_latency_ms = 0;
                    peer.missing = true;
                }
                self.peers[usize::from(self.local)].reported_latency_ms = 0;
            }
        }

        if self.session.roster.is_arbitrator() {
            if !self.quitters.contains(&slot) {
                self.quitters.push(slot);
            }
            self.quitter_frames = QUITTER_REPEAT;
        }
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    fn is_hub(&self) -> bool {
        self.topology == Topology::Star && self.session.roster.is_arbitrator()
    }

    fn is_spoke(&self) -> bool {
        self.topology == Topology::Star && !self.session.roster.is_arbitrator()
    }

    /// Participants this node sends tick packets to.
    fn destinations(&self) -> PlayerSet {
        let mut remote = self.in_game;
        remote.remove(self.local);
        if self.is_spoke() {
            let hub = self.session.roster.arbitrator();
            return if remote.contains(hub) {
                PlayerSet::single(hub)
            } else {
                PlayerSet::EMPTY
            };
        }
        remote
    }

    /// Streams carried in packets to `dest`.
    fn streams_for(&self, dest: u8) -> PlayerSet {
        if self.is_hub() {
            let mut streams = self.in_game;
            streams.remove(dest);
            streams
        } else {
            PlayerSet::single(self.local)
        }
    }

    /// Sequence acknowledged in packets to `dest`.
    fn ack_for(&self, dest: u8) -> u32 {
        if self.is_spoke() {
            return self
                .in_game
                .iter()
                .filter(|&s| s != self.local)
                .map(|s| self.peers[usize::from(s)].current_sequence)
                .min()
                .unwrap_or(0);
        }
        self.peers[usize::from(dest)].current_sequence
    }

    fn consumed_sequence(&self) -> u32 {
        u32::try_from(self.gametic / self.ticdup).unwrap_or(u32::MAX)
    }

    /// Oldest sequence whose records must survive in every ring.
    fn retention_floor(&self) -> u32 {
        let consumed = self.consumed_sequence();
        if !self.is_hub() {
            return consumed;
        }
        self.destinations()
            .iter()
            .map(|d| self.peers[usize::from(d)].sequence_ack)
            .fold(consumed, u32::min)
    }

    // ------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------

    fn receive(&mut self, now_ms: u64) -> NetResult<()> {
        while let Some((from, packet)) = self.session.channel.recv()? {
            self.dispatch(from, packet, now_ms)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, from: SocketAddr, packet: Packet, now_ms: u64) -> NetResult<()> {
        let Some(sender) = self.session.roster.find_by_addr(from) else {
            if matches!(packet, Packet::Connect(_)) {
                debug!(%from, "connect refused, game in progress");
                let mut reject = Reject {
                    reason: Rejection::AlreadyInProgress as u8,
                };
                self.session.channel.send(from, &mut reject)?;
            }
            return Ok(());
        };
        if !self.in_game.contains(sender) {
            return Ok(());
        }
        self.peers[usize::from(sender)].last_recv_ms = now_ms;
        if let Some(participant) = self.session.roster.get_mut(sender) {
            participant.last_recv_ms = now_ms;
        }

        match packet {
            Packet::Tick(tick) => self.receive_tick(sender, tick, now_ms),
            Packet::LatencyProbe(probe) => {
                if self.topology == Topology::PeerToPeer {
                    self.peers[usize::from(sender)].reported_latency_ms = probe.reported_ms;
                } else if sender == self.session.roster.arbitrator() {
                    self.peers[usize::from(self.local)].reported_latency_ms = probe.reported_ms;
                }
                self.session
                    .channel
                    .send(from, &mut LatencyAck { index: probe.index })?;
            }
            Packet::LatencyAck(ack) => {
                let rtt = self.peers[usize::from(sender)]
                    .latency
                    .complete_probe(ack.index, now_ms);
                trace!(sender, ?rtt, "latency sample");
            }
            Packet::Exit(exit) => {
                let nominee = (exit.successor != NO_SUCCESSOR).then_some(exit.successor);
                self.depart(sender, nominee, now_ms);
            }
            Packet::Connect(_)
            | Packet::UserInfo(_)
            | Packet::UserInfoAck(_)
            | Packet::GameInfoAck(_)
            | Packet::Setup(_)
            | Packet::KnownPlayers(_)
            | Packet::GameParamsAck(_) => {
                if self.session.roster.is_arbitrator() {
                    self.answer_late(from)?;
                }
            }
            other => trace!(tag = other.tag(), sender, "ignored during game"),
        }
        Ok(())
    }

    /// Replays the end of the handshake for a participant that missed it.
    fn answer_late(&mut self, to: SocketAddr) -> NetResult<()> {
        let mut packets = [
            Packet::from(Go {
                topology: self.topology as u8,
                players: self.in_game,
            }),
            Packet::from(self.start.params.clone()),
            Packet::from(SetupReady),
        ];
        debug!(%to, "answering late handshake packet");
        self.session.channel.send_packets(to, &mut packets)?;
        Ok(())
    }

    fn receive_tick(&mut self, sender: u8, mut tick: TickPacket, now_ms: u64) {
        {
            let peer = &mut self.peers[usize::from(sender)];
            peer.sequence_ack = peer.sequence_ack.max(tick.ack_sequence);
            peer.cons_ack = peer.cons_ack.max(tick.consistency_ack);
            if tick.has(FLAG_RETRANSMIT) {
                trace!(sender, from = peer.sequence_ack, "retransmit requested");
                peer.rewind();
            }
        }

        let hub = self.session.roster.arbitrator();
        if tick.has(FLAG_QUITTERS) && sender == hub {
            for &quitter in &tick.quitters {
                self.depart(quitter, None, now_ms);
            }
        }

        let limit = self.retention_floor().saturating_add(RING_DEPTH as u32 - 1);
        let relayed = self.topology == Topology::Star && sender == hub;
        for block in &mut tick.players {
            let slot = block.slot;
            if slot == self.local || !self.in_game.contains(slot) {
                continue;
            }
            if slot != sender && !relayed {
                continue;
            }
            let peer = &mut self.peers[usize::from(slot)];
            if tick.flags & FLAG_LATENCY != 0 {
                peer.reported_latency_ms = block.latency_ms;
            }

            if slot == sender {
                for (sequence, theirs) in peer.store_checksums(tick.consistency_base, &block.consistency) {
                    if let Some(ours) = self.own_checksums.get(sequence) {
                        if peer.compare(sequence, ours, theirs) {
                            warn!(slot, sequence, ours, theirs, "consistency failure");
                            self.report.desynced.insert(slot);
                        }
                    }
                }
            }

            let mut tics = std::mem::take(&mut block.tics);
            tics.sort_by_key(|t| t.offset);
            for tic in tics {
                let sequence = tick.base_sequence.saturating_add(u32::from(tic.offset));
                if peer.accept_tic(sequence, &tic.delta, tic.events, limit) == TicOutcome::Gap {
                    trace!(slot, sequence, held = peer.current_sequence, "tic gap");
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Latency
    // ------------------------------------------------------------------

    fn probe_latency(&mut self, now_ms: u64) -> NetResult<()> {
        if now_ms.saturating_sub(self.last_probe_ms) < PROBE_INTERVAL_MS || self.is_spoke() {
            return Ok(());
        }
        self.last_probe_ms = now_ms;
        for slot in self.destinations().iter() {
            let peer = &mut self.peers[usize::from(slot)];
            let mut probe = LatencyProbe {
                index: peer.latency.begin_probe(now_ms),
                reported_ms: peer.latency.average_ms(),
            };
            self.session.send_to_slot(slot, &mut probe)?;
        }
        Ok(())
    }

    fn update_input_delay(&mut self) {
        if self.topology != Topology::Star {
            self.input_delay = 0;
            return;
        }
        let (own, highest) = if self.is_hub() {
            let highest = self
                .destinations()
                .iter()
                .map(|s| self.peers[usize::from(s)].latency.average_ms())
                .max()
                .unwrap_or(0);
            (0, highest)
        } else {
            let own = self.peers[usize::from(self.local)].reported_latency_ms;
            let highest = self
                .in_game
                .iter()
                .map(|s| self.peers[usize::from(s)].reported_latency_ms)
                .max()
                .unwrap_or(0);
            (own, highest.max(own))
        };
        let delay = equalization_delay(highest, own, self.clock.tick_ms() * self.ticdup);
        if delay != self.input_delay {
            debug!(from = self.input_delay, to = delay, own, highest, "input delay changed");
            self.input_delay = delay;
        }
    }

    // ------------------------------------------------------------------
    // Local input
    // ------------------------------------------------------------------

    /// Highest own sequence the backlog can hold for resends.
    fn send_cap(&self) -> u32 {
        self.destinations()
            .iter()
            .map(|d| self.peers[usize::from(d)].sequence_ack)
            .fold(self.consumed_sequence(), u32::min)
            .saturating_add(MAX_SEND_AHEAD)
    }

    fn generate(&mut self, sim: &mut dyn Simulation, now_ms: u64) {
        let limit = self
            .clock
            .entered(now_ms)
            .min(u64::from(self.send_cap()) * self.ticdup);
        while self.generated < limit {
            self.samples.push(sim.sample_input(self.generated));
            self.generated += 1;
            if self.samples.len() as u64 == self.ticdup {
                let collapsed = collapse_ticdup(&mut self.samples);
                self.samples.clear();
                let command = self.apply_input_delay(collapsed);
                let events = self.events.take();
                self.peers[usize::from(self.local)].push_local(command, events);
                self.report.generated += 1;
            }
        }
    }

    /// Pushes `command` through the delay FIFO and returns what leaves it.
    fn apply_input_delay(&mut self, command: InputCommand) -> InputCommand {
        self.delay_queue.push_back(command);
        let mut out = InputCommand::NEUTRAL;
        while self.delay_queue.len() > usize::from(self.input_delay) {
            match self.delay_queue.pop_front() {
                Some(next) => out = next,
                None => break,
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Simulation
    // ------------------------------------------------------------------

    fn run_simulation(&mut self, sim: &mut dyn Simulation, now_ms: u64) {
        let entered = self.clock.entered(now_ms);
        let allowed = u64::from(self.lowest_sequence()) * self.ticdup;
        let mut run = entered.min(allowed).saturating_sub(self.gametic);
        if self.loading || self.single_step {
            run = run.min(1);
        }

        let mut commands = [InputCommand::NEUTRAL; MAX_PLAYERS];
        let mut events: Vec<Vec<u8>> = vec![Vec::new(); MAX_PLAYERS];
        for _ in 0..run {
            let sequence = self.consumed_sequence() + 1;
            let first_of_sequence = self.gametic % self.ticdup == 0;
            commands.fill(InputCommand::NEUTRAL);
            events.iter_mut().for_each(Vec::clear);
            for slot in self.in_game.iter() {
                let index = usize::from(slot);
                if let Some(record) = self.peers[index].ring.get(sequence) {
                    commands[index] = record.command;
                    if first_of_sequence {
                        events[index].extend_from_slice(&record.events);
                    }
                }
            }
            sim.run_tick(&TickInputs::new(self.gametic, self.in_game, &commands, &events));
            self.gametic += 1;
            self.report.ticks_run += 1;
            if self.gametic % self.ticdup == 0 {
                self.record_checksum(sequence, sim.consistency_checksum());
            }
        }
        let gated = run == 0 && self.gametic < entered;
        self.clock.record_frame(self.report.ticks_run, gated);
    }

    fn record_checksum(&mut self, sequence: u32, ours: u16) {
        self.own_checksums.insert(sequence, ours);
        self.checksummed = sequence;
        for slot in self.in_game.iter().filter(|&s| s != self.local) {
            let peer = &mut self.peers[usize::from(slot)];
            if let Some(theirs) = peer.checksums.get(sequence) {
                if peer.compare(sequence, ours, theirs) {
                    warn!(slot, sequence, ours, theirs, "consistency failure");
                    self.report.desynced.insert(slot);
                }
            }
        }
    }

    fn detect_stall(&mut self, now_ms: u64) {
        let lowest = self.lowest_sequence();
        let gated = u64::from(lowest) * self.ticdup <= self.gametic
            && self.gametic < self.clock.entered(now_ms);
        if !gated || lowest != self.last_lowest {
            self.last_lowest = lowest;
            self.last_progress_ms = now_ms;
        } else if now_ms.saturating_sub(self.last_progress_ms) >= self.session.config.stall_timeout_ms {
            let mut laggards = PlayerSet::EMPTY;
            for slot in self.in_game.iter().filter(|&s| s != self.local) {
                let peer = &mut self.peers[usize::from(slot)];
                if peer.current_sequence == lowest {
                    peer.waiting = true;
                    laggards.insert(slot);
                }
            }
            // The cause may be a lost ack rather than a lost participant.
            for dest in self.destinations().iter() {
                let peer = &mut self.peers[usize::from(dest)];
                peer.missing = true;
                peer.rewind();
            }
            warn!(?laggards, lowest, "stalled waiting on participants");
            self.last_progress_ms = now_ms;
        }
        self.report.waiting_on = self
            .in_game
            .iter()
            .filter(|&s| self.peers[usize::from(s)].waiting)
            .collect();
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    fn send_ticks(&mut self, now_ms: u64) -> NetResult<()> {
        for dest in self.destinations().iter() {
            self.send_to(dest, now_ms)?;
        }
        Ok(())
    }

    /// True when packets to `dest` should ask for a resend.
    fn wants_retransmit(&self, dest: u8) -> bool {
        if self.is_spoke() {
            return self
                .in_game
                .iter()
                .any(|s| self.peers[usize::from(s)].missing);
        }
        self.peers[usize::from(dest)].missing
    }

    /// Consecutive records of `slot` after `from`, up to `count`, that can
    /// be delta-encoded.
    fn available(&self, slot: u8, from: u32, count: u32) -> u32 {
        let ring = &self.peers[usize::from(slot)].ring;
        if ring.basis(from).is_none() {
            return 0;
        }
        (1..=count)
            .take_while(|&i| ring.get(from + i).is_some())
            .count() as u32
    }

    fn block(&self, slot: u8, from: u32, count: u32, with_latency: bool) -> PlayerBlock {
        let peer = &self.peers[usize::from(slot)];
        let mut basis = peer.ring.basis(from).unwrap_or(InputCommand::NEUTRAL);
        let mut tics = Vec::with_capacity(count as usize);
        for offset in 0..count {
            let Some(record) = peer.ring.get(from + 1 + offset) else {
                break;
            };
            tics.push(TicEntry {
                offset: offset as u8,
                events: record.events.clone(),
                delta: CommandDelta::between(&basis, &record.command),
            });
            basis = record.command;
        }
        let latency_ms = if with_latency && slot != self.local {
            peer.latency.average_ms()
        } else {
            0
        };
        PlayerBlock {
            slot,
            latency_ms,
            consistency: Vec::new(),
            tics,
        }
    }

    /// Own checksums `dest` has not confirmed, with the sequence of the
    /// first. Unconfirmed values ride along until acked, so a lost batch is
    /// repeated by the next packet.
    fn pending_checksums(&self, dest: u8) -> (u32, Vec<u16>) {
        let window_start = self.checksummed.saturating_sub(RING_DEPTH as u32 - 1).max(1);
        let first = (self.peers[usize::from(dest)].cons_ack + 1).max(window_start);
        let values: Vec<u16> = (first..=self.checksummed)
            .map_while(|sequence| self.own_checksums.get(sequence))
            .collect();
        if values.is_empty() {
            (0, values)
        } else {
            (first, values)
        }
    }

    /// Sends `packet` to `addr`, spreading the player blocks over several
    /// datagrams when one cannot hold them all. A block that is too large
    /// even on its own goes without its checksums; those stay unconfirmed
    /// and ride the next packet.
    fn send_within_budget(
        channel: &mut Channel,
        addr: SocketAddr,
        mut packet: TickPacket,
    ) -> NetResult<()> {
        if Channel::measure(&mut packet)? <= MAX_PACKET_SIZE {
            channel.send(addr, &mut packet)?;
            return Ok(());
        }
        let blocks = std::mem::take(&mut packet.players);
        let mut group = packet;
        let mut datagrams = 0usize;
        for block in blocks {
            group.players.push(block);
            if Channel::measure(&mut group)? <= MAX_PACKET_SIZE {
                continue;
            }
            if group.players.len() > 1 {
                let overflow = group.players.pop();
                channel.send(addr, &mut group)?;
                datagrams += 1;
                group.players.clear();
                group.players.extend(overflow);
            }
            if Channel::measure(&mut group)? > MAX_PACKET_SIZE {
                for block in &mut group.players {
                    block.consistency.clear();
                }
            }
        }
        if !group.players.is_empty() {
            channel.send(addr, &mut group)?;
            datagrams += 1;
        }
        trace!(%addr, datagrams, "tick packet split");
        Ok(())
    }

    fn send_to(&mut self, dest: u8, now_ms: u64) -> NetResult<()> {
        let Some(addr) = self.session.roster.addr(dest) else {
            return Ok(());
        };
        let streams = self.streams_for(dest);
        let upto = streams
            .iter()
            .map(|s| self.peers[usize::from(s)].current_sequence)
            .min()
            .unwrap_or(0);

        let peer = &self.peers[usize::from(dest)];
        let mut from = peer.sent_up_to.max(peer.sequence_ack).min(upto);
        let fresh = upto > from;
        let heartbeat = !fresh && now_ms.saturating_sub(peer.last_send_ms) >= HEARTBEAT_MS;
        let retransmit = self.wants_retransmit(dest);
        let quitting = self.quitter_frames > 0;
        if heartbeat {
            from = upto.saturating_sub(1);
        }
        let new_checksums = self.checksummed > self.peers[usize::from(dest)].cons_sent;
        if !fresh && !heartbeat && !retransmit && !quitting && !new_checksums {
            return Ok(());
        }
        let (consistency_base, checksums) = self.pending_checksums(dest);

        let wanted = (upto - from).min(MAX_TICS_PER_PACKET as u32);
        let count = streams
            .iter()
            .map(|s| self.available(s, from, wanted))
            .min()
            .unwrap_or(0);

        let with_latency = self.is_hub();
        let mut flags = 0;
        if retransmit {
            flags |= FLAG_RETRANSMIT;
        }
        if quitting {
            flags |= FLAG_QUITTERS;
        }
        if with_latency {
            flags |= FLAG_LATENCY;
        }
        let last_checksum = consistency_base + checksums.len() as u32;
        let mut players: Vec<PlayerBlock> = streams
            .iter()
            .map(|s| self.block(s, from, count, with_latency))
            .collect();
        if let Some(own) = players.iter_mut().find(|b| b.slot == self.local) {
            own.consistency = checksums;
        }
        let mut packet = TickPacket {
            flags,
            base_sequence: from + 1,
            ack_sequence: self.ack_for(dest),
            consistency_base,
            consistency_ack: self.peers[usize::from(dest)].cons_recv,
            quitters: if quitting { self.quitters.clone() } else { Vec::new() },
            players,
        };

        let mut tic_count = packet.tic_count();
        while tic_count > 1 && Channel::measure(&mut packet)? > MAX_PACKET_SIZE {
            tic_count /= 2;
            for block in &mut packet.players {
                block.tics.truncate(tic_count);
            }
        }

        Self::send_within_budget(&mut self.session.channel, addr, packet)?;

        let sent_through = from + tic_count as u32;
        let peer = &mut self.peers[usize::from(dest)];
        peer.sent_up_to = peer.sent_up_to.max(sent_through);
        if consistency_base != 0 {
            peer.cons_sent = peer.cons_sent.max(last_checksum - 1);
        }
        peer.last_send_ms = now_ms;
        if retransmit {
            if self.is_spoke() {
                self.peers.iter_mut().for_each(|p| p.missing = false);
            } else {
                self.peers[usize::from(dest)].missing = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::integration::DeterministicSim;
    use crate::protocol::{Connect, GameParams};
    use crate::transport::MemoryNetwork;
    use std::collections::BTreeMap;

    fn engine_on(net: &MemoryNetwork, players: u8, arbitrator: u8) -> SyncEngine {
        let config = NetConfig {
            tick_rate: 1000,
            ..NetConfig::default()
        };
        let mut session = Session::memory(config, net).unwrap();
        for slot in 1..players {
            let addr = SocketAddr::from(([10, 0, 0, 9], 1000 + u16::from(slot)));
            session.roster.occupy(slot, Some(addr), ParticipantStatus::Ready);
        }
        let start = StartInfo {
            local: 0,
            arbitrator,
            players: PlayerSet::first_n(usize::from(players)),
            topology: Topology::PeerToPeer,
            ticdup: 1,
            params: GameParams::default(),
            setups: BTreeMap::new(),
        };
        SyncEngine::new(session, start, 0)
    }

    fn feed(engine: &mut SyncEngine, slot: u8, through: u32) {
        let peer = &mut engine.peers[usize::from(slot)];
        while peer.current_sequence < through {
            peer.push_local(InputCommand::NEUTRAL, Vec::new());
        }
    }

    #[test]
    fn test_lowest_sequence_gates_simulation() {
        let net = MemoryNetwork::perfect();
        let mut engine = engine_on(&net, 3, 0);
        let mut sim = DeterministicSim::new(0);
        feed(&mut engine, 1, 5);
        feed(&mut engine, 2, 7);

        // Real time allows nine ticks; the slowest stream allows five.
        let report = engine.frame(&mut sim, 8).unwrap();
        assert_eq!(engine.peer(0).unwrap().current_sequence(), 9);
        assert_eq!(engine.lowest_sequence(), 5);
        assert_eq!(report.ticks_run, 5);
        assert_eq!(sim.ticks_run(), 5);

        engine.frame(&mut sim, 8).unwrap();
        assert_eq!(engine.gametic(), 5);

        feed(&mut engine, 1, 6);
        engine.frame(&mut sim, 8).unwrap();
        assert_eq!(engine.gametic(), 6);
    }

    #[test]
    fn test_solo_runs_with_real_time() {
        let net = MemoryNetwork::perfect();
        let mut engine = engine_on(&net, 1, 0);
        let mut sim = DeterministicSim::new(0);
        let report = engine.frame(&mut sim, 9).unwrap();
        assert_eq!(report.ticks_run, 10);
        assert_eq!(report.generated, 10);

        // The backlog bounds how far one frame can catch up.
        let report = engine.frame(&mut sim, 1000).unwrap();
        assert_eq!(report.ticks_run, MAX_SEND_AHEAD);
        assert!(!engine.is_desynced());
    }

    #[test]
    fn test_single_step_runs_one_tick() {
        let net = MemoryNetwork::perfect();
        let mut engine = engine_on(&net, 1, 0);
        let mut sim = DeterministicSim::new(0);
        engine.set_single_step(true);
        assert_eq!(engine.frame(&mut sim, 20).unwrap().ticks_run, 1);
        engine.set_single_step(false);
        engine.set_loading(true);
        assert_eq!(engine.frame(&mut sim, 20).unwrap().ticks_run, 1);
        engine.set_loading(false);
        assert_eq!(engine.frame(&mut sim, 20).unwrap().ticks_run, 19);
    }

    #[test]
    fn test_input_delay_fifo() {
        let net = MemoryNetwork::perfect();
        let mut engine = engine_on(&net, 1, 0);
        let cmd = |b| InputCommand::new(b, [0; crate::protocol::AXIS_COUNT]);
        engine.input_delay = 2;
        assert_eq!(engine.apply_input_delay(cmd(1)), InputCommand::NEUTRAL);
        assert_eq!(engine.apply_input_delay(cmd(2)), InputCommand::NEUTRAL);
        assert_eq!(engine.apply_input_delay(cmd(3)), cmd(1));
        // Shrinking the delay drops the backlog.
        engine.input_delay = 0;
        assert_eq!(engine.apply_input_delay(cmd(4)), cmd(4));
    }

    #[test]
    fn test_drop_participant_migrates_arbitrator() {
        let net = MemoryNetwork::perfect();
        let mut engine = engine_on(&net, 3, 1);
        let mut sim = DeterministicSim::new(0);
        assert!(engine.drop_participant(1, 0));
        assert!(!engine.drop_participant(1, 0));
        let report = engine.frame(&mut sim, 0).unwrap();
        assert_eq!(report.departed, vec![1]);
        assert_eq!(report.new_arbitrator, Some(0));
        assert_eq!(engine.arbitrator(), 0);
        assert!(engine.peer(1).is_none());
        assert_eq!(engine.quitters, vec![1]);
    }

    #[test]
    fn test_unconfirmed_checksums_ride_again() {
        let net = MemoryNetwork::perfect();
        let mut engine = engine_on(&net, 2, 0);
        for sequence in 1..=4 {
            engine.record_checksum(sequence, 0x100 + sequence as u16);
        }
        // Batches through 4 went out; only 1 was confirmed.
        engine.peers[1].cons_sent = 4;
        engine.peers[1].cons_ack = 1;
        let (base, values) = engine.pending_checksums(1);
        assert_eq!(base, 2);
        assert_eq!(values, vec![0x102, 0x103, 0x104]);

        engine.peers[1].cons_ack = 4;
        assert_eq!(engine.pending_checksums(1), (0, Vec::new()));
    }

    #[test]
    fn test_oversized_tick_packet_is_split() {
        let net = MemoryNetwork::perfect();
        let mut engine = engine_on(&net, 1, 0);
        let mut receiver = Channel::new(
            Box::new(net.bind(0).unwrap()),
            Box::new(crate::transport::Lz4Compressor),
            usize::MAX,
        );
        let block = |slot: u8| PlayerBlock {
            slot,
            latency_ms: 0,
            consistency: vec![0xAB; 40],
            tics: vec![TicEntry {
                offset: 0,
                events: vec![slot; 700],
                delta: CommandDelta::default(),
            }],
        };
        let packet = TickPacket {
            base_sequence: 6,
            ack_sequence: 5,
            consistency_base: 3,
            players: vec![block(0), block(1)],
            ..TickPacket::default()
        };

        SyncEngine::send_within_budget(&mut engine.session.channel, receiver.local_addr(), packet)
            .unwrap();
        let mut slots = Vec::new();
        while let Some((_, packet)) = receiver.recv().unwrap() {
            let Packet::Tick(tick) = packet else {
                panic!("expected tick packet, got {packet:?}");
            };
            assert_eq!(tick.players.len(), 1);
            assert_eq!(tick.base_sequence, 6);
            assert_eq!(tick.players[0].tics[0].events.len(), 700);
            slots.push(tick.players[0].slot);
        }
        assert_eq!(slots, vec![0, 1]);
    }

    #[test]
    fn test_block_too_large_alone_drops_checksums() {
        let net = MemoryNetwork::perfect();
        let mut engine = engine_on(&net, 1, 0);
        let mut receiver = Channel::new(
            Box::new(net.bind(0).unwrap()),
            Box::new(crate::transport::Lz4Compressor),
            usize::MAX,
        );
        let busiest = InputCommand::new(0x1FFF_FFFF, [-1; crate::protocol::AXIS_COUNT]);
        let mut packet = TickPacket {
            flags: FLAG_LATENCY | FLAG_QUITTERS,
            base_sequence: 1,
            consistency_base: 1,
            quitters: (0..MAX_PLAYERS as u8).collect(),
            players: vec![PlayerBlock {
                slot: 0,
                latency_ms: 80,
                consistency: vec![0xCD; RING_DEPTH - 1],
                tics: vec![TicEntry {
                    offset: 0,
                    events: vec![7; crate::protocol::MAX_EVENT_BYTES],
                    delta: CommandDelta::between(&InputCommand::NEUTRAL, &busiest),
                }],
            }],
            ..TickPacket::default()
        };
        assert!(Channel::measure(&mut packet).unwrap() > MAX_PACKET_SIZE);

        SyncEngine::send_within_budget(&mut engine.session.channel, receiver.local_addr(), packet)
            .unwrap();
        match receiver.recv().unwrap() {
            Some((_, Packet::Tick(tick))) => {
                assert!(tick.players[0].consistency.is_empty());
                assert_eq!(tick.players[0].tics[0].events.len(), crate::protocol::MAX_EVENT_BYTES);
            }
            other => panic!("expected tick packet, got {other:?}"),
        }
    }

    #[test]
    fn test_connect_during_game_rejected() {
        let net = MemoryNetwork::perfect();
        let mut engine = engine_on(&net, 1, 0);
        let mut sim = DeterministicSim::new(0);
        let mut stranger = Channel::new(
            Box::new(net.bind(0).unwrap()),
            Box::new(crate::transport::NoCompression),
            usize::MAX,
        );
        stranger
            .send(engine.session().local_addr(), &mut Connect::default())
            .unwrap();
        engine.frame(&mut sim, 0).unwrap();
        match stranger.recv().unwrap() {
            Some((_, Packet::Reject(reject))) => {
                assert_eq!(reject.reason, Rejection::AlreadyInProgress as u8);
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }
}
