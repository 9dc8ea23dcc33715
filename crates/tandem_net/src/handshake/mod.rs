//! # Handshake
//!
//! Takes a freshly opened [`Session`] to the point where every participant
//! agrees on who plays, how packets flow, and with which parameters.
//!
//! ## Phases
//!
//! ```text
//! host:   HostLobby ──Go──► GossipArbitrator ──SetupReady──► Started
//! guest:  GuestLobby ──Go──► GossipGuest ──SetupReady──► Started
//! ```
//!
//! The handshake is poll driven: [`Handshake::poll`] never blocks, and
//! [`Handshake::run`] is a convenience loop around it.

mod gossip;
mod lobby;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Role;
use crate::error::{NetError, NetResult};
use crate::integration::{Clock, ProgressReporter};
use crate::protocol::{GameParams, Packet, Topology, NO_SUCCESSOR};
use crate::session::{PlayerSet, Session};
use crate::EXIT_REPEAT;

use gossip::{GossipArbitrator, GossipGuest};
use lobby::{GuestLobby, HostLobby, LobbyResult};

/// Everything the sync engine needs to start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartInfo {
    /// Our slot.
    pub local: u8,
    /// Slot of the arbitrator.
    pub arbitrator: u8,
    /// Participants of the game.
    pub players: PlayerSet,
    /// Packet flow.
    pub topology: Topology,
    /// Simulation ticks per network tick.
    pub ticdup: u8,
    /// Parameters chosen by the arbitrator.
    pub params: GameParams,
    /// Setup string of every participant.
    pub setups: BTreeMap<u8, String>,
}

/// Result of one [`Handshake::poll`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakePoll {
    /// Still negotiating.
    Pending,
    /// Negotiation finished.
    Started(StartInfo),
    /// The user aborted.
    Cancelled,
}

/// Result of [`Handshake::run`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Negotiation finished.
    Started(StartInfo),
    /// The user aborted; the others were told.
    Cancelled,
}

enum Phase {
    HostLobby(HostLobby),
    GuestLobby(GuestLobby),
    Arbitrator(GossipArbitrator),
    Guest(GossipGuest),
    Finished,
}

enum Step {
    Continue,
    LobbyDone(LobbyResult),
    Started(StartInfo),
}

/// Lobby and setup negotiation state machine.
pub struct Handshake {
    phase: Phase,
}

impl Handshake {
    /// Starts negotiating on `session`.
    ///
    /// A host expecting no guests skips the lobby.
    pub fn new(session: &mut Session, now_ms: u64) -> Self {
        if session.roster.has_local_slot() {
            let local = session.roster.local();
            let user_info = session.config.user_info.clone();
            if let Some(me) = session.roster.get_mut(local) {
                me.user_info = user_info;
            }
        }

        let phase = match session.role() {
            Role::Host { players: 1 } => {
                let solo = LobbyResult {
                    players: PlayerSet::single(session.roster.local()),
                    topology: session.config.topology.resolve(1),
                    ticdup: session.config.ticdup,
                };
                Phase::Arbitrator(GossipArbitrator::new(session, solo, now_ms))
            }
            Role::Host { players } => Phase::HostLobby(HostLobby::new(session, players)),
            Role::Join { addr } => Phase::GuestLobby(GuestLobby::new(addr)),
        };
        Self { phase }
    }

    /// True once the handshake has produced its outcome.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Finished)
    }

    /// Drains pending packets and sends whatever the current phase owes.
    ///
    /// Packets that arrive after the outcome stay queued on the channel for
    /// the sync engine. Polling a finished handshake returns `Pending`.
    pub fn poll(
        &mut self,
        session: &mut Session,
        ui: &mut dyn ProgressReporter,
        now_ms: u64,
    ) -> NetResult<HandshakePoll> {
        if self.is_finished() {
            return Ok(HandshakePoll::Pending);
        }
        if ui.abort_requested() {
            info!("handshake aborted");
            self.phase = Phase::Finished;
            return Ok(HandshakePoll::Cancelled);
        }

        loop {
            let (from, packet) = match session.channel.recv() {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(NetError::Protocol(error)) => {
                    warn!(%error, "undecodable datagram dropped");
                    continue;
                }
                Err(error) => return Err(error),
            };
            let step = self.dispatch(session, from, packet, now_ms)?;
            if let Some(info) = self.advance(session, step, now_ms) {
                return Ok(HandshakePoll::Started(info));
            }
        }

        let step = self.update(session, ui)?;
        Ok(match self.advance(session, step, now_ms) {
            Some(info) => HandshakePoll::Started(info),
            None => HandshakePoll::Pending,
        })
    }

    fn dispatch(
        &mut self,
        session: &mut Session,
        from: SocketAddr,
        packet: Packet,
        now_ms: u64,
    ) -> NetResult<Step> {
        Ok(match &mut self.phase {
            Phase::HostLobby(lobby) => {
                lobby.handle(session, from, packet, now_ms)?;
                Step::Continue
            }
            Phase::GuestLobby(lobby) => match lobby.handle(session, from, packet)? {
                Some(result) => Step::LobbyDone(result),
                None => Step::Continue,
            },
            Phase::Arbitrator(gossip) => {
                gossip.handle(session, from, packet)?;
                Step::Continue
            }
            Phase::Guest(gossip) => match gossip.handle(session, from, packet)? {
                Some(info) => Step::Started(info),
                None => Step::Continue,
            },
            Phase::Finished => Step::Continue,
        })
    }

    fn update(&mut self, session: &mut Session, ui: &mut dyn ProgressReporter) -> NetResult<Step> {
        Ok(match &mut self.phase {
            Phase::HostLobby(lobby) => match lobby.update(session, ui)? {
                Some(result) => Step::LobbyDone(result),
                None => Step::Continue,
            },
            Phase::GuestLobby(lobby) => {
                lobby.update(session, ui)?;
                Step::Continue
            }
            Phase::Arbitrator(gossip) => match gossip.update(session, ui)? {
                Some(info) => Step::Started(info),
                None => Step::Continue,
            },
            Phase::Guest(gossip) => {
                gossip.update(session, ui)?;
                Step::Continue
            }
            Phase::Finished => Step::Continue,
        })
    }

    fn advance(&mut self, session: &mut Session, step: Step, now_ms: u64) -> Option<StartInfo> {
        match step {
            Step::Continue => None,
            Step::LobbyDone(result) => {
                self.phase = if session.roster.is_arbitrator() {
                    Phase::Arbitrator(GossipArbitrator::new(session, result, now_ms))
                } else {
                    let arbitrator = session.roster.arbitrator();
                    match session.roster.addr(arbitrator) {
                        Some(addr) => Phase::Guest(GossipGuest::new(session, addr, result)),
                        None => {
                            warn!(arbitrator, "arbitrator has no address");
                            return None;
                        }
                    }
                };
                None
            }
            Step::Started(info) => {
                info!(
                    local = info.local,
                    players = info.players.len(),
                    topology = ?info.topology,
                    "handshake complete"
                );
                self.phase = Phase::Finished;
                Some(info)
            }
        }
    }

    /// Polls until the handshake finishes, sleeping between polls.
    ///
    /// On abort, the exit is announced [`EXIT_REPEAT`] times.
    pub fn run(
        mut self,
        session: &mut Session,
        ui: &mut dyn ProgressReporter,
        clock: &dyn Clock,
    ) -> NetResult<HandshakeOutcome> {
        let interval = Duration::from_millis(session.config.poll_interval_ms);
        loop {
            match self.poll(session, ui, clock.now_millis())? {
                HandshakePoll::Pending => thread::sleep(interval),
                HandshakePoll::Started(info) => return Ok(HandshakeOutcome::Started(info)),
                HandshakePoll::Cancelled => {
                    for _ in 0..EXIT_REPEAT {
                        session.announce_exit(NO_SUCCESSOR, 1)?;
                        thread::sleep(interval / 4);
                    }
                    return Ok(HandshakeOutcome::Cancelled);
                }
            }
        }
    }
}
