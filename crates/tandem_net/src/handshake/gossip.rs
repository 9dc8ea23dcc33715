//! # Setup Exchange
//!
//! Phase B of the handshake. Every participant's setup string reaches every
//! other participant through the arbitrator, which also hands out the
//! authoritative game parameters.
//!
//! ```text
//! guest ──Setup──► arbitrator ──SetupAck──► guest
//! guest ──KnownPlayers──► arbitrator ──Setup (missing ones)──► guest
//! arbitrator ──GameParams──► guest ──GameParamsAck──► arbitrator
//! arbitrator ──SetupReady──► everyone, once all of the above converged
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;

use tracing::{debug, info, trace};

use crate::error::{NetError, NetResult, Rejection};
use crate::integration::ProgressReporter;
use crate::protocol::{
    GameParams, GameParamsAck, Go, KnownPlayers, Packet, Reject, Setup, SetupAck, SetupReady,
    Topology,
};
use crate::session::{ParticipantStatus, PlayerSet, Session};
use crate::{GO_REPEAT, MAX_PLAYERS};

use super::lobby::LobbyResult;
use super::StartInfo;

/// Seed for the shared random stream, mixed from the wall clock.
fn seed_from(now_ms: u64) -> u32 {
    let mixed = now_ms.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (mixed >> 32) as u32 ^ mixed as u32
}

// ============================================================================
// ARBITRATOR
// ============================================================================

/// Arbitrator side of the exchange.
pub(crate) struct GossipArbitrator {
    players: PlayerSet,
    topology: Topology,
    ticdup: u8,
    params: GameParams,
    setups: BTreeMap<u8, String>,
    known_by: [PlayerSet; MAX_PLAYERS],
    params_acked: PlayerSet,
}

impl GossipArbitrator {
    pub(crate) fn new(session: &mut Session, lobby: LobbyResult, now_ms: u64) -> Self {
        let local = session.roster.local();
        session.roster.retain(lobby.players);
        session.roster.set_all_status(ParticipantStatus::Waiting);

        let mut setups = BTreeMap::new();
        setups.insert(local, session.config.setup_info.clone());
        let params = GameParams {
            map: session.config.map.clone(),
            rng_seed: seed_from(now_ms),
            settings: session.config.settings.clone().into_bytes(),
        };
        info!(players = lobby.players.len(), map = %params.map, "exchanging setups");
        Self {
            players: lobby.players,
            topology: lobby.topology,
            ticdup: lobby.ticdup,
            params,
            setups,
            known_by: [PlayerSet::EMPTY; MAX_PLAYERS],
            params_acked: PlayerSet::EMPTY,
        }
    }

    fn guests(&self, session: &Session) -> PlayerSet {
        let mut guests = self.players;
        guests.remove(session.roster.local());
        guests
    }

    pub(crate) fn handle(
        &mut self,
        session: &mut Session,
        from: SocketAddr,
        packet: Packet,
    ) -> NetResult<()> {
        let Some(sender) = session.roster.find_by_addr(from) else {
            if let Packet::Connect(_) = packet {
                let mut reject = Reject {
                    reason: Rejection::AlreadyInProgress as u8,
                };
                session.channel.send(from, &mut reject)?;
            }
            return Ok(());
        };

        match packet {
            Packet::Setup(setup) if setup.slot == sender => {
                if self.setups.insert(sender, setup.info).is_none() {
                    debug!(slot = sender, "setup received");
                }
                session.channel.send(from, &mut SetupAck { slot: sender })?;
            }
            Packet::KnownPlayers(known) => {
                self.known_by[usize::from(sender)] = known.known;
            }
            Packet::GameParamsAck(_) => self.params_acked.insert(sender),
            Packet::Exit(_) => {
                info!(slot = sender, "player left during setup");
                self.players.remove(sender);
                self.setups.remove(&sender);
                session.roster.remove(sender);
            }
            Packet::Connect(_)
            | Packet::UserInfo(_)
            | Packet::UserInfoAck(_)
            | Packet::GameInfoAck(_) => {
                // The guest missed every Go.
                let mut go = Go {
                    topology: self.topology as u8,
                    players: self.players,
                };
                session.channel.send(from, &mut go)?;
            }
            other => trace!(tag = other.tag(), sender, "ignored during setup"),
        }
        Ok(())
    }

    pub(crate) fn update(
        &mut self,
        session: &mut Session,
        ui: &mut dyn ProgressReporter,
    ) -> NetResult<Option<StartInfo>> {
        let guests = self.guests(session);
        let mut converged = 0;

        for guest in guests.iter() {
            let known = self.known_by[usize::from(guest)];
            for (&slot, info) in &self.setups {
                if slot == guest || known.contains(slot) {
                    continue;
                }
                let mut setup = Setup {
                    slot,
                    info: info.clone(),
                };
                session.send_to_slot(guest, &mut setup)?;
            }
            if !self.params_acked.contains(guest) {
                let mut params = self.params.clone();
                session.send_to_slot(guest, &mut params)?;
            }
            if known.is_superset(&self.players) && self.params_acked.contains(guest) {
                converged += 1;
            }
        }

        ui.present_progress("exchanging setups", converged, guests.len());
        let all_setups = self.players.iter().all(|slot| self.setups.contains_key(&slot));
        if !all_setups || converged < guests.len() {
            return Ok(None);
        }

        for _ in 0..GO_REPEAT {
            for guest in guests.iter() {
                session.send_to_slot(guest, &mut SetupReady)?;
            }
        }
        info!(players = self.players.len(), "setups converged");
        Ok(Some(StartInfo {
            local: session.roster.local(),
            arbitrator: session.roster.local(),
            players: self.players,
            topology: self.topology,
            ticdup: self.ticdup,
            params: self.params.clone(),
            setups: self.setups.clone(),
        }))
    }
}

// ============================================================================
// GUEST
// ============================================================================

/// Guest side of the exchange.
pub(crate) struct GossipGuest {
    arbitrator: SocketAddr,
    players: PlayerSet,
    topology: Topology,
    ticdup: u8,
    setups: BTreeMap<u8, String>,
    setup_acked: bool,
    params: Option<GameParams>,
}

impl GossipGuest {
    pub(crate) fn new(session: &Session, arbitrator: SocketAddr, lobby: LobbyResult) -> Self {
        let mut setups = BTreeMap::new();
        setups.insert(session.roster.local(), session.config.setup_info.clone());
        debug!(%arbitrator, "waiting for setups");
        Self {
            arbitrator,
            players: lobby.players,
            topology: lobby.topology,
            ticdup: lobby.ticdup,
            setups,
            setup_acked: false,
            params: None,
        }
    }

    pub(crate) fn handle(
        &mut self,
        session: &mut Session,
        from: SocketAddr,
        packet: Packet,
    ) -> NetResult<Option<StartInfo>> {
        if from != self.arbitrator {
            trace!(%from, "ignored packet from a non-arbitrator");
            return Ok(None);
        }

        match packet {
            Packet::SetupAck(ack) if ack.slot == session.roster.local() => {
                self.setup_acked = true;
            }
            Packet::Setup(setup) if self.players.contains(setup.slot) => {
                self.setups.insert(setup.slot, setup.info);
            }
            Packet::GameParams(params) => {
                session.channel.send(from, &mut GameParamsAck)?;
                self.params = Some(params);
            }
            Packet::SetupReady(_) => {
                let Some(params) = self.params.clone() else {
                    return Ok(None);
                };
                info!(map = %params.map, "setup complete");
                return Ok(Some(StartInfo {
                    local: session.roster.local(),
                    arbitrator: session.roster.arbitrator(),
                    players: self.players,
                    topology: self.topology,
                    ticdup: self.ticdup,
                    params,
                    setups: self.setups.clone(),
                }));
            }
            Packet::Exit(_) => return Err(NetError::HostDisconnected),
            other => trace!(tag = other.tag(), "ignored during setup"),
        }
        Ok(None)
    }

    pub(crate) fn update(
        &mut self,
        session: &mut Session,
        ui: &mut dyn ProgressReporter,
    ) -> NetResult<()> {
        let local = session.roster.local();
        if !self.setup_acked {
            let mut setup = Setup {
                slot: local,
                info: session.config.setup_info.clone(),
            };
            session.channel.send(self.arbitrator, &mut setup)?;
        }
        let known: PlayerSet = self.setups.keys().copied().collect();
        session
            .channel
            .send(self.arbitrator, &mut KnownPlayers { known })?;
        ui.present_progress("exchanging setups", known.len(), self.players.len());
        Ok(())
    }
}
