//! # Lobby Formation
//!
//! Phase A of the handshake: guests get slots, everyone learns everyone's
//! identity info, and the host closes the lobby with `Go`.
//!
//! ## Guest States (host view)
//!
//! ```text
//! Absent ──Connect──► Connecting ──UserInfo──► Waiting ──all acked──► Ready
//!                        │                        ▲                    │
//!                   ConnectAck             GameInfo, UserInfo     Heartbeat
//! ```
//!
//! Every message is resent each poll until acknowledged, so loss only
//! slows the lobby down.

use std::net::SocketAddr;

use tracing::{debug, info, trace, warn};

use crate::codec::CodecError;
use crate::config::TopologyMode;
use crate::error::{NetError, NetResult, Rejection};
use crate::integration::ProgressReporter;
use crate::protocol::{
    Connect, ConnectAck, GameInfo, GameInfoAck, Go, Heartbeat, Packet, Reject, Topology,
    UserInfo, UserInfoAck,
};
use crate::session::{ParticipantStatus, PlayerSet, Session};
use crate::{GO_REPEAT, MAX_PLAYERS};

/// How a finished lobby ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LobbyResult {
    /// Participants of the game.
    pub players: PlayerSet,
    /// Negotiated topology.
    pub topology: Topology,
    /// Simulation ticks per network tick.
    pub ticdup: u8,
}

// ============================================================================
// HOST
// ============================================================================

/// Host side of the lobby.
pub(crate) struct HostLobby {
    capacity: u8,
    mode: TopologyMode,
    ticdup: u8,
    /// Identity infos each guest has confirmed.
    acked: [PlayerSet; MAX_PLAYERS],
    /// Guests that confirmed the game info.
    game_info_acked: PlayerSet,
}

impl HostLobby {
    pub(crate) fn new(session: &Session, capacity: u8) -> Self {
        info!(capacity, "lobby open");
        Self {
            capacity,
            mode: session.config.topology,
            ticdup: session.config.ticdup,
            acked: [PlayerSet::EMPTY; MAX_PLAYERS],
            game_info_acked: PlayerSet::EMPTY,
        }
    }

    /// First check a connect request fails, in the order they are applied.
    fn screen(&self, session: &Session, connect: &Connect) -> Option<Rejection> {
        if connect.version != session.version {
            return Some(Rejection::WrongVersion);
        }
        if connect.password != session.config.password {
            return Some(Rejection::WrongPassword);
        }
        if session.roster.occupied().len() >= usize::from(self.capacity) {
            return Some(Rejection::LobbyFull);
        }
        if connect.content_hash != session.config.content_hash {
            return Some(Rejection::InvalidFiles);
        }
        None
    }

    pub(crate) fn handle(
        &mut self,
        session: &mut Session,
        from: SocketAddr,
        packet: Packet,
        now_ms: u64,
    ) -> NetResult<()> {
        let sender = session.roster.find_by_addr(from);
        if let Some(slot) = sender {
            if let Some(participant) = session.roster.get_mut(slot) {
                participant.last_recv_ms = now_ms;
            }
        }

        match (packet, sender) {
            (Packet::Connect(connect), None) => {
                if let Some(reason) = self.screen(session, &connect) {
                    warn!(%from, %reason, "connect rejected");
                    session.channel.send(from, &mut Reject { reason: reason as u8 })?;
                    return Ok(());
                }
                if let Some(slot) = session.roster.grant_lowest_free(from, now_ms) {
                    self.acked[usize::from(slot)] = PlayerSet::EMPTY;
                    self.game_info_acked.remove(slot);
                    info!(slot, %from, "slot granted");
                }
            }
            (Packet::Connect(_), Some(slot)) => trace!(slot, "repeated connect"),
            (Packet::Exit(_), Some(slot)) => {
                session.roster.remove(slot);
                self.acked[usize::from(slot)] = PlayerSet::EMPTY;
                self.game_info_acked.remove(slot);
                info!(slot, "guest left the lobby");
            }
            (Packet::UserInfo(user), Some(slot)) => {
                if let Some(participant) = session.roster.get_mut(slot) {
                    participant.user_info = user.info;
                    if participant.status == ParticipantStatus::Connecting {
                        participant.status = ParticipantStatus::Waiting;
                        debug!(slot, "guest identified");
                    }
                }
            }
            (Packet::UserInfoAck(ack), Some(slot)) => {
                self.acked[usize::from(slot)] = ack.known;
            }
            (Packet::GameInfoAck(_), Some(slot)) => {
                self.game_info_acked.insert(slot);
            }
            (other, _) => trace!(tag = other.tag(), %from, "ignored in lobby"),
        }
        Ok(())
    }

    /// Sends what each guest is missing; returns the lobby result once
    /// every guest is ready and the lobby is full or forced to start.
    pub(crate) fn update(
        &mut self,
        session: &mut Session,
        ui: &mut dyn ProgressReporter,
    ) -> NetResult<Option<LobbyResult>> {
        let occupied = session.roster.occupied();
        let guests = session.roster.remote();
        let tentative = self.mode.resolve(usize::from(self.capacity));
        let mut ready = 0;

        for guest in guests.iter() {
            let Some(participant) = session.roster.get(guest) else {
                continue;
            };
            if participant.status == ParticipantStatus::Connecting {
                let mut ack = ConnectAck {
                    slot: guest,
                    capacity: self.capacity,
                };
                session.send_to_slot(guest, &mut ack)?;
                continue;
            }

            let mut others = occupied;
            others.remove(guest);
            let has_game_info = self.game_info_acked.contains(guest);
            let knows_everyone = self.acked[usize::from(guest)].is_superset(&others);
            let status = if has_game_info && knows_everyone {
                ready += 1;
                ParticipantStatus::Ready
            } else {
                ParticipantStatus::Waiting
            };
            if let Some(participant) = session.roster.get_mut(guest) {
                participant.status = status;
            }

            if status == ParticipantStatus::Ready {
                let mut heartbeat = Heartbeat {
                    connected: occupied.len() as u8,
                    capacity: self.capacity,
                };
                session.send_to_slot(guest, &mut heartbeat)?;
                continue;
            }
            if !has_game_info {
                let mut game_info = GameInfo {
                    ticdup: self.ticdup,
                    topology: tentative as u8,
                };
                session.send_to_slot(guest, &mut game_info)?;
            }
            for other in others.difference(self.acked[usize::from(guest)]).iter() {
                let Some(known) = session.roster.get(other) else {
                    continue;
                };
                let mut user = UserInfo {
                    slot: other,
                    addr: known.addr.map(|a| a.to_string()).unwrap_or_default(),
                    info: known.user_info.clone(),
                };
                session.send_to_slot(guest, &mut user)?;
            }
        }

        ui.present_progress("waiting for players", ready + 1, usize::from(self.capacity));

        let full = occupied.len() >= usize::from(self.capacity);
        let all_ready = ready == guests.len();
        if !all_ready || !(full || ui.should_force_start()) {
            return Ok(None);
        }

        let topology = self.mode.resolve(occupied.len());
        info!(players = occupied.len(), ?topology, "lobby closed");
        for _ in 0..GO_REPEAT {
            for guest in guests.iter() {
                let mut go = Go {
                    topology: topology as u8,
                    players: occupied,
                };
                session.send_to_slot(guest, &mut go)?;
            }
        }
        Ok(Some(LobbyResult {
            players: occupied,
            topology,
            ticdup: self.ticdup,
        }))
    }
}

// ============================================================================
// GUEST
// ============================================================================

/// Guest side of the lobby.
pub(crate) struct GuestLobby {
    host: SocketAddr,
    capacity: u8,
    game_info: Option<GameInfo>,
}

impl GuestLobby {
    pub(crate) fn new(host: SocketAddr) -> Self {
        info!(%host, "joining");
        Self {
            host,
            capacity: 0,
            game_info: None,
        }
    }

    pub(crate) fn handle(
        &mut self,
        session: &mut Session,
        from: SocketAddr,
        packet: Packet,
    ) -> NetResult<Option<LobbyResult>> {
        if from != self.host {
            trace!(%from, "ignored packet from a stranger");
            return Ok(None);
        }

        match packet {
            Packet::Reject(reject) => {
                let reason = Rejection::from_u8(reject.reason).ok_or(CodecError::InvalidValue {
                    what: "rejection reason",
                    value: u64::from(reject.reason),
                })?;
                warn!(%reason, "host refused us");
                return Err(NetError::Rejected(reason));
            }
            Packet::Exit(_) => return Err(NetError::HostDisconnected),
            Packet::ConnectAck(ack) => {
                self.capacity = ack.capacity;
                if !session.roster.has_local_slot() {
                    session.roster.set_local(ack.slot);
                    let user_info = session.config.user_info.clone();
                    if let Some(me) = session.roster.get_mut(ack.slot) {
                        me.user_info = user_info;
                    }
                    info!(slot = ack.slot, capacity = ack.capacity, "slot assigned");
                }
            }
            Packet::UserInfo(user) => self.learn(session, user),
            Packet::GameInfo(game_info) => {
                session.channel.send(self.host, &mut GameInfoAck)?;
                self.game_info = Some(game_info);
            }
            Packet::Heartbeat(heartbeat) => {
                self.capacity = heartbeat.capacity;
                trace!(connected = heartbeat.connected, "lobby heartbeat");
            }
            Packet::Go(go) => {
                if !session.roster.has_local_slot() {
                    return Ok(None);
                }
                let topology = Topology::from_u8(go.topology).ok_or(CodecError::InvalidValue {
                    what: "topology",
                    value: u64::from(go.topology),
                })?;
                session.roster.retain(go.players);
                let ticdup = self
                    .game_info
                    .as_ref()
                    .map_or(session.config.ticdup, |g| g.ticdup);
                info!(players = go.players.len(), ?topology, "lobby closed by host");
                return Ok(Some(LobbyResult {
                    players: go.players,
                    topology,
                    ticdup,
                }));
            }
            other => trace!(tag = other.tag(), "ignored in lobby"),
        }
        Ok(None)
    }

    fn learn(&mut self, session: &mut Session, user: UserInfo) {
        if session.roster.has_local_slot() && user.slot == session.roster.local() {
            return;
        }
        let addr = if user.addr.is_empty() {
            self.host
        } else {
            match user.addr.parse::<SocketAddr>() {
                Ok(addr) => addr,
                Err(_) => {
                    warn!(slot = user.slot, addr = %user.addr, "unparseable participant address");
                    return;
                }
            }
        };
        let known = session.roster.get(user.slot).is_some_and(|p| p.addr == Some(addr));
        if !known {
            session
                .roster
                .occupy(user.slot, Some(addr), ParticipantStatus::Waiting);
            debug!(slot = user.slot, %addr, "learned participant");
        }
        if let Some(participant) = session.roster.get_mut(user.slot) {
            participant.user_info = user.info;
        }
    }

    pub(crate) fn update(
        &mut self,
        session: &mut Session,
        ui: &mut dyn ProgressReporter,
    ) -> NetResult<()> {
        if !session.roster.has_local_slot() {
            let mut connect = Connect {
                version: session.version,
                password: session.config.password.clone(),
                content_hash: session.config.content_hash,
            };
            session.channel.send(self.host, &mut connect)?;
            ui.present_progress("connecting", 0, 1);
            return Ok(());
        }

        if self.game_info.is_none() {
            let local = session.roster.local();
            let mut user = UserInfo {
                slot: local,
                addr: String::new(),
                info: session.config.user_info.clone(),
            };
            session.channel.send(self.host, &mut user)?;
        }
        let known = session.roster.occupied();
        session.channel.send(self.host, &mut UserInfoAck { known })?;
        ui.present_progress(
            "waiting for players",
            known.len(),
            usize::from(self.capacity.max(1)),
        );
        Ok(())
    }
}
