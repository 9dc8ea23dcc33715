//! # Roster
//!
//! Fixed table of participant slots shared by the handshake and the sync
//! engine.
//!
//! ## Design
//!
//! - Fixed-size slot table indexed by slot number
//! - Lowest free slot is granted first, so slot numbers stay dense
//! - Exactly one participant is the arbitrator at any time

use std::net::SocketAddr;

use tracing::info;

use crate::MAX_PLAYERS;

use super::PlayerSet;

/// Local slot of a guest that has not been admitted yet.
const UNASSIGNED: u8 = u8::MAX;

/// Where a participant is in the session lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ParticipantStatus {
    /// Slot is free.
    #[default]
    Absent = 0,
    /// Slot granted; waiting for the guest's identity info.
    Connecting = 1,
    /// Identity known; game info and other identities still in flight.
    Waiting = 2,
    /// Holds everything the lobby has to offer.
    Ready = 3,
    /// Playing.
    InGame = 4,
}

/// One occupied slot.
#[derive(Clone, Debug)]
pub struct Participant {
    /// Slot number.
    pub slot: u8,
    /// Remote address; `None` for the local node.
    pub addr: Option<SocketAddr>,
    /// Lifecycle state.
    pub status: ParticipantStatus,
    /// Identity string from the lobby.
    pub user_info: String,
    /// Setup string from the info exchange.
    pub setup_info: Option<String>,
    /// Last time anything arrived from this participant.
    pub last_recv_ms: u64,
}

impl Participant {
    fn new(slot: u8, addr: Option<SocketAddr>, status: ParticipantStatus) -> Self {
        Self {
            slot,
            addr,
            status,
            user_info: String::new(),
            setup_info: None,
            last_recv_ms: 0,
        }
    }
}

/// Slot table.
#[derive(Clone, Debug)]
pub struct Roster {
    slots: Vec<Option<Participant>>,
    local: u8,
    arbitrator: u8,
}

impl Roster {
    /// Creates a roster holding only the local node in `local`.
    #[must_use]
    pub fn new(local: u8) -> Self {
        let mut roster = Self {
            slots: vec![None; MAX_PLAYERS],
            local,
            arbitrator: 0,
        };
        roster.occupy(local, None, ParticipantStatus::Ready);
        roster
    }

    /// Creates a guest's roster: the host in slot 0, the local slot unknown.
    #[must_use]
    pub fn guest(host: SocketAddr) -> Self {
        let mut roster = Self {
            slots: vec![None; MAX_PLAYERS],
            local: UNASSIGNED,
            arbitrator: 0,
        };
        roster.occupy(0, Some(host), ParticipantStatus::Ready);
        roster
    }

    /// True once the local node holds a slot.
    #[must_use]
    pub fn has_local_slot(&self) -> bool {
        usize::from(self.local) < MAX_PLAYERS
    }

    /// Slot of the local node.
    #[inline]
    #[must_use]
    pub const fn local(&self) -> u8 {
        self.local
    }

    /// Moves the local node to `slot` (a guest learns its slot late).
    pub fn set_local(&mut self, slot: u8) {
        if slot == self.local {
            return;
        }
        let holds_self = self.get(self.local).is_some_and(|p| p.addr.is_none());
        let mut me = if holds_self {
            self.remove(self.local)
        } else {
            None
        };
        if let Some(me) = me.as_mut() {
            me.slot = slot;
        }
        if let Some(entry) = self.slots.get_mut(usize::from(slot)) {
            *entry = Some(me.unwrap_or_else(|| Participant::new(slot, None, ParticipantStatus::Ready)));
        }
        self.local = slot;
    }

    /// Current arbitrator.
    #[inline]
    #[must_use]
    pub const fn arbitrator(&self) -> u8 {
        self.arbitrator
    }

    /// True when the local node is the arbitrator.
    #[inline]
    #[must_use]
    pub const fn is_arbitrator(&self) -> bool {
        self.local == self.arbitrator
    }

    /// Sets the arbitrator.
    pub fn set_arbitrator(&mut self, slot: u8) {
        self.arbitrator = slot;
    }

    /// Picks a new arbitrator after `departed` left.
    ///
    /// The nominee wins when it is still present; otherwise the lowest
    /// occupied slot does. Returns the new arbitrator when it changed.
    pub fn migrate_arbitrator(&mut self, departed: u8, nominee: Option<u8>) -> Option<u8> {
        if departed != self.arbitrator {
            return None;
        }
        let occupied = self.occupied();
        let successor = nominee
            .filter(|&n| occupied.contains(n))
            .or_else(|| occupied.first())?;
        info!(from = departed, to = successor, "arbitrator migrated");
        self.arbitrator = successor;
        Some(successor)
    }

    /// Occupies `slot`, replacing whatever was there.
    pub fn occupy(&mut self, slot: u8, addr: Option<SocketAddr>, status: ParticipantStatus) {
        if let Some(entry) = self.slots.get_mut(usize::from(slot)) {
            *entry = Some(Participant::new(slot, addr, status));
        }
    }

    /// Occupies the lowest free slot; `None` when the table is full.
    pub fn grant_lowest_free(&mut self, addr: SocketAddr, now_ms: u64) -> Option<u8> {
        let index = self.slots.iter().position(Option::is_none)?;
        let slot = u8::try_from(index).ok()?;
        let mut participant = Participant::new(slot, Some(addr), ParticipantStatus::Connecting);
        participant.last_recv_ms = now_ms;
        self.slots[index] = Some(participant);
        Some(slot)
    }

    /// Frees `slot`.
    pub fn remove(&mut self, slot: u8) -> Option<Participant> {
        self.slots.get_mut(usize::from(slot)).and_then(Option::take)
    }

    /// Keeps only the slots in `players`.
    pub fn retain(&mut self, players: PlayerSet) {
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if !players.contains(index as u8) {
                *entry = None;
            }
        }
    }

    /// Participant in `slot`.
    #[must_use]
    pub fn get(&self, slot: u8) -> Option<&Participant> {
        self.slots.get(usize::from(slot)).and_then(Option::as_ref)
    }

    /// Mutable participant in `slot`.
    pub fn get_mut(&mut self, slot: u8) -> Option<&mut Participant> {
        self.slots.get_mut(usize::from(slot)).and_then(Option::as_mut)
    }

    /// Address of `slot`, when remote.
    #[must_use]
    pub fn addr(&self, slot: u8) -> Option<SocketAddr> {
        self.get(slot).and_then(|p| p.addr)
    }

    /// Slot whose address is `addr`.
    #[must_use]
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<u8> {
        self.participants()
            .find(|p| p.addr == Some(addr))
            .map(|p| p.slot)
    }

    /// Every occupied slot.
    #[must_use]
    pub fn occupied(&self) -> PlayerSet {
        self.participants().map(|p| p.slot).collect()
    }

    /// Occupied slots other than the local one.
    #[must_use]
    pub fn remote(&self) -> PlayerSet {
        let mut set = self.occupied();
        set.remove(self.local);
        set
    }

    /// Iterates over occupied slots.
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.slots.iter().flatten()
    }

    /// Sets the status of every occupied slot.
    pub fn set_all_status(&mut self, status: ParticipantStatus) {
        for participant in self.slots.iter_mut().flatten() {
            participant.status = status;
        }
    }
}
