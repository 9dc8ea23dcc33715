//! # Player Sets
//!
//! Bitmask over participant slots, stored as 64-bit words so the roster can
//! grow past 64 slots without changing the wire shape of acknowledgments.

use crate::codec::{CodecResult, Serializer};
use crate::MAX_PLAYERS;

/// Number of 64-bit words needed to cover every slot.
pub const MASK_WORDS: usize = MAX_PLAYERS.div_ceil(64);

/// Set of participant slots.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PlayerSet {
    words: [u64; MASK_WORDS],
}

impl PlayerSet {
    /// The empty set.
    pub const EMPTY: Self = Self {
        words: [0; MASK_WORDS],
    };

    /// Set containing slots `0..count`.
    #[must_use]
    pub fn first_n(count: usize) -> Self {
        let mut set = Self::EMPTY;
        for slot in 0..count.min(MAX_PLAYERS) {
            set.insert(slot as u8);
        }
        set
    }

    /// Set containing exactly `slot`.
    #[must_use]
    pub fn single(slot: u8) -> Self {
        let mut set = Self::EMPTY;
        set.insert(slot);
        set
    }

    #[inline]
    fn locate(slot: u8) -> Option<(usize, u64)> {
        let slot = usize::from(slot);
        (slot < MAX_PLAYERS).then(|| (slot / 64, 1u64 << (slot % 64)))
    }

    /// Adds a slot. Out-of-range slots are ignored.
    #[inline]
    pub fn insert(&mut self, slot: u8) {
        if let Some((word, bit)) = Self::locate(slot) {
            self.words[word] |= bit;
        }
    }

    /// Removes a slot.
    #[inline]
    pub fn remove(&mut self, slot: u8) {
        if let Some((word, bit)) = Self::locate(slot) {
            self.words[word] &= !bit;
        }
    }

    /// True when `slot` is in the set.
    #[inline]
    #[must_use]
    pub fn contains(&self, slot: u8) -> bool {
        Self::locate(slot).is_some_and(|(word, bit)| self.words[word] & bit != 0)
    }

    /// Number of slots in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True when no slot is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Union of two sets.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        let mut out = self;
        for (a, b) in out.words.iter_mut().zip(other.words) {
            *a |= b;
        }
        out
    }

    /// Slots in `self` but not in `other`.
    #[must_use]
    pub fn difference(self, other: Self) -> Self {
        let mut out = self;
        for (a, b) in out.words.iter_mut().zip(other.words) {
            *a &= !b;
        }
        out
    }

    /// True when every slot of `other` is also in `self`.
    #[must_use]
    pub fn is_superset(&self, other: &Self) -> bool {
        other.difference(*self).is_empty()
    }

    /// Lowest slot in the set.
    #[must_use]
    pub fn first(&self) -> Option<u8> {
        self.iter().next()
    }

    /// Iterates slots in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..MAX_PLAYERS as u8).filter(move |&slot| self.contains(slot))
    }

    /// Serializes the set as `MASK_WORDS` little-endian words.
    pub fn serialize<S: Serializer>(&mut self, s: &mut S) -> CodecResult<()> {
        for word in &mut self.words {
            s.u64(word)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PlayerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<u8> for PlayerSet {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for slot in iter {
            set.insert(slot);
        }
        set
    }
}
