//! # Network Simulation
//!
//! Loss models for the in-process network and a harness that runs whole
//! sessions in one thread.
//!
//! ## Modules
//!
//! - `cluster`: several nodes over one [`MemoryNetwork`](crate::transport::MemoryNetwork),
//!   driven through the handshake and the sync engine with a shared manual clock

pub mod cluster;

pub use cluster::{ClusterConfig, ClusterNode, ClusterReport, LocalCluster};

/// Network conditions for simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkConditions {
    /// Packet loss percentage (0-100).
    pub packet_loss_percent: u8,
    /// Duplicate packet percentage (0-100).
    pub duplicate_percent: u8,
    /// Out-of-order percentage (0-100).
    pub out_of_order_percent: u8,
}

impl NetworkConditions {
    /// Nothing lost, nothing reordered.
    pub const PERFECT: Self = Self {
        packet_loss_percent: 0,
        duplicate_percent: 0,
        out_of_order_percent: 0,
    };

    /// Average network conditions (cable).
    pub const AVERAGE: Self = Self {
        packet_loss_percent: 1,
        duplicate_percent: 1,
        out_of_order_percent: 2,
    };

    /// Poor network conditions (mobile/wifi).
    pub const POOR: Self = Self {
        packet_loss_percent: 5,
        duplicate_percent: 2,
        out_of_order_percent: 5,
    };

    /// Pure loss at `percent`.
    #[must_use]
    pub const fn lossy(percent: u8) -> Self {
        Self {
            packet_loss_percent: percent,
            duplicate_percent: 0,
            out_of_order_percent: 0,
        }
    }

    /// Returns true if the datagram should be dropped.
    #[must_use]
    pub fn should_drop(&self, rng_value: u32) -> bool {
        (rng_value % 100) < u32::from(self.packet_loss_percent)
    }

    /// Returns true if the datagram should be delivered twice.
    #[must_use]
    pub fn should_duplicate(&self, rng_value: u32) -> bool {
        (rng_value % 100) < u32::from(self.duplicate_percent)
    }

    /// Returns true if the datagram should be held back behind the next one.
    #[must_use]
    pub fn should_reorder(&self, rng_value: u32) -> bool {
        (rng_value % 100) < u32::from(self.out_of_order_percent)
    }
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self::PERFECT
    }
}

/// Minimal standard LCG, deterministic per seed.
pub(crate) struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    const MODULUS: u64 = 2_147_483_647;

    pub(crate) const fn new(seed: u64) -> Self {
        let state = seed % Self::MODULUS;
        Self {
            state: if state == 0 { 1 } else { state },
        }
    }

    pub(crate) fn next(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(48_271) % Self::MODULUS;
        self.state as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_deterministic_and_nonzero() {
        let mut a = SimpleRng::new(0);
        let mut b = SimpleRng::new(0);
        for _ in 0..100 {
            let v = a.next();
            assert_ne!(v, 0);
            assert_eq!(v, b.next());
        }
    }

    #[test]
    fn test_conditions_thresholds() {
        let c = NetworkConditions::lossy(30);
        assert!(c.should_drop(29));
        assert!(!c.should_drop(30));
        assert!(c.should_drop(129));
        assert!(!NetworkConditions::PERFECT.should_drop(0));
        assert!(!c.should_duplicate(0));
    }
}
