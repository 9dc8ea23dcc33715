//! # Latency Measurement
//!
//! Round-trip probes and the input-delay equalization derived from them.
//!
//! A prober stamps each outgoing [`LatencyProbe`](crate::protocol::LatencyProbe)
//! by index; the matching ack closes the sample. The average covers the last
//! [`LATENCY_WINDOW`] samples.

use crate::LATENCY_WINDOW;

/// Largest input delay, in network ticks, equalization will add.
pub const MAX_INPUT_DELAY: u8 = 8;

/// Outstanding probes remembered per peer.
const PENDING_SLOTS: usize = LATENCY_WINDOW * 2;

/// Rolling round-trip statistics for one peer.
#[derive(Clone, Debug)]
pub struct LatencyTracker {
    samples: [u32; LATENCY_WINDOW],
    count: usize,
    next_sample: usize,
    pending: [Option<(u8, u64)>; PENDING_SLOTS],
    next_index: u8,
}

impl LatencyTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            samples: [0; LATENCY_WINDOW],
            count: 0,
            next_sample: 0,
            pending: [None; PENDING_SLOTS],
            next_index: 0,
        }
    }

    /// Stamps a new probe and returns its index.
    pub fn begin_probe(&mut self, now_ms: u64) -> u8 {
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        self.pending[usize::from(index) % PENDING_SLOTS] = Some((index, now_ms));
        index
    }

    /// Closes the probe `index`; returns the round trip when it was pending.
    pub fn complete_probe(&mut self, index: u8, now_ms: u64) -> Option<u32> {
        let slot = &mut self.pending[usize::from(index) % PENDING_SLOTS];
        match *slot {
            Some((pending, sent)) if pending == index => {
                *slot = None;
                let rtt = u32::try_from(now_ms.saturating_sub(sent)).unwrap_or(u32::MAX);
                self.record(rtt);
                Some(rtt)
            }
            _ => None,
        }
    }

    /// Adds one round-trip sample.
    pub fn record(&mut self, rtt_ms: u32) {
        self.samples[self.next_sample] = rtt_ms;
        self.next_sample = (self.next_sample + 1) % LATENCY_WINDOW;
        self.count = (self.count + 1).min(LATENCY_WINDOW);
    }

    /// Average over the window, in milliseconds; 0 without samples.
    #[must_use]
    pub fn average_ms(&self) -> u16 {
        if self.count == 0 {
            return 0;
        }
        let total: u64 = self.samples[..self.count].iter().map(|&s| u64::from(s)).sum();
        u16::try_from(total / self.count as u64).unwrap_or(u16::MAX)
    }

    /// Samples in the window.
    #[must_use]
    pub const fn sample_count(&self) -> usize {
        self.count
    }

    /// Forgets every sample and outstanding probe.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Input delay, in network ticks, for a participant whose latency is
/// `own_ms` when the slowest participant sits at `highest_ms`.
///
/// Faster participants wait longer so everyone's effective lag is about
/// the same: half the latency gap, rounded to the nearest tick.
#[must_use]
pub fn equalization_delay(highest_ms: u16, own_ms: u16, network_tick_ms: u64) -> u8 {
    if network_tick_ms == 0 {
        return 0;
    }
    let gap = u64::from(highest_ms.saturating_sub(own_ms));
    let ticks = (gap + network_tick_ms) / (2 * network_tick_ms);
    u8::try_from(ticks).unwrap_or(u8::MAX).min(MAX_INPUT_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_roundtrip() {
        let mut tracker = LatencyTracker::new();
        let a = tracker.begin_probe(1000);
        let b = tracker.begin_probe(1010);
        assert_eq!(tracker.complete_probe(b, 1050), Some(40));
        assert_eq!(tracker.complete_probe(a, 1060), Some(60));
        assert_eq!(tracker.average_ms(), 50);
        // Duplicate ack is ignored.
        assert_eq!(tracker.complete_probe(a, 1100), None);
    }

    #[test]
    fn test_window_rolls() {
        let mut tracker = LatencyTracker::new();
        for _ in 0..LATENCY_WINDOW {
            tracker.record(500);
        }
        for _ in 0..LATENCY_WINDOW {
            tracker.record(20);
        }
        assert_eq!(tracker.average_ms(), 20);
        assert_eq!(tracker.sample_count(), LATENCY_WINDOW);
        tracker.reset();
        assert_eq!(tracker.average_ms(), 0);
    }

    #[test]
    fn test_equalization_rounding() {
        // Gap 100 ms, 28 ms ticks: 50 / 28 = 1.79 -> 2.
        assert_eq!(equalization_delay(150, 50, 28), 2);
        // Slowest participant never waits.
        assert_eq!(equalization_delay(150, 150, 28), 0);
        // Gap 27 ms: 13.5 / 28 -> 0.
        assert_eq!(equalization_delay(127, 100, 28), 0);
        assert_eq!(equalization_delay(u16::MAX, 0, 28), MAX_INPUT_DELAY);
        assert_eq!(equalization_delay(100, 0, 0), 0);
    }
}
