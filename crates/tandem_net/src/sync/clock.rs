//! # Tick Clock
//!
//! Fixed-timestep accounting for the lockstep loop.
//!
//! ## Design
//!
//! The clock never sleeps and never reads the system time itself: the
//! caller passes `now` in milliseconds, so the same engine runs against a
//! real clock or a manual one. It answers two questions:
//! - how many simulation ticks real time says should exist by now
//! - how long until the next one is due

use std::time::Duration;

/// Fixed-timestep tick accounting.
#[derive(Clone, Debug)]
pub struct TickClock {
    /// Target tick duration.
    tick_ms: u64,
    /// Time tick zero was due.
    origin_ms: u64,
    /// Frame statistics.
    stats: FrameStats,
}

/// Per-frame statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames recorded.
    pub frames: u64,
    /// Simulation ticks run across all frames.
    pub ticks_run: u64,
    /// Frames that wanted to run but were held back by the network.
    pub gated_frames: u64,
    /// Most ticks run in a single frame.
    pub max_burst: u32,
}

impl TickClock {
    /// Creates a clock for `tick_rate` ticks per second, starting at `now_ms`.
    #[must_use]
    pub fn new(tick_rate: u32, now_ms: u64) -> Self {
        Self {
            tick_ms: (1000 / u64::from(tick_rate.max(1))).max(1),
            origin_ms: now_ms,
            stats: FrameStats::default(),
        }
    }

    /// Target tick duration in milliseconds.
    #[must_use]
    pub const fn tick_ms(&self) -> u64 {
        self.tick_ms
    }

    /// Ticks real time says should have started by `now_ms`.
    #[must_use]
    pub fn entered(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.origin_ms) / self.tick_ms + 1
    }

    /// Time until tick `tick` is due.
    #[must_use]
    pub fn until_tick(&self, tick: u64, now_ms: u64) -> Duration {
        let due = self.origin_ms + tick * self.tick_ms;
        Duration::from_millis(due.saturating_sub(now_ms))
    }

    /// Records one frame.
    pub fn record_frame(&mut self, ticks_run: u32, gated: bool) {
        self.stats.frames += 1;
        self.stats.ticks_run += u64::from(ticks_run);
        self.stats.max_burst = self.stats.max_burst.max(ticks_run);
        if gated {
            self.stats.gated_frames += 1;
        }
    }

    /// Frame statistics.
    #[must_use]
    pub const fn stats(&self) -> &FrameStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_creation() {
        let clock = TickClock::new(35, 1000);
        assert_eq!(clock.tick_ms(), 28);
        // Tick zero is due immediately.
        assert_eq!(clock.entered(1000), 1);
        assert_eq!(clock.entered(1027), 1);
        assert_eq!(clock.entered(1028), 2);
        assert_eq!(clock.entered(500), 1);
    }

    #[test]
    fn test_until_tick() {
        let clock = TickClock::new(1000, 0);
        assert_eq!(clock.until_tick(10, 4), Duration::from_millis(6));
        assert_eq!(clock.until_tick(10, 40), Duration::ZERO);
    }

    #[test]
    fn test_stats_tracking() {
        let mut clock = TickClock::new(60, 0);
        clock.record_frame(1, false);
        clock.record_frame(3, false);
        clock.record_frame(0, true);
        let stats = clock.stats();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.ticks_run, 4);
        assert_eq!(stats.max_burst, 3);
        assert_eq!(stats.gated_frames, 1);
    }
}
