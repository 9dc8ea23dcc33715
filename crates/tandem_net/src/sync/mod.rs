//! # Tick Synchronization
//!
//! Lockstep exchange of per-participant input streams.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       SyncEngine                         │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────────────┐  │
//! │  │ TickClock  │  │ PeerState  │  │ NetEventStream     │  │
//! │  │ real time  │  │ ring, seqs │  │ bytes for next tic │  │
//! │  └────────────┘  │ checksums  │  └────────────────────┘  │
//! │                  │ latency    │                          │
//! │                  └────────────┘                          │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod clock;
mod engine;
mod events;
mod latency;
mod peer;

pub use clock::{FrameStats, TickClock};
pub use engine::{FrameReport, SyncEngine, HEARTBEAT_MS, PROBE_INTERVAL_MS};
pub use events::NetEventStream;
pub use latency::{equalization_delay, LatencyTracker, MAX_INPUT_DELAY};
pub use peer::{ConsistencyRing, PeerState, TickRecord, TickRing};
