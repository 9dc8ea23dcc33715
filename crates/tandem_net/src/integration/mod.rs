//! # Integration Layer
//!
//! The seams between the protocol core and the rest of a game.
//!
//! ```text
//! Game implements:          Core calls:
//! ┌──────────────────┐      ┌──────────────────────────────┐
//! │ Simulation       │ ←─── │ run_tick / sample_input /    │
//! │                  │      │ consistency_checksum         │
//! │ ProgressReporter │ ←─── │ present_progress / abort     │
//! │ Clock            │ ←─── │ now_millis                   │
//! └──────────────────┘      └──────────────────────────────┘
//! ```

pub mod traits;

pub use traits::*;
