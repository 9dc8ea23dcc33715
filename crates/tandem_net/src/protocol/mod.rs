//! # Tandem Wire Protocol
//!
//! Packet kinds, their registry, the delta-encoded input command and the
//! steady-state tick packet.
//!
//! ## Datagram Structure
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Tag (1 byte, high bit = compressed)                        │
//! ├────────────────────────────────────────────────────────────┤
//! │ Argument count (1 byte)                                    │
//! ├────────────────────────────────────────────────────────────┤
//! │ Fields (per packet kind)                                   │
//! ├────────────────────────────────────────────────────────────┤
//! │ ...further packets, back to back                           │
//! └────────────────────────────────────────────────────────────┘
//! ```

mod command;
mod packets;
mod registry;
mod tick;

pub use command::{
    collapse_ticdup, CommandDelta, InputCommand, AXIS_COUNT, AXIS_FORWARD, AXIS_PITCH,
    AXIS_ROLL, AXIS_SIDE, AXIS_UP, AXIS_YAW, BUTTON_BITS, BUTTON_MASK,
};
pub use packets::*;
pub use registry::{read_body, skip_body, write_body, PacketRegistry};
pub use tick::{
    PlayerBlock, TicEntry, TickPacket, FLAG_LATENCY, FLAG_QUITTERS, FLAG_RETRANSMIT,
    MAX_EVENT_BYTES,
};

use crate::codec::CodecError;
use thiserror::Error;

/// Errors raised while encoding or dispatching packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// No kind is registered for the tag.
    #[error("unknown packet tag {0:#04x}")]
    UnknownTag(u8),

    /// A kind was registered twice for the same tag.
    #[error("packet tag {0:#04x} registered twice")]
    DuplicateTag(u8),

    /// A typed read found a different tag.
    #[error("expected packet tag {expected:#04x}, found {found:#04x}")]
    TagMismatch {
        /// Tag the reader expected.
        expected: u8,
        /// Tag on the wire.
        found: u8,
    },

    /// Declared and consumed field counts disagree.
    #[error("packet {tag:#04x} declares {declared} fields but has {actual}")]
    ArgCountMismatch {
        /// Packet tag.
        tag: u8,
        /// Count the kind or the wire declares.
        declared: u8,
        /// Count actually seen.
        actual: u8,
    },

    /// A compressed payload could not be inflated.
    #[error("compressed payload rejected: {0}")]
    Compression(String),

    /// Underlying codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
