//! # Session Errors
//!
//! Top-level error type surfaced to the caller of the handshake and the
//! sync engine. Lower layers keep their own enums and convert upward.

use thiserror::Error;

use crate::codec::CodecError;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Why a host refused a guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Rejection {
    /// Protocol versions differ.
    WrongVersion = 1,
    /// Every slot is taken.
    LobbyFull = 2,
    /// The game has already started.
    AlreadyInProgress = 3,
    /// The password does not match.
    WrongPassword = 4,
    /// Loaded content differs from the host's.
    InvalidFiles = 5,
}

impl Rejection {
    /// Decodes the wire value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::WrongVersion),
            2 => Some(Self::LobbyFull),
            3 => Some(Self::AlreadyInProgress),
            4 => Some(Self::WrongPassword),
            5 => Some(Self::InvalidFiles),
            _ => None,
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            Self::WrongVersion => "the host is running a different protocol version",
            Self::LobbyFull => "the game is full",
            Self::AlreadyInProgress => "the game has already started",
            Self::WrongPassword => "the password is incorrect",
            Self::InvalidFiles => "your game files do not match the host's",
        };
        f.write_str(message)
    }
}

/// Errors surfaced by sessions, the handshake and the sync engine.
#[derive(Error, Debug)]
pub enum NetError {
    /// Socket setup or address resolution failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A packet could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The host refused to admit us.
    #[error("connection refused: {0}")]
    Rejected(Rejection),

    /// The host went away during the handshake.
    #[error("the host disconnected")]
    HostDisconnected,

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<CodecError> for NetError {
    fn from(error: CodecError) -> Self {
        Self::Protocol(ProtocolError::Codec(error))
    }
}

/// Result type for session-level operations.
pub type NetResult<T> = Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_wire_values() {
        for reason in [
            Rejection::WrongVersion,
            Rejection::LobbyFull,
            Rejection::AlreadyInProgress,
            Rejection::WrongPassword,
            Rejection::InvalidFiles,
        ] {
            assert_eq!(Rejection::from_u8(reason as u8), Some(reason));
        }
        assert_eq!(Rejection::from_u8(0), None);
        assert_eq!(Rejection::from_u8(6), None);
    }

    #[test]
    fn test_rejection_message_per_reason() {
        let err = NetError::Rejected(Rejection::WrongPassword);
        assert_eq!(err.to_string(), "connection refused: the password is incorrect");
    }
}
