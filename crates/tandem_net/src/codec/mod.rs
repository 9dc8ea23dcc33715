//! # Byte Codec
//!
//! One encoding, three directions. Every wire structure in this crate is
//! described exactly once, as a sequence of calls against a [`Serializer`].
//! The same routine then runs against:
//!
//! - a [`Writer`] (or [`GrowableWriter`]) that emits bytes,
//! - a [`Reader`] that fills the values back in,
//! - a [`Measurer`] that walks encoded bytes and only reports how many
//!   bytes the structure occupies.
//!
//! Because the field sequence is shared, the "how big is this" pass and the
//! "read it" pass can never disagree.
//!
//! ## Wire rules
//!
//! ```text
//! u8/i8        1 byte
//! u16/i16      2 bytes, little-endian
//! u32/i32/f32  4 bytes, little-endian (floats by bit pattern)
//! u64/i64/f64  8 bytes, little-endian
//! bool         1 byte (0 = false)
//! array/string [length prefix: 1/2/4/8 bytes][payload]
//! ```
//!
//! Failed operations never move the cursor and never leave a partially
//! written value behind.

mod buffer;
pub mod chunk;

pub use buffer::{GrowableWriter, Measurer, Reader, Writer};

use thiserror::Error;

/// Errors raised by the byte codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A write would exceed the destination's capacity.
    #[error("write overflow: need {needed} bytes, {remaining} remaining")]
    Overflow {
        /// Bytes the operation needed.
        needed: usize,
        /// Bytes left in the destination.
        remaining: usize,
    },

    /// A read ran past the end of the source.
    #[error("read underflow: need {needed} bytes, {remaining} remaining")]
    Underflow {
        /// Bytes the operation needed.
        needed: usize,
        /// Bytes left in the source.
        remaining: usize,
    },

    /// A length-prefixed value violated its declared length constraint.
    #[error("length {actual} violates limit {limit}")]
    LengthMismatch {
        /// The limit that was applied.
        limit: LengthLimit,
        /// The length found.
        actual: u64,
    },

    /// A length does not fit in the chosen prefix width.
    #[error("length {len} does not fit a {width}-byte prefix")]
    PrefixTooNarrow {
        /// The length that had to be encoded.
        len: usize,
        /// Prefix width in bytes.
        width: usize,
    },

    /// A string payload was not valid UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,

    /// A decoded value is outside its legal range.
    #[error("invalid {what}: {value}")]
    InvalidValue {
        /// What was being decoded.
        what: &'static str,
        /// The offending value.
        value: u64,
    },
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Direction a [`Serializer`] runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Values are encoded into bytes.
    Write,
    /// Bytes are decoded into values.
    Read,
    /// Bytes are walked to compute a length; payloads are not copied.
    Measure,
}

/// Width of a length prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LengthPrefix {
    /// 1-byte prefix.
    U8,
    /// 2-byte prefix.
    U16,
    /// 4-byte prefix.
    U32,
    /// 8-byte prefix.
    U64,
}

impl LengthPrefix {
    /// Prefix width in bytes.
    #[inline]
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }

    /// Largest length the prefix can carry.
    #[inline]
    #[must_use]
    pub const fn max_len(self) -> u64 {
        match self {
            Self::U8 => u8::MAX as u64,
            Self::U16 => u16::MAX as u64,
            Self::U32 => u32::MAX as u64,
            Self::U64 => u64::MAX,
        }
    }

    /// Encodes `len` into little-endian prefix bytes.
    pub(crate) fn encode(self, len: usize) -> CodecResult<([u8; 8], usize)> {
        let width = self.width();
        let len64 = len as u64;
        if len64 > self.max_len() {
            return Err(CodecError::PrefixTooNarrow { len, width });
        }
        Ok((len64.to_le_bytes(), width))
    }

    /// Decodes a prefix from the start of `bytes`.
    pub(crate) fn decode(self, bytes: &[u8]) -> CodecResult<u64> {
        let width = self.width();
        if bytes.len() < width {
            return Err(CodecError::Underflow {
                needed: width,
                remaining: bytes.len(),
            });
        }
        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(&bytes[..width]);
        Ok(u64::from_le_bytes(raw))
    }
}

/// Constraint applied to the length of an array or string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LengthLimit {
    /// Any length the prefix can carry.
    Any,
    /// The length must be exactly this value.
    Exact(usize),
    /// The length must not exceed this value.
    AtMost(usize),
}

impl LengthLimit {
    /// Checks a length against the limit.
    pub fn check(self, len: u64) -> CodecResult<()> {
        let ok = match self {
            Self::Any => true,
            Self::Exact(n) => len == n as u64,
            Self::AtMost(n) => len <= n as u64,
        };
        if ok {
            Ok(())
        } else {
            Err(CodecError::LengthMismatch {
                limit: self,
                actual: len,
            })
        }
    }
}

impl std::fmt::Display for LengthLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Exact(n) => write!(f, "exactly {n}"),
            Self::AtMost(n) => write!(f, "at most {n}"),
        }
    }
}

macro_rules! primitive {
    ($(#[$doc:meta])* $name:ident, $ty:ty) => {
        $(#[$doc])*
        #[inline]
        fn $name(&mut self, value: &mut $ty) -> CodecResult<()> {
            let mut bytes = value.to_le_bytes();
            self.raw(&mut bytes)?;
            *value = <$ty>::from_le_bytes(bytes);
            Ok(())
        }
    };
}

/// A bidirectional field serializer.
///
/// Implementations only provide [`raw`](Serializer::raw) for fixed-size
/// byte groups and [`bytes`](Serializer::bytes) for length-prefixed
/// payloads; every typed primitive is derived from those two.
pub trait Serializer {
    /// Direction this serializer runs in.
    fn mode(&self) -> Mode;

    /// Cursor position in bytes.
    fn position(&self) -> usize;

    /// Transfers a fixed-size byte group.
    ///
    /// Writers copy `bytes` out, readers fill `bytes` in, measurers fill
    /// `bytes` in as well so that counts read mid-structure can steer the
    /// remaining field sequence.
    fn raw(&mut self, bytes: &mut [u8]) -> CodecResult<()>;

    /// Moves the cursor back to an earlier position.
    fn rewind(&mut self, position: usize);

    /// Transfers a length-prefixed byte array.
    fn bytes(
        &mut self,
        value: &mut Vec<u8>,
        prefix: LengthPrefix,
        limit: LengthLimit,
    ) -> CodecResult<()>;

    /// True when values are being decoded (read or measure).
    #[inline]
    fn is_decoding(&self) -> bool {
        self.mode() != Mode::Write
    }

    /// Transfers a single byte.
    #[inline]
    fn u8(&mut self, value: &mut u8) -> CodecResult<()> {
        let mut bytes = [*value];
        self.raw(&mut bytes)?;
        *value = bytes[0];
        Ok(())
    }

    primitive!(/// Transfers a little-endian `u16`.
        u16, u16);
    primitive!(/// Transfers a little-endian `u32`.
        u32, u32);
    primitive!(/// Transfers a little-endian `u64`.
        u64, u64);
    primitive!(/// Transfers an `i8`.
        i8, i8);
    primitive!(/// Transfers a little-endian `i16`.
        i16, i16);
    primitive!(/// Transfers a little-endian `i32`.
        i32, i32);
    primitive!(/// Transfers a little-endian `i64`.
        i64, i64);

    /// Transfers a bool as one byte.
    #[inline]
    fn bool(&mut self, value: &mut bool) -> CodecResult<()> {
        let mut byte = u8::from(*value);
        self.u8(&mut byte)?;
        *value = byte != 0;
        Ok(())
    }

    /// Transfers an `f32` by bit pattern.
    #[inline]
    fn f32(&mut self, value: &mut f32) -> CodecResult<()> {
        let mut bits = value.to_bits();
        self.u32(&mut bits)?;
        *value = f32::from_bits(bits);
        Ok(())
    }

    /// Transfers an `f64` by bit pattern.
    #[inline]
    fn f64(&mut self, value: &mut f64) -> CodecResult<()> {
        let mut bits = value.to_bits();
        self.u64(&mut bits)?;
        *value = f64::from_bits(bits);
        Ok(())
    }

    /// Transfers a length-prefixed UTF-8 string.
    fn string(
        &mut self,
        value: &mut String,
        prefix: LengthPrefix,
        limit: LengthLimit,
    ) -> CodecResult<()> {
        let start = self.position();
        let mut buf = std::mem::take(value).into_bytes();
        let result = self.bytes(&mut buf, prefix, limit);
        match String::from_utf8(buf) {
            Ok(text) => *value = text,
            Err(_) => {
                self.rewind(start);
                return Err(CodecError::InvalidUtf8);
            }
        }
        result
    }
}
