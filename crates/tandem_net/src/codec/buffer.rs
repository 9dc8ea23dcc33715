//! # Codec Buffers
//!
//! Concrete [`Serializer`] implementations.
//!
//! ## Design
//!
//! - [`Writer`] borrows a caller-owned fixed buffer (no allocations)
//! - [`GrowableWriter`] owns a `Vec<u8>` and doubles it on demand
//! - [`Reader`] and [`Measurer`] borrow the encoded bytes

use super::{CodecError, CodecResult, LengthLimit, LengthPrefix, Mode, Serializer};

/// Fixed-capacity writer over a borrowed buffer.
pub struct Writer<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> Writer<'a> {
    /// Creates a writer positioned at the start of `buffer`.
    #[must_use]
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Bytes still available.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    /// The bytes written so far.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.position]
    }

    fn reserve(&self, needed: usize) -> CodecResult<()> {
        if needed > self.remaining() {
            return Err(CodecError::Overflow {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }
}

impl Serializer for Writer<'_> {
    #[inline]
    fn mode(&self) -> Mode {
        Mode::Write
    }

    #[inline]
    fn position(&self) -> usize {
        self.position
    }

    #[inline]
    fn raw(&mut self, bytes: &mut [u8]) -> CodecResult<()> {
        self.reserve(bytes.len())?;
        self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }

    fn rewind(&mut self, position: usize) {
        self.position = self.position.min(position);
    }

    fn bytes(
        &mut self,
        value: &mut Vec<u8>,
        prefix: LengthPrefix,
        limit: LengthLimit,
    ) -> CodecResult<()> {
        let (len_bytes, width) = prefix.encode(value.len())?;
        limit.check(value.len() as u64)?;
        // Prefix and payload land together or not at all.
        self.reserve(width + value.len())?;
        let start = self.position;
        self.buffer[start..start + width].copy_from_slice(&len_bytes[..width]);
        self.buffer[start + width..start + width + value.len()].copy_from_slice(value);
        self.position += width + value.len();
        Ok(())
    }
}

/// Writer that grows its own storage geometrically.
///
/// Used for the net event stream and anywhere the encoded size is not
/// known up front.
#[derive(Clone, Debug, Default)]
pub struct GrowableWriter {
    buffer: Vec<u8>,
}

impl GrowableWriter {
    /// Initial capacity of a fresh writer.
    pub const INITIAL_CAPACITY: usize = 64;

    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(Self::INITIAL_CAPACITY),
        }
    }

    /// Bytes written so far.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when nothing has been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current storage capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// The bytes written so far.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Clears the contents, keeping the storage.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Takes the written bytes, leaving the writer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Consumes the writer and returns its bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    fn grow_for(&mut self, additional: usize) {
        let needed = self.buffer.len() + additional;
        if needed > self.buffer.capacity() {
            let doubled = (self.buffer.capacity() * 2).max(Self::INITIAL_CAPACITY);
            self.buffer.reserve(doubled.max(needed) - self.buffer.len());
        }
    }
}

impl Serializer for GrowableWriter {
    #[inline]
    fn mode(&self) -> Mode {
        Mode::Write
    }

    #[inline]
    fn position(&self) -> usize {
        self.buffer.len()
    }

    fn raw(&mut self, bytes: &mut [u8]) -> CodecResult<()> {
        self.grow_for(bytes.len());
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn rewind(&mut self, position: usize) {
        self.buffer.truncate(position);
    }

    fn bytes(
        &mut self,
        value: &mut Vec<u8>,
        prefix: LengthPrefix,
        limit: LengthLimit,
    ) -> CodecResult<()> {
        let (len_bytes, width) = prefix.encode(value.len())?;
        limit.check(value.len() as u64)?;
        self.grow_for(width + value.len());
        self.buffer.extend_from_slice(&len_bytes[..width]);
        self.buffer.extend_from_slice(value);
        Ok(())
    }
}

/// Reader over encoded bytes.
pub struct Reader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader positioned at the start of `buffer`.
    #[must_use]
    pub const fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Bytes left to read.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// The unread tail of the buffer.
    #[inline]
    #[must_use]
    pub fn rest(&self) -> &'a [u8] {
        &self.buffer[self.position..]
    }

    /// Skips `count` bytes.
    pub fn advance(&mut self, count: usize) -> CodecResult<()> {
        self.check(count)?;
        self.position += count;
        Ok(())
    }

    /// Runs `f` and restores the cursor afterwards, whatever the outcome.
    pub fn peek<T>(&mut self, f: impl FnOnce(&mut Self) -> CodecResult<T>) -> CodecResult<T> {
        let start = self.position;
        let result = f(self);
        self.position = start;
        result
    }

    /// Reads the next byte without consuming it.
    pub fn peek_u8(&mut self) -> CodecResult<u8> {
        self.peek(|r| {
            let mut value = 0u8;
            r.u8(&mut value)?;
            Ok(value)
        })
    }

    fn check(&self, needed: usize) -> CodecResult<()> {
        if needed > self.remaining() {
            return Err(CodecError::Underflow {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    /// Reads a prefix and validates the payload fits; returns (width, len).
    fn prefixed(&self, prefix: LengthPrefix, limit: LengthLimit) -> CodecResult<(usize, usize)> {
        let len = prefix.decode(self.rest())?;
        limit.check(len)?;
        let width = prefix.width();
        let len = usize::try_from(len).map_err(|_| CodecError::InvalidValue {
            what: "length prefix",
            value: len,
        })?;
        self.check(width.saturating_add(len))?;
        Ok((width, len))
    }
}

impl Serializer for Reader<'_> {
    #[inline]
    fn mode(&self) -> Mode {
        Mode::Read
    }

    #[inline]
    fn position(&self) -> usize {
        self.position
    }

    #[inline]
    fn raw(&mut self, bytes: &mut [u8]) -> CodecResult<()> {
        self.check(bytes.len())?;
        bytes.copy_from_slice(&self.buffer[self.position..self.position + bytes.len()]);
        self.position += bytes.len();
        Ok(())
    }

    fn rewind(&mut self, position: usize) {
        self.position = self.position.min(position);
    }

    fn bytes(
        &mut self,
        value: &mut Vec<u8>,
        prefix: LengthPrefix,
        limit: LengthLimit,
    ) -> CodecResult<()> {
        let (width, len) = self.prefixed(prefix, limit)?;
        let start = self.position + width;
        value.clear();
        value.extend_from_slice(&self.buffer[start..start + len]);
        self.position = start + len;
        Ok(())
    }
}

/// Walks encoded bytes to find where a structure ends.
///
/// Scalars are still decoded (counts steer the field sequence) but array
/// and string payloads are skipped without being copied.
pub struct Measurer<'a> {
    inner: Reader<'a>,
}

impl<'a> Measurer<'a> {
    /// Creates a measurer positioned at the start of `buffer`.
    #[must_use]
    pub const fn new(buffer: &'a [u8]) -> Self {
        Self {
            inner: Reader::new(buffer),
        }
    }

    /// Bytes left to walk.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.inner.remaining()
    }
}

impl Serializer for Measurer<'_> {
    #[inline]
    fn mode(&self) -> Mode {
        Mode::Measure
    }

    #[inline]
    fn position(&self) -> usize {
        self.inner.position
    }

    #[inline]
    fn raw(&mut self, bytes: &mut [u8]) -> CodecResult<()> {
        self.inner.raw(bytes)
    }

    fn rewind(&mut self, position: usize) {
        self.inner.rewind(position);
    }

    fn bytes(
        &mut self,
        _value: &mut Vec<u8>,
        prefix: LengthPrefix,
        limit: LengthLimit,
    ) -> CodecResult<()> {
        let (width, len) = self.inner.prefixed(prefix, limit)?;
        self.inner.position += width + len;
        Ok(())
    }

    fn string(
        &mut self,
        _value: &mut String,
        prefix: LengthPrefix,
        limit: LengthLimit,
    ) -> CodecResult<()> {
        let (width, len) = self.inner.prefixed(prefix, limit)?;
        self.inner.position += width + len;
        Ok(())
    }
}
