//! # Net Event Stream
//!
//! Out-of-band bytes ("special" events such as chat or cheats) attached to
//! the next network tick the local node generates. The game writes with the
//! codec; every participant reads the same bytes back on the same tick
//! through [`TickInputs::events`](crate::integration::TickInputs::events).

use crate::codec::{CodecError, CodecResult, GrowableWriter, Serializer};
use crate::protocol::MAX_EVENT_BYTES;

/// Pending event bytes for the next generated tick.
#[derive(Debug, Default)]
pub struct NetEventStream {
    pending: GrowableWriter,
}

impl NetEventStream {
    /// Creates an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes.
    ///
    /// Fails without appending anything when the tick's event budget would
    /// overflow.
    pub fn push(&mut self, bytes: &[u8]) -> CodecResult<()> {
        self.ensure_room(bytes.len())?;
        self.pending.raw(&mut bytes.to_vec())
    }

    /// Appends one event written through the codec.
    ///
    /// The event is dropped as a whole when it does not fit.
    pub fn record(
        &mut self,
        write: impl FnOnce(&mut GrowableWriter) -> CodecResult<()>,
    ) -> CodecResult<()> {
        let mut event = GrowableWriter::new();
        write(&mut event)?;
        self.push(event.as_slice())
    }

    fn ensure_room(&self, extra: usize) -> CodecResult<()> {
        let remaining = MAX_EVENT_BYTES.saturating_sub(self.pending.len());
        if extra > remaining {
            return Err(CodecError::Overflow {
                needed: extra,
                remaining,
            });
        }
        Ok(())
    }

    /// Bytes waiting for the next tick.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Hands the pending bytes to a tick and starts over.
    pub fn take(&mut self) -> Vec<u8> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{LengthLimit, LengthPrefix, Reader};

    #[test]
    fn test_record_and_take() {
        let mut stream = NetEventStream::new();
        stream
            .record(|w| {
                w.u8(&mut 7)?;
                w.string(&mut "gg".to_string(), LengthPrefix::U8, LengthLimit::Any)
            })
            .unwrap();
        assert_eq!(stream.len(), 4);

        let bytes = stream.take();
        assert!(stream.is_empty());
        let mut reader = Reader::new(&bytes);
        let mut kind = 0u8;
        let mut text = String::new();
        reader.u8(&mut kind).unwrap();
        reader.string(&mut text, LengthPrefix::U8, LengthLimit::Any).unwrap();
        assert_eq!((kind, text.as_str()), (7, "gg"));
    }

    #[test]
    fn test_budget_enforced() {
        let mut stream = NetEventStream::new();
        stream.push(&[0; MAX_EVENT_BYTES - 1]).unwrap();
        assert!(stream.push(&[1, 2]).is_err());
        assert_eq!(stream.len(), MAX_EVENT_BYTES - 1);
        stream.push(&[3]).unwrap();
        assert_eq!(stream.len(), MAX_EVENT_BYTES);
    }
}
