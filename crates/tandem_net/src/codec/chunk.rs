//! # Chunk Framing
//!
//! Tagged, length-prefixed chunks for recorded sessions.
//!
//! ```text
//! ┌──────────┬──────────────┬─────────────────┐
//! │ id (4 B) │ len (u32 LE) │ body (len B)    │
//! └──────────┴──────────────┴─────────────────┘
//! ```
//!
//! Only the framing lives here; what goes inside a chunk belongs to the
//! recorder.

use super::{CodecResult, LengthLimit, LengthPrefix, Measurer, Reader, Serializer};

/// Four-character chunk identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ChunkId(pub [u8; 4]);

impl ChunkId {
    /// Session header chunk.
    pub const HEADER: Self = Self(*b"THDR");
    /// Per-player user info chunk.
    pub const USER_INFO: Self = Self(*b"UINF");
    /// Tick body chunk.
    pub const BODY: Self = Self(*b"BODY");

    /// Creates an id from a 4-byte tag.
    #[must_use]
    pub const fn new(tag: [u8; 4]) -> Self {
        Self(tag)
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() { b as char } else { '?' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// One framed chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk identifier.
    pub id: ChunkId,
    /// Chunk payload.
    pub body: Vec<u8>,
}

impl Chunk {
    /// Creates a chunk.
    #[must_use]
    pub fn new(id: ChunkId, body: Vec<u8>) -> Self {
        Self { id, body }
    }

    /// Serializes the chunk in any direction.
    pub fn serialize<S: Serializer>(&mut self, s: &mut S) -> CodecResult<()> {
        s.raw(&mut self.id.0)?;
        s.bytes(&mut self.body, LengthPrefix::U32, LengthLimit::Any)
    }

    /// Encoded size of the chunk.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        4 + LengthPrefix::U32.width() + self.body.len()
    }
}

/// Reads the next chunk.
pub fn read_chunk(reader: &mut Reader<'_>) -> CodecResult<Chunk> {
    let mut chunk = Chunk::default();
    chunk.serialize(reader)?;
    Ok(chunk)
}

/// Skips the next chunk, returning its id.
pub fn skip_chunk(reader: &mut Reader<'_>) -> CodecResult<ChunkId> {
    let mut measurer = Measurer::new(reader.rest());
    let mut chunk = Chunk::default();
    chunk.serialize(&mut measurer)?;
    reader.advance(measurer.position())?;
    Ok(chunk.id)
}

/// Scans forward for the first chunk with `id`, skipping the others.
///
/// Returns `Ok(None)` when the input ends without a match.
pub fn find_chunk(reader: &mut Reader<'_>, id: ChunkId) -> CodecResult<Option<Chunk>> {
    while reader.remaining() > 0 {
        let next = reader.peek(|r| {
            let mut tag = [0u8; 4];
            r.raw(&mut tag)?;
            Ok(ChunkId(tag))
        })?;
        if next == id {
            return read_chunk(reader).map(Some);
        }
        skip_chunk(reader)?;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::GrowableWriter;

    fn stream() -> Vec<u8> {
        let mut out = GrowableWriter::new();
        Chunk::new(ChunkId::HEADER, vec![1, 2]).serialize(&mut out).unwrap();
        Chunk::new(ChunkId::USER_INFO, b"name\\ash".to_vec())
            .serialize(&mut out)
            .unwrap();
        Chunk::new(ChunkId::BODY, vec![0xAB; 40]).serialize(&mut out).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_chunk_layout() {
        let chunk = Chunk::new(ChunkId::HEADER, vec![5, 6, 7]);
        let mut out = GrowableWriter::new();
        chunk.clone().serialize(&mut out).unwrap();
        assert_eq!(out.as_slice(), b"THDR\x03\x00\x00\x00\x05\x06\x07");
        assert_eq!(chunk.encoded_len(), out.len());
    }

    #[test]
    fn test_find_chunk_skips_others() {
        let bytes = stream();
        let mut reader = Reader::new(&bytes);
        let body = find_chunk(&mut reader, ChunkId::BODY).unwrap().unwrap();
        assert_eq!(body.body.len(), 40);
        assert_eq!(reader.remaining(), 0);

        let mut reader = Reader::new(&bytes);
        assert!(find_chunk(&mut reader, ChunkId::new(*b"NONE")).unwrap().is_none());
    }

    #[test]
    fn test_truncated_chunk_is_error() {
        let bytes = stream();
        let mut reader = Reader::new(&bytes[..bytes.len() - 1]);
        assert_eq!(skip_chunk(&mut reader).unwrap(), ChunkId::HEADER);
        assert_eq!(skip_chunk(&mut reader).unwrap(), ChunkId::USER_INFO);
        assert!(skip_chunk(&mut reader).is_err());
    }

    #[test]
    fn test_chunk_id_display() {
        assert_eq!(ChunkId::BODY.to_string(), "BODY");
        assert_eq!(ChunkId::new([b'A', 0, b'B', b'C']).to_string(), "A?BC");
    }
}
