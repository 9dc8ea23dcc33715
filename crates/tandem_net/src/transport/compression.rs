//! # Payload Compression
//!
//! Datagrams at or above a size threshold are offered to a [`Compressor`].
//! When the result is smaller, the first byte keeps the packet tag with
//! [`COMPRESSED_FLAG`] set and the rest of the datagram is the compressed
//! body.
//!
//! ```text
//! plain:       [tag      ][body .............]
//! compressed:  [tag|0x80 ][lz4(body) ....]
//! ```

use crate::protocol::{ProtocolError, ProtocolResult};

/// Sentinel bit on the first datagram byte.
pub const COMPRESSED_FLAG: u8 = 0x80;

/// Pluggable payload codec.
pub trait Compressor: Send {
    /// Compresses `input`; `None` when the result would exceed `max_out`
    /// or compression is unavailable.
    fn compress(&mut self, input: &[u8], max_out: usize) -> Option<Vec<u8>>;

    /// Inflates `input`; `None` when it is corrupt or would exceed `max_out`.
    fn decompress(&mut self, input: &[u8], max_out: usize) -> Option<Vec<u8>>;
}

/// LZ4 block compression with a little-endian size prefix.
#[derive(Clone, Copy, Debug, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compress(&mut self, input: &[u8], max_out: usize) -> Option<Vec<u8>> {
        let out = lz4_flex::block::compress_prepend_size(input);
        (out.len() <= max_out).then_some(out)
    }

    fn decompress(&mut self, input: &[u8], max_out: usize) -> Option<Vec<u8>> {
        let declared = input.get(..4)?;
        let size = u32::from_le_bytes([declared[0], declared[1], declared[2], declared[3]]);
        // Refuse before allocating.
        if size as usize > max_out {
            return None;
        }
        lz4_flex::block::decompress_size_prepended(input).ok()
    }
}

/// Compression disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(&mut self, _input: &[u8], _max_out: usize) -> Option<Vec<u8>> {
        None
    }

    fn decompress(&mut self, _input: &[u8], _max_out: usize) -> Option<Vec<u8>> {
        None
    }
}

/// Frames an encoded packet for the wire.
///
/// Returns true when the framed datagram is compressed.
pub fn frame(
    packet: &[u8],
    compressor: &mut dyn Compressor,
    threshold: usize,
    out: &mut Vec<u8>,
) -> bool {
    out.clear();
    if let Some((&tag, body)) = packet.split_first() {
        if packet.len() >= threshold {
            if let Some(packed) = compressor.compress(body, body.len()) {
                if packed.len() < body.len() {
                    out.push(tag | COMPRESSED_FLAG);
                    out.extend_from_slice(&packed);
                    return true;
                }
            }
        }
    }
    out.extend_from_slice(packet);
    false
}

/// Undoes [`frame`], inflating into `scratch` when needed.
pub fn unframe<'a>(
    datagram: &'a [u8],
    compressor: &mut dyn Compressor,
    max_len: usize,
    scratch: &'a mut Vec<u8>,
) -> ProtocolResult<&'a [u8]> {
    let Some((&first, body)) = datagram.split_first() else {
        return Err(ProtocolError::Compression("empty datagram".into()));
    };
    if first & COMPRESSED_FLAG == 0 {
        return Ok(datagram);
    }
    let inflated = compressor
        .decompress(body, max_len.saturating_sub(1))
        .ok_or_else(|| ProtocolError::Compression(format!("{} byte payload", body.len())))?;
    scratch.clear();
    scratch.push(first & !COMPRESSED_FLAG);
    scratch.extend_from_slice(&inflated);
    Ok(scratch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_datagram_left_plain() {
        let mut out = Vec::new();
        let packet = [0x20u8, 1, 2, 3];
        assert!(!frame(&packet, &mut Lz4Compressor, 64, &mut out));
        assert_eq!(out, packet);
    }

    #[test]
    fn test_large_repetitive_datagram_compressed() {
        let mut packet = vec![0x20u8];
        packet.extend(std::iter::repeat(7u8).take(600));
        let mut out = Vec::new();
        assert!(frame(&packet, &mut Lz4Compressor, 64, &mut out));
        assert_eq!(out[0], 0x20 | COMPRESSED_FLAG);
        assert!(out.len() < packet.len());

        let mut scratch = Vec::new();
        let plain = unframe(&out, &mut Lz4Compressor, 4096, &mut scratch).unwrap();
        assert_eq!(plain, &packet[..]);
    }

    #[test]
    fn test_incompressible_stays_plain() {
        // Short, high-entropy body does not shrink.
        let packet: Vec<u8> = (0..80u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect();
        let mut out = Vec::new();
        let compressed = frame(&packet, &mut Lz4Compressor, 16, &mut out);
        if !compressed {
            assert_eq!(out, packet);
        }
        let mut scratch = Vec::new();
        assert_eq!(
            unframe(&out, &mut Lz4Compressor, 4096, &mut scratch).unwrap(),
            &packet[..]
        );
    }

    #[test]
    fn test_bomb_refused() {
        let mut packet = vec![0x20u8];
        packet.extend(std::iter::repeat(0u8).take(5000));
        let mut out = Vec::new();
        assert!(frame(&packet, &mut Lz4Compressor, 64, &mut out));
        let mut scratch = Vec::new();
        assert!(unframe(&out, &mut Lz4Compressor, 1200, &mut scratch).is_err());
    }

    #[test]
    fn test_disabled_compressor_rejects_flagged() {
        let mut scratch = Vec::new();
        let datagram = [0x20 | COMPRESSED_FLAG, 1, 2];
        assert!(unframe(&datagram, &mut NoCompression, 1200, &mut scratch).is_err());
    }
}
