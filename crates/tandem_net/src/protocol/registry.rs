//! # Packet Registry
//!
//! Tag → decoder dispatch over the closed [`Packet`] sum type, plus an
//! extension table for game-specific kinds.
//!
//! Registering the same tag twice is a configuration error. An unknown tag
//! on the wire is a hard error: nothing after it can be trusted.

use crate::codec::{Measurer, Reader, Serializer};

use super::packets::{
    Connect, ConnectAck, Exit, GameInfo, GameInfoAck, GameParams, GameParamsAck, Go, Heartbeat,
    KnownPlayers, LatencyAck, LatencyProbe, Packet, PacketBody, PacketType, RawPacket, Reject,
    Setup, SetupAck, SetupReady, UserInfo, UserInfoAck,
};
use super::packets::Args;
use super::tick::TickPacket;
use super::{ProtocolError, ProtocolResult};

/// Writes `body` with its tag and argument count.
///
/// Returns `Ok(false)` without writing anything when the body declines to
/// be written. On failure the writer is left where it started.
pub fn write_body<T: PacketBody, S: Serializer>(body: &mut T, s: &mut S) -> ProtocolResult<bool> {
    if !body.should_write() {
        return Ok(false);
    }
    let start = s.position();
    encode_fields(body, s).map_err(|e| {
        s.rewind(start);
        e
    })?;
    Ok(true)
}

fn encode_fields<T: PacketBody, S: Serializer>(body: &mut T, s: &mut S) -> ProtocolResult<()> {
    let mut tag = T::TAG;
    let mut argc = T::ARG_COUNT;
    s.u8(&mut tag)?;
    s.u8(&mut argc)?;
    let mut args = Args::new(s);
    body.fields(&mut args)?;
    if args.count() != T::ARG_COUNT {
        return Err(ProtocolError::ArgCountMismatch {
            tag: T::TAG,
            declared: T::ARG_COUNT,
            actual: args.count(),
        });
    }
    Ok(())
}

/// Runs the header and field sequence of `T` in a decoding direction.
fn decode_fields<T: PacketBody, S: Serializer>(s: &mut S) -> ProtocolResult<T> {
    let mut tag = 0u8;
    let mut argc = 0u8;
    s.u8(&mut tag)?;
    if tag != T::TAG {
        return Err(ProtocolError::TagMismatch {
            expected: T::TAG,
            found: tag,
        });
    }
    s.u8(&mut argc)?;
    if argc != T::ARG_COUNT {
        return Err(ProtocolError::ArgCountMismatch {
            tag,
            declared: T::ARG_COUNT,
            actual: argc,
        });
    }
    let mut body = T::default();
    let mut args = Args::new(s);
    body.fields(&mut args)?;
    if args.count() != argc {
        return Err(ProtocolError::ArgCountMismatch {
            tag,
            declared: argc,
            actual: args.count(),
        });
    }
    Ok(body)
}

/// Reads one `T`.
///
/// On failure the reader is left where it started.
pub fn read_body<T: PacketBody>(reader: &mut Reader<'_>) -> ProtocolResult<T> {
    let start = reader.position();
    decode_fields::<T, _>(reader).map_err(|e| {
        reader.rewind(start);
        e
    })
}

/// Walks one `T` without materializing its payloads; returns its length.
pub fn skip_body<T: PacketBody>(measurer: &mut Measurer<'_>) -> ProtocolResult<usize> {
    let start = measurer.position();
    decode_fields::<T, _>(measurer)?;
    Ok(measurer.position() - start)
}

type DecodeFn = fn(&mut Reader<'_>) -> ProtocolResult<Packet>;
type SkipFn = fn(&mut Measurer<'_>) -> ProtocolResult<usize>;
type CreateFn = fn() -> Packet;

#[derive(Clone, Copy)]
struct Entry {
    name: &'static str,
    arg_count: u8,
    decode: DecodeFn,
    skip: SkipFn,
    create: CreateFn,
}

fn builtin_entry<T: PacketBody + Into<Packet>>() -> Entry {
    Entry {
        name: std::any::type_name::<T>(),
        arg_count: T::ARG_COUNT,
        decode: decode_builtin::<T>,
        skip: skip_body::<T>,
        create: create_builtin::<T>,
    }
}

/// Every built-in kind with its tag.
fn builtins() -> [(u8, Entry); 19] {
    fn kind<T: PacketBody + Into<Packet>>() -> (u8, Entry) {
        (T::TAG, builtin_entry::<T>())
    }
    [
        kind::<Connect>(),
        kind::<ConnectAck>(),
        kind::<Reject>(),
        kind::<UserInfo>(),
        kind::<UserInfoAck>(),
        kind::<GameInfo>(),
        kind::<GameInfoAck>(),
        kind::<Heartbeat>(),
        kind::<Go>(),
        kind::<Exit>(),
        kind::<Setup>(),
        kind::<SetupAck>(),
        kind::<KnownPlayers>(),
        kind::<GameParams>(),
        kind::<GameParamsAck>(),
        kind::<SetupReady>(),
        kind::<TickPacket>(),
        kind::<LatencyProbe>(),
        kind::<LatencyAck>(),
    ]
}

fn decode_builtin<T: PacketBody + Into<Packet>>(reader: &mut Reader<'_>) -> ProtocolResult<Packet> {
    read_body::<T>(reader).map(Into::into)
}

fn create_builtin<T: PacketBody + Into<Packet>>() -> Packet {
    T::default().into()
}

fn decode_extension<T: PacketBody>(reader: &mut Reader<'_>) -> ProtocolResult<Packet> {
    let rest = reader.rest();
    let len = skip_body::<T>(&mut Measurer::new(rest))?;
    let bytes = rest[..len].to_vec();
    reader.advance(len)?;
    Ok(Packet::Extension(RawPacket { tag: T::TAG, bytes }))
}

fn create_extension<T: PacketBody>() -> Packet {
    Packet::Extension(RawPacket {
        tag: T::TAG,
        bytes: Vec::new(),
    })
}

/// Tag-indexed table of packet kinds.
pub struct PacketRegistry {
    entries: Vec<Option<Entry>>,
}

impl PacketRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: vec![None; usize::from(PacketType::MAX_TAG) + 1],
        }
    }

    /// Creates a registry holding every built-in packet kind.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for (tag, entry) in builtins() {
            if let Some(slot) = registry.entries.get_mut(usize::from(tag)) {
                *slot = Some(entry);
            }
        }
        registry
    }

    fn insert(&mut self, tag: u8, entry: Entry) -> ProtocolResult<()> {
        let slot = self
            .entries
            .get_mut(usize::from(tag))
            .ok_or(ProtocolError::UnknownTag(tag))?;
        if slot.is_some() {
            return Err(ProtocolError::DuplicateTag(tag));
        }
        *slot = Some(entry);
        Ok(())
    }

    /// Registers a kind of the closed packet set.
    pub fn register<T: PacketBody + Into<Packet>>(&mut self) -> ProtocolResult<()> {
        self.insert(T::TAG, builtin_entry::<T>())
    }

    /// Registers a game-specific kind; it decodes to [`Packet::Extension`].
    pub fn register_extension<T: PacketBody>(&mut self) -> ProtocolResult<()> {
        self.insert(
            T::TAG,
            Entry {
                name: std::any::type_name::<T>(),
                arg_count: T::ARG_COUNT,
                decode: decode_extension::<T>,
                skip: skip_body::<T>,
                create: create_extension::<T>,
            },
        )
    }

    fn entry(&self, tag: u8) -> ProtocolResult<&Entry> {
        self.entries
            .get(usize::from(tag))
            .and_then(Option::as_ref)
            .ok_or(ProtocolError::UnknownTag(tag))
    }

    /// True when `tag` is registered.
    #[must_use]
    pub fn contains(&self, tag: u8) -> bool {
        self.entry(tag).is_ok()
    }

    /// Type name registered for `tag`.
    pub fn name(&self, tag: u8) -> ProtocolResult<&'static str> {
        self.entry(tag).map(|e| e.name)
    }

    /// Declared argument count for `tag`.
    pub fn arg_count(&self, tag: u8) -> ProtocolResult<u8> {
        self.entry(tag).map(|e| e.arg_count)
    }

    /// Default-constructed packet of kind `tag`.
    pub fn create(&self, tag: u8) -> ProtocolResult<Packet> {
        self.entry(tag).map(|e| (e.create)())
    }

    /// Reads the next packet, dispatching on its tag.
    pub fn read(&self, reader: &mut Reader<'_>) -> ProtocolResult<Packet> {
        let tag = reader.peek_u8()?;
        (self.entry(tag)?.decode)(reader)
    }

    /// Skips the next packet, returning its encoded length.
    pub fn skip(&self, measurer: &mut Measurer<'_>) -> ProtocolResult<usize> {
        let mut tag = 0u8;
        let start = measurer.position();
        measurer.u8(&mut tag)?;
        measurer.rewind(start);
        (self.entry(tag)?.skip)(measurer)
    }

    /// Reads every packet packed back to back in `bytes`.
    pub fn read_all(&self, bytes: &[u8]) -> ProtocolResult<Vec<Packet>> {
        let mut reader = Reader::new(bytes);
        let mut packets = Vec::new();
        while reader.remaining() > 0 {
            packets.push(self.read(&mut reader)?);
        }
        Ok(packets)
    }
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecResult, GrowableWriter, LengthLimit, LengthPrefix};
    use crate::protocol::packets::ProtocolVersion;

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    struct Chat {
        from: u8,
        text: String,
    }

    impl PacketBody for Chat {
        const TAG: u8 = 0x40;
        const ARG_COUNT: u8 = 2;

        fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
            args.u8(&mut self.from)?;
            args.string(&mut self.text, LengthPrefix::U8, LengthLimit::Any)
        }
    }

    /// Declares three fields but only runs two.
    #[derive(Default)]
    struct Liar;

    impl PacketBody for Liar {
        const TAG: u8 = 0x41;
        const ARG_COUNT: u8 = 3;

        fn fields<S: Serializer>(&mut self, args: &mut Args<'_, S>) -> CodecResult<()> {
            args.u8(&mut 0)?;
            args.u8(&mut 0)
        }
    }

    fn encode(packet: &mut Packet) -> Vec<u8> {
        let mut out = GrowableWriter::new();
        packet.write(&mut out).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_dispatch_by_tag() {
        let registry = PacketRegistry::standard();
        let mut packet = Packet::ConnectAck(ConnectAck { slot: 3, capacity: 4 });
        let bytes = encode(&mut packet);
        let decoded = registry.read(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_unknown_tag_is_error() {
        let registry = PacketRegistry::standard();
        let bytes = [0x3Fu8, 0];
        let err = registry.read(&mut Reader::new(&bytes)).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag(0x3F)));
        assert!(registry.create(0x3F).is_err());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = PacketRegistry::standard();
        let err = registry.register::<Connect>().unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateTag(tag) if tag == Connect::TAG));
    }

    #[test]
    fn test_create_default_instance() {
        let registry = PacketRegistry::standard();
        assert_eq!(
            registry.create(Exit::TAG).unwrap(),
            Packet::Exit(Exit::default())
        );
        assert_eq!(registry.arg_count(GameParams::TAG).unwrap(), 3);
    }

    #[test]
    fn test_declared_count_mismatch_on_wire() {
        let registry = PacketRegistry::standard();
        // Reject declares one field; the wire claims two.
        let bytes = [Reject::TAG, 2, 4, 0];
        let err = registry.read(&mut Reader::new(&bytes)).unwrap_err();
        assert!(matches!(err, ProtocolError::ArgCountMismatch { declared: 1, actual: 2, .. }));
    }

    #[test]
    fn test_consumed_count_mismatch() {
        let mut out = GrowableWriter::new();
        let err = write_body(&mut Liar, &mut out).unwrap_err();
        assert!(matches!(err, ProtocolError::ArgCountMismatch { declared: 3, actual: 2, .. }));
        assert_eq!(out.len(), 0);
    }

    #[test]
    fn test_builtin_tags_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for (tag, _) in builtins() {
            assert!(tag <= PacketType::MAX_TAG, "tag {tag:#x} out of range");
            assert!(seen.insert(tag), "tag {tag:#x} used twice");
        }
        let registry = PacketRegistry::standard();
        assert!(seen.iter().all(|&tag| registry.contains(tag)));
        assert!(registry.contains(TickPacket::TAG));
    }

    #[test]
    fn test_failed_write_leaves_writer_at_start() {
        let mut buffer = [0u8; 8];
        let mut writer = crate::codec::Writer::new(&mut buffer);
        writer.u8(&mut 0xAA).unwrap();

        let mut chat = Chat { from: 1, text: "far too long".into() };
        assert!(write_body(&mut chat, &mut writer).is_err());
        assert_eq!(writer.position(), 1);

        let mut ack = ConnectAck { slot: 1, capacity: 2 };
        assert!(write_body(&mut ack, &mut writer).unwrap());
        assert_eq!(&buffer[1..3], &[ConnectAck::TAG, ConnectAck::ARG_COUNT]);
    }

    #[test]
    fn test_extension_round_through_raw() {
        let mut registry = PacketRegistry::standard();
        registry.register_extension::<Chat>().unwrap();
        assert!(registry.register_extension::<Chat>().is_err());

        let mut chat = Chat { from: 2, text: "gg".into() };
        let mut out = GrowableWriter::new();
        write_body(&mut chat, &mut out).unwrap();
        let bytes = out.into_inner();

        let packet = registry.read(&mut Reader::new(&bytes)).unwrap();
        let Packet::Extension(raw) = packet else {
            panic!("expected extension packet");
        };
        assert_eq!(raw.tag, Chat::TAG);
        assert_eq!(raw.decode_as::<Chat>().unwrap(), chat);
    }

    #[test]
    fn test_skip_over_embedded_packet() {
        let registry = PacketRegistry::standard();
        let mut out = GrowableWriter::new();
        Packet::UserInfo(UserInfo {
            slot: 1,
            addr: String::new(),
            info: "name\\guest".into(),
        })
        .write(&mut out)
        .unwrap();
        let first_len = out.len();
        Packet::Connect(Connect {
            version: ProtocolVersion::CURRENT,
            ..Connect::default()
        })
        .write(&mut out)
        .unwrap();
        let bytes = out.into_inner();

        let skipped = registry.skip(&mut Measurer::new(&bytes)).unwrap();
        assert_eq!(skipped, first_len);

        let all = registry.read_all(&bytes).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].tag(), Connect::TAG);
    }

    #[test]
    fn test_failed_read_restores_cursor() {
        let registry = PacketRegistry::standard();
        // Truncated UserInfo.
        let bytes = [UserInfo::TAG, 3, 1, 5, b'a'];
        let mut reader = Reader::new(&bytes);
        assert!(registry.read(&mut reader).is_err());
        assert_eq!(reader.position(), 0);
    }
}
