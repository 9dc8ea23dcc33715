//! # Wire Codec Benchmark
//!
//! REQUIREMENTS:
//! - A full 16-player star packet encodes and decodes well under a tick
//! - Delta encoding of one command stays in the tens of nanoseconds
//!
//! Run with: `cargo bench --package tandem_net`

// Benchmarks don't need docs
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tandem_net::codec::GrowableWriter;
use tandem_net::protocol::{
    CommandDelta, InputCommand, Packet, PacketRegistry, PlayerBlock, TicEntry, TickPacket,
    AXIS_FORWARD, AXIS_YAW,
};

fn command(step: u32) -> InputCommand {
    let mut axes = [0i16; tandem_net::protocol::AXIS_COUNT];
    axes[AXIS_FORWARD] = (step % 50) as i16 * 100;
    axes[AXIS_YAW] = if step % 16 < 8 { 320 } else { -320 };
    InputCommand::new(step & 0x7, axes)
}

/// Tick packet carrying `players` blocks of `tics` tics each.
fn tick_packet(players: u8, tics: u8) -> TickPacket {
    let blocks = (0..players)
        .map(|slot| {
            let mut basis = InputCommand::NEUTRAL;
            let tics = (0..tics)
                .map(|offset| {
                    let next = command(u32::from(slot) * 31 + u32::from(offset));
                    let delta = CommandDelta::between(&basis, &next);
                    basis = next;
                    TicEntry {
                        offset,
                        events: if offset % 4 == 0 { vec![slot, offset] } else { Vec::new() },
                        delta,
                    }
                })
                .collect();
            PlayerBlock {
                slot,
                latency_ms: 0,
                consistency: vec![0xBEEF; 2],
                tics,
            }
        })
        .collect();
    TickPacket {
        flags: 0,
        base_sequence: 1_000,
        ack_sequence: 998,
        consistency_base: 996,
        consistency_ack: 995,
        quitters: Vec::new(),
        players: blocks,
    }
}

fn bench_tick_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick_encode");
    for players in [2u8, 4, 16] {
        let packet = Packet::from(tick_packet(players, 4));
        group.bench_with_input(BenchmarkId::from_parameter(players), &packet, |b, packet| {
            let mut writer = GrowableWriter::new();
            b.iter(|| {
                writer.clear();
                let mut packet = packet.clone();
                packet.write(&mut writer).unwrap();
                black_box(writer.len())
            });
        });
    }
    group.finish();
}

fn bench_tick_decode(c: &mut Criterion) {
    let registry = PacketRegistry::standard();
    let mut group = c.benchmark_group("tick_decode");
    for players in [2u8, 4, 16] {
        let mut writer = GrowableWriter::new();
        Packet::from(tick_packet(players, 4)).write(&mut writer).unwrap();
        let bytes = writer.take();
        group.bench_with_input(BenchmarkId::from_parameter(players), &bytes, |b, bytes| {
            b.iter(|| black_box(registry.read_all(bytes).unwrap()));
        });
    }
    group.finish();
}

fn bench_command_delta(c: &mut Criterion) {
    let commands: Vec<InputCommand> = (0..256).map(command).collect();
    c.bench_function("command_delta_256", |b| {
        b.iter(|| {
            let mut basis = InputCommand::NEUTRAL;
            let mut bytes = 0;
            for next in &commands {
                let delta = CommandDelta::between(&basis, next);
                bytes += delta.encoded_len();
                basis = delta.apply(&basis);
            }
            black_box(bytes)
        });
    });
}

criterion_group!(benches, bench_tick_encode, bench_tick_decode, bench_command_delta);
criterion_main!(benches);
