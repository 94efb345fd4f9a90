use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use courier::buffer::BitBuffer;
use courier::seq::Seq;
use courier::wire::{parse_datagram, DatagramPacker, DeliveryMethod, MessageType, WireMessage};

fn make_messages(count: usize, payload_len: usize) -> Vec<WireMessage> {
    (0..count)
        .map(|i| WireMessage {
            message_type: MessageType::Data(DeliveryMethod::ReliableOrdered, 0),
            is_fragment: false,
            sequence: Seq::new(i as u16),
            bit_length: (payload_len * 8) as u16,
            payload: Bytes::from(vec![i as u8; payload_len]),
        })
        .collect()
}

/// Benchmark packing framed messages into MTU-bounded datagrams.
fn bench_pack(c: &mut Criterion) {
    let messages = make_messages(32, 200);

    let mut group = c.benchmark_group("pack");
    group.throughput(Throughput::Elements(32));
    group.bench_function("pack_32_messages_mtu_1400", |b| {
        b.iter(|| {
            let mut packer = DatagramPacker::new(1400);
            let mut out = Vec::new();
            for msg in &messages {
                packer.push(black_box(msg), &mut out);
            }
            packer.flush(&mut out);
            out
        });
    });
    group.finish();
}

/// Benchmark parsing a full datagram back into framed messages.
fn bench_parse(c: &mut Criterion) {
    let messages = make_messages(6, 200);
    let mut buf = BytesMut::new();
    for msg in &messages {
        msg.encode_into(&mut buf);
    }
    let datagram = buf.freeze();

    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Bytes(datagram.len() as u64));
    group.bench_function("parse_datagram_6_messages", |b| {
        b.iter(|| parse_datagram(black_box(datagram.clone())).unwrap());
    });
    group.finish();
}

/// Benchmark the bit-buffer write/read hot path.
fn bench_bits(c: &mut Criterion) {
    let mut group = c.benchmark_group("bits");
    group.throughput(Throughput::Elements(64));
    group.bench_function("write_read_64_mixed_fields", |b| {
        b.iter(|| {
            let mut buf = BitBuffer::with_capacity(256);
            for i in 0..64u64 {
                buf.write_bits(black_box(i), (i % 63 + 1) as u32);
            }
            let mut total = 0u64;
            for i in 0..64u64 {
                total = total.wrapping_add(buf.read_bits((i % 63 + 1) as u32).unwrap());
            }
            total
        });
    });
    group.finish();
}

criterion_group!(benches, bench_pack, bench_parse, bench_bits);
criterion_main!(benches);
