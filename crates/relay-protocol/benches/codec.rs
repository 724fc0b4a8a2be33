//! Codec benchmarks for relay-protocol.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relay_protocol::{codec, Message};

fn broadcast_frame(size: usize) -> Bytes {
    let text = "x".repeat(size);
    Bytes::from(format!(r#"{{"type":"broadcast","payload":{{"text":"{}"}}}}"#, text))
}

fn bench_decode_broadcast(c: &mut Criterion) {
    let frame = broadcast_frame(64);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("broadcast_64B", |b| {
        b.iter(|| codec::decode(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode_large_broadcast(c: &mut Criterion) {
    let frame = broadcast_frame(64 * 1024);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("broadcast_64KiB", |b| {
        b.iter(|| codec::decode(black_box(&frame)))
    });
    group.finish();
}

fn bench_encode_pong(c: &mut Criterion) {
    let pong = Message::Pong {
        timestamp: 1_700_000_000,
    };

    c.bench_function("encode_pong", |b| b.iter(|| codec::encode(black_box(&pong))));
}

criterion_group!(
    benches,
    bench_decode_broadcast,
    bench_decode_large_broadcast,
    bench_encode_pong
);
criterion_main!(benches);
