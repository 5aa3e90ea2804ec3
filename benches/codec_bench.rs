//! Codec and envelope benchmarks.
//!
//! Measures the per-segment cost of framing and of the AEAD envelope at
//! the protocol's payload size.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use bytes::Bytes;
use rudp::crypto::{Envelope, SessionKey};
use rudp::transport::{Segment, PAYLOAD_SIZE};

fn bench_segment_encode(c: &mut Criterion) {
    let payload = Bytes::from(vec![0x5au8; PAYLOAD_SIZE]);

    let mut group = c.benchmark_group("segment_encode");
    group.throughput(Throughput::Bytes(PAYLOAD_SIZE as u64));

    group.bench_function("1024_bytes", |b| {
        b.iter(|| {
            let seg = Segment::data(4096, 128, 64, payload.clone());
            black_box(seg.encode())
        })
    });

    group.finish();
}

fn bench_segment_decode(c: &mut Criterion) {
    let payload = Bytes::from(vec![0x5au8; PAYLOAD_SIZE]);
    let encoded = Segment::data(4096, 128, 64, payload).encode();

    let mut group = c.benchmark_group("segment_decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("1024_bytes", |b| {
        b.iter(|| black_box(Segment::decode(&encoded).unwrap()))
    });

    group.finish();
}

fn bench_envelope_seal(c: &mut Criterion) {
    let key = SessionKey::from_material(&[0x42u8; 32]).unwrap();
    let envelope = Envelope::sealed(key);
    let payload = vec![0x5au8; PAYLOAD_SIZE];

    let mut group = c.benchmark_group("envelope_seal");
    group.throughput(Throughput::Bytes(PAYLOAD_SIZE as u64));

    group.bench_function("1024_bytes", |b| {
        b.iter(|| black_box(envelope.seal(&payload)))
    });

    group.finish();
}

fn bench_envelope_open(c: &mut Criterion) {
    let key = SessionKey::from_material(&[0x42u8; 32]).unwrap();
    let envelope = Envelope::sealed(key);
    let wire = envelope.seal(&vec![0x5au8; PAYLOAD_SIZE]);

    let mut group = c.benchmark_group("envelope_open");
    group.throughput(Throughput::Bytes(PAYLOAD_SIZE as u64));

    group.bench_function("1024_bytes", |b| {
        b.iter(|| black_box(envelope.open(&wire).unwrap()))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_segment_encode,
    bench_segment_decode,
    bench_envelope_seal,
    bench_envelope_open
);
criterion_main!(benches);
