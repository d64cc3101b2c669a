use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use procloop::action::dispatch::coalesce_messages;
use procloop::protocol::{encode, ProtocolRegistry, ResolutionMessage, StreamDecoder};
use procloop::RuntimeArg;
use std::time::Duration;

fn registry() -> ProtocolRegistry {
    let mut registry = ProtocolRegistry::new();
    ResolutionMessage::register(&mut registry).expect("register resolution schema");
    registry
}

fn message(payload: usize) -> ResolutionMessage {
    let mut m = ResolutionMessage::to_label("group1", vec![b'x'; payload]);
    m.set_destination_pid(4242);
    m
}

// ===========================================================================
// 1. ENCODE
// ===========================================================================

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.measurement_time(Duration::from_secs(5));

    for payload in [16usize, 1024, 64 * 1024] {
        let m = message(payload);
        group.throughput(Throughput::Bytes(payload as u64));
        group.bench_with_input(BenchmarkId::new("resolution", payload), &m, |b, m| {
            b.iter(|| black_box(encode(black_box(m.as_message()))));
        });
    }

    group.finish();
}

// ===========================================================================
// 2. STREAM DECODE
//    A burst of frames read back the way a pipe delivers them.
// ===========================================================================

fn bench_decode_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_stream");
    group.measurement_time(Duration::from_secs(5));

    for (name, payload, count) in [("100x_small", 16usize, 100usize), ("10x_large", 64 * 1024, 10)] {
        let frame = encode(message(payload).as_message());
        let stream: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * count).collect();
        group.throughput(Throughput::Bytes(stream.len() as u64));

        group.bench_function(name, |b| {
            let mut registry = registry();
            b.iter(|| {
                let mut buffer = stream.clone();
                let mut decoder = StreamDecoder::new();
                let mut decoded = 0;
                while decoder.read(&mut buffer, &mut registry).is_ok() {
                    decoded += 1;
                }
                black_box(decoded)
            });
        });
    }

    group.finish();
}

// ===========================================================================
// 3. COALESCING
// ===========================================================================

fn bench_coalesce(c: &mut Criterion) {
    let mut group = c.benchmark_group("coalesce");

    let args: Vec<RuntimeArg> = (0..256)
        .map(|i| {
            let mut m = ResolutionMessage::to_label("group1", format!("job {}", i % 8));
            m.set_coalesce(i % 2 == 0);
            RuntimeArg::Message(m)
        })
        .collect();

    group.bench_function("256_messages", |b| {
        b.iter(|| {
            let mut batch = args.clone();
            coalesce_messages(&mut batch);
            black_box(batch.len())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode_stream, bench_coalesce);
criterion_main!(benches);
