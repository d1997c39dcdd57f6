//! Benchmarks for the bin hot path
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use timetag_capture::analysis::Correlator;
use timetag_capture::binner::{BinHandler, BinRecord, RecordLayout};
use timetag_capture::pipeline::ChannelStore;
use timetag_capture::RingBuffer;

const CLOCK: u64 = 30_000_000;

fn bench_ring_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer");

    for size in [1000, 10_000, 100_000].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("append", size), size, |b, &size| {
            let mut buffer = RingBuffer::new(size).unwrap();
            let mut i = 0u32;
            b.iter(|| {
                buffer.append(black_box(i));
                i = i.wrapping_add(1);
            });
        });
    }

    for size in [1000, 10_000, 100_000].iter() {
        let mut buffer = RingBuffer::new(*size).unwrap();
        // Wrap once so reads have to unroll
        for i in 0..(*size + size / 2) {
            buffer.append(i as f64);
        }
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("get", size), &buffer, |b, buffer| {
            b.iter(|| black_box(buffer.get()));
        });
    }

    group.finish();
}

fn bench_record_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_decoding");

    let records: Vec<u8> = (0..10_000u64)
        .flat_map(|i| RecordLayout::Tagged.encode(&BinRecord::new((i % 4) as i32, i * 30_000, 7, 0)))
        .collect();
    let size = RecordLayout::Tagged.record_size();

    group.throughput(Throughput::Elements(10_000));
    group.bench_function("tagged", |b| {
        b.iter(|| {
            let mut photons = 0u64;
            for chunk in records.chunks_exact(size) {
                if let Some(record) = RecordLayout::Tagged.decode(black_box(chunk)) {
                    photons += u64::from(record.count);
                }
            }
            black_box(photons)
        });
    });

    group.finish();
}

fn bench_channel_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_store");

    let store = ChannelStore::new(10_000).unwrap();
    group.throughput(Throughput::Elements(1));
    group.bench_function("handle_bin", |b| {
        let mut t = 0u64;
        b.iter(|| {
            let bin = BinRecord::new((t % 4) as i32, t * 30_000, 5, 0).to_bin(CLOCK);
            store.handle_bin(black_box(&bin));
            t += 1;
        });
    });

    group.finish();
}

fn bench_correlation(c: &mut Criterion) {
    let mut group = c.benchmark_group("correlation");

    for size in [1000, 10_000].iter() {
        let a: Vec<u32> = (0..*size).map(|i| (i * 7 % 13) as u32).collect();
        let b: Vec<u32> = (0..*size).map(|i| (i * 5 % 11) as u32).collect();
        let mut correlator = Correlator::new();
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("fft", size), size, |bench, _| {
            bench.iter(|| black_box(correlator.correlate_counts(&a, &b, 100, 1e-4)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_ring_buffer,
    bench_record_decoding,
    bench_channel_store,
    bench_correlation
);
criterion_main!(benches);
