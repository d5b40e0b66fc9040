//! Benchmarks for the Reed-Solomon segmenter
//!
//! Run with: cargo bench --package cumulus-core

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cumulus_core::segmenter::{split_default_blocks, Segmenter};

fn generate_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

fn bench_encode(c: &mut Criterion) {
    let segmenter = Segmenter::default();
    let mut group = c.benchmark_group("segmenter_encode");

    for size in [1024 * 1024, 10 * 1024 * 1024] {
        let blocks = split_default_blocks(&generate_data(size));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::new("blocks", format!("{}MB", size / (1024 * 1024))),
            &blocks,
            |b, blocks| b.iter(|| segmenter.encode(black_box(blocks))),
        );
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let segmenter = Segmenter::default();
    let size = 10 * 1024 * 1024;
    let segments = segmenter
        .encode(&split_default_blocks(&generate_data(size)))
        .unwrap();

    let mut group = c.benchmark_group("segmenter_decode");
    group.throughput(Throughput::Bytes(size as u64));

    // First K shares need no reconstruction; the parity-heavy subset does.
    for (label, chosen) in [
        ("data_only", vec![1u8, 2, 3, 4, 5, 6, 7, 8]),
        ("with_parity", vec![3u8, 4, 5, 6, 7, 8, 9, 10]),
    ] {
        let subset: Vec<(u8, Vec<Bytes>)> = chosen
            .iter()
            .map(|&n| (n, segments[n as usize - 1].clone()))
            .collect();
        group.bench_with_input(BenchmarkId::new("decode", label), &subset, |b, subset| {
            b.iter(|| segmenter.decode(black_box(subset), 0))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
