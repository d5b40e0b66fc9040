//! Benchmarks for the segment write and read paths
//!
//! Run with: cargo bench --package cumulus-storage --bench storage

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cumulus_core::ShareChecksum;
use cumulus_storage::{FileFinal, NewSegment, NodeStorage, SequenceWrite, StorageConfig};
use tempfile::TempDir;

fn generate_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

fn new_segment(unified_id: u64) -> NewSegment {
    NewSegment {
        collection_id: 1,
        key: "bench/object".to_string(),
        unified_id,
        timestamp: Utc::now(),
        conjoined_part: 0,
        segment_num: 1,
        source_node_name: "bench".to_string(),
        handoff_node_name: None,
    }
}

/// One single-sequence segment per iteration, synced like the data writer does
fn bench_archive_entire(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let storage = NodeStorage::open(StorageConfig::new(temp_dir.path())).unwrap();
    let mut writer = storage.writer();

    let mut group = c.benchmark_group("archive_entire");
    for size in [4 * 1024, 64 * 1024, 1024 * 1024] {
        let data = generate_data(size);
        let checksum = ShareChecksum::of(&data);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("share", size), &data, |b, data| {
            let mut unified_id = 0u64;
            b.iter(|| {
                unified_id += 1;
                let segment = new_segment(unified_id);
                let key = segment.segment_key();
                writer.start_new_segment(&segment).unwrap();
                writer
                    .store_sequence(
                        &key,
                        SequenceWrite {
                            sequence_num: 0,
                            zfec_padding_size: 0,
                            checksum,
                            data: black_box(data),
                        },
                    )
                    .unwrap();
                writer.finish_new_segment(&key, FileFinal::default()).unwrap();
                writer.sync().unwrap();
            })
        });
    }
    group.finish();
    writer.close().unwrap();
}

fn bench_read_sequence(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let storage = NodeStorage::open(StorageConfig::new(temp_dir.path())).unwrap();
    let mut writer = storage.writer();
    let data = generate_data(256 * 1024);

    let segment = new_segment(1);
    let key = segment.segment_key();
    writer.start_new_segment(&segment).unwrap();
    writer
        .store_sequence(
            &key,
            SequenceWrite {
                sequence_num: 0,
                zfec_padding_size: 0,
                checksum: ShareChecksum::of(&data),
                data: &data,
            },
        )
        .unwrap();
    writer.finish_new_segment(&key, FileFinal::default()).unwrap();
    writer.sync().unwrap();

    let reader = storage.reader();
    let row = reader.final_segment(&key, None).unwrap().unwrap();
    let sequence = reader.sequences_for(&row).unwrap().remove(0);

    let mut group = c.benchmark_group("read_sequence");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("256KB", |b| b.iter(|| reader.read_sequence(black_box(&sequence)).unwrap()));
    group.finish();
}

criterion_group!(benches, bench_archive_entire, bench_read_sequence);
criterion_main!(benches);
