//! Performance benchmarks for complete transfers over a simulated channel

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use skiff_core::{BufferHandler, MemoryReader, MemoryWriter, SharedBuffer, Status, TransferConfig, shared};
use skiff_integration_tests::{SimulatedLink, fast_config, pattern};
use std::io::Write;
use tempfile::NamedTempFile;

/// Benchmark reads of in-memory resources
fn bench_simulated_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulated_read");

    for size in [
        64 * 1024,   // 64 KB
        1024 * 1024, // 1 MB
    ] {
        let data = pattern(size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| {
                let mut link = SimulatedLink::new(fast_config());
                link.add_handler(shared(BufferHandler::read_only(1, data.clone())));
                let buffer = SharedBuffer::new();
                let (_, outcome) = link.read(1, 1, MemoryWriter::new(buffer.clone()), fast_config(), 0);
                assert_eq!(link.run_until_complete(&outcome, usize::MAX), Some(Status::Ok));
                black_box(buffer.len())
            });
        });
    }

    group.finish();
}

/// Benchmark the effect of the receive window on writes
fn bench_window_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_sizes");
    let data = pattern(256 * 1024);
    group.throughput(Throughput::Bytes(data.len() as u64));

    for window in [4 * 1024u32, 16 * 1024, 64 * 1024] {
        let config = TransferConfig {
            max_window_size_bytes: window,
            ..fast_config()
        };
        group.bench_with_input(BenchmarkId::from_parameter(window), &config, |b, config| {
            b.iter(|| {
                let mut link = SimulatedLink::new(*config);
                let buffer = SharedBuffer::new();
                link.add_handler(shared(BufferHandler::write_only(1, buffer.clone())));
                let (_, outcome) = link.write(1, 1, MemoryReader::new(data.clone()), *config, 0);
                assert_eq!(link.run_until_complete(&outcome, usize::MAX), Some(Status::Ok));
                black_box(buffer.len())
            });
        });
    }

    group.finish();
}

/// Benchmark file hashing used to verify transfers
fn bench_file_hashing(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_hashing");
    let size = 8 * 1024 * 1024;
    group.throughput(Throughput::Bytes(size as u64));

    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(&pattern(size)).unwrap();
    temp_file.flush().unwrap();
    let path = temp_file.path().to_path_buf();

    group.bench_function("hash_file", |b| {
        b.iter(|| black_box(skiff_files::hash_file(&path).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_simulated_read, bench_window_sizes, bench_file_hashing);
criterion_main!(benches);
