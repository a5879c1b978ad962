// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Benchmarks for the queue.
//!
//! Measures:
//! - Write latency by payload size, with the device lock and single-writer
//! - Compressed write latency
//! - Sequential read throughput

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use fmq_queue::{CompressionMethod, OpenMode, OpenPosition, Queue, QueueBuilder, SeekPosition};
use tempfile::TempDir;

/// Payload sizes to benchmark (bytes)
const MESSAGE_SIZES: &[usize] = &[64, 256, 1024, 4096, 16384];

/// Messages per read-throughput iteration
const READ_BATCH: usize = 1_000;

fn create_queue(temp_dir: &TempDir, single_writer: bool) -> Queue {
    QueueBuilder::new(temp_dir.path().join("bench").display().to_string())
        .num_slots(4096)
        .buf_size(64 * 1024 * 1024)
        .single_writer(single_writer)
        .build()
        .expect("Failed to create queue")
}

fn generate_message(size: usize) -> Vec<u8> {
    (0..size).map(|i| u8::try_from(i % 251).unwrap_or(0)).collect()
}

// =============================================================================
// Write Latency
// =============================================================================

fn bench_write_latency(c: &mut Criterion) {
    for (name, single_writer) in [("write_latency_locked", false), ("write_latency_single", true)] {
        let mut group = c.benchmark_group(name);
        for &size in MESSAGE_SIZES {
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
                let temp_dir = TempDir::new().unwrap();
                let mut queue = create_queue(&temp_dir, single_writer);
                let msg = generate_message(size);

                b.iter(|| {
                    queue.write(1, 0, black_box(&msg)).unwrap();
                });
            });
        }
        group.finish();
    }
}

/// Repetitive payloads, the case compression is meant for.
fn bench_compressed_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_compressed");
    let payload: Vec<u8> = b"gate 0042 dbz 17.5 ".iter().copied().cycle().take(16384).collect();

    for method in [CompressionMethod::Gzip, CompressionMethod::Zstd] {
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_function(BenchmarkId::from_parameter(format!("{method:?}")), |b| {
            let temp_dir = TempDir::new().unwrap();
            let mut queue = QueueBuilder::new(temp_dir.path().join("bench").display().to_string())
                .num_slots(4096)
                .buf_size(16 * 1024 * 1024)
                .compress(method)
                .build()
                .unwrap();

            b.iter(|| {
                queue.write(1, 0, black_box(&payload)).unwrap();
            });
        });
    }
    group.finish();
}

// =============================================================================
// Read Throughput
// =============================================================================

fn bench_sequential_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_sequential");
    group.sample_size(20);

    for &size in &[64, 1024, 4096] {
        group.throughput(Throughput::Elements(READ_BATCH as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let mut queue = create_queue(&temp_dir, true);
            let msg = generate_message(size);
            for _ in 0..READ_BATCH {
                queue.write(1, 0, &msg).unwrap();
            }
            let mut reader = QueueBuilder::new(queue.path())
                .mode(OpenMode::ReadOnly)
                .position(OpenPosition::Start)
                .build()
                .unwrap();

            b.iter(|| {
                reader.seek(SeekPosition::Start).unwrap();
                let mut count = 0;
                while let Some(msg) = reader.read_msg(None, None).unwrap() {
                    black_box(msg);
                    count += 1;
                }
                assert_eq!(count, READ_BATCH);
            });
        });
    }
    group.finish();
}

// =============================================================================
// Criterion Configuration
// =============================================================================

criterion_group!(
    benches,
    bench_write_latency,
    bench_compressed_write,
    bench_sequential_read,
);

criterion_main!(benches);
