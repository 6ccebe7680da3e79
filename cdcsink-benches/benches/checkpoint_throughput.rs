// Copyright 2025 cdcsink Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Checkpoint Coordinator Benchmarks
//!
//! Measures watermark tracking when completions arrive in order, in reverse
//! and interleaved across partitions, plus commit rounds.
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench --package cdcsink-benches --bench checkpoint_throughput
//! ```

use cdcsink_core::checkpoint::CheckpointCoordinator;
use cdcsink_core::stream::MemoryChangeStream;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Benchmark: Register then flush sequences in delivery order
fn bench_in_order_completion(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("in_order_completion");

    for count in [100u64, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*count));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.to_async(&runtime).iter(|| async move {
                let coordinator = CheckpointCoordinator::new(0);
                for sequence in 1..=count {
                    coordinator.register(0, sequence).await;
                }
                for sequence in 1..=count {
                    black_box(coordinator.mark_flushed(0, sequence).await);
                }
            });
        });
    }

    group.finish();
}

/// Benchmark: Completions in reverse order; the watermark moves only at the end
fn bench_reverse_completion(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("reverse_completion");

    for count in [100u64, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*count));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.to_async(&runtime).iter(|| async move {
                let coordinator = CheckpointCoordinator::new(0);
                for sequence in 1..=count {
                    coordinator.register(0, sequence).await;
                }
                for sequence in (1..=count).rev() {
                    coordinator.mark_flushed(0, sequence).await;
                }
                black_box(coordinator.watermark(0).await);
            });
        });
    }

    group.finish();
}

/// Benchmark: Many partitions with interleaved completions and commit rounds
fn bench_partitioned_commit_rounds(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("partitioned_commit_rounds");
    group.sample_size(20);

    let per_partition = 200u64;
    for partitions in [4u16, 64, 1024].iter() {
        group.throughput(Throughput::Elements(
            u64::from(*partitions) * per_partition,
        ));
        group.bench_with_input(
            BenchmarkId::from_parameter(partitions),
            partitions,
            |b, &partitions| {
                b.to_async(&runtime).iter(|| async move {
                    let coordinator = CheckpointCoordinator::new(0);
                    let stream = MemoryChangeStream::ready();

                    for sequence in 1..=per_partition {
                        for partition in 0..partitions {
                            coordinator.register(partition, sequence).await;
                        }
                    }
                    for sequence in 1..=per_partition {
                        for partition in 0..partitions {
                            coordinator.mark_flushed(partition, sequence).await;
                        }
                        if sequence % 50 == 0 {
                            black_box(coordinator.commit(&stream).await);
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_in_order_completion,
    bench_reverse_completion,
    bench_partitioned_commit_rounds,
);

criterion_main!(benches);
