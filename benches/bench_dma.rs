// FPGA Streaming DMA (mSGDMA) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Throughput benchmarks for the pooled-resource and transfer-queue hot
//! paths: single get/release cycles, batched acquire-then-release, and
//! queue enqueue/dequeue round trips.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use msgdma_rust::{BufferPinner, ChannelType, DmaResult, ResourcePool, SimDevice, TransferQueue};

const BATCH_SIZES: &[usize] = &[1, 8, 64];

fn pool() -> ResourcePool {
    let sim = Arc::new(SimDevice::new(&[ChannelType::Mm], 0));
    ResourcePool::new(sim as Arc<dyn BufferPinner>, 4096)
}

/// Get/release cycles against the semaphore, mutex, and buffer pools.
fn bench_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool");

    for &batch in BATCH_SIZES {
        group.throughput(Throughput::Elements(batch as u64));

        group.bench_with_input(BenchmarkId::new("semaphore", batch), &batch, |b, &n| {
            let pool = pool();
            let mut items = Vec::with_capacity(n);
            b.iter(|| {
                for _ in 0..n {
                    items.push(pool.get_semaphore(0).unwrap());
                }
                for item in items.drain(..) {
                    pool.release_semaphore(&item);
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("mutex", batch), &batch, |b, &n| {
            let pool = pool();
            let mut items = Vec::with_capacity(n);
            b.iter(|| {
                for _ in 0..n {
                    items.push(pool.get_mutex().unwrap());
                }
                for item in items.drain(..) {
                    pool.release_mutex(&item);
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("buffer", batch), &batch, |b, &n| {
            let pool = pool();
            let mut items = Vec::with_capacity(n);
            b.iter(|| {
                for _ in 0..n {
                    items.push(pool.get_buffer().unwrap());
                }
                for item in items.drain(..) {
                    pool.release_buffer(&item);
                }
            });
        });
    }

    group.finish();
}

/// Enqueue/dequeue round trips through the bounded transfer queue.
fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    for &batch in BATCH_SIZES {
        group.throughput(Throughput::Elements(batch as u64));

        group.bench_with_input(BenchmarkId::new("round_trip", batch), &batch, |b, &n| {
            let q: TransferQueue<usize> = TransferQueue::with_capacity(1024);
            b.iter(|| -> DmaResult<()> {
                for i in 0..n {
                    q.try_enqueue(i)?;
                }
                for _ in 0..n {
                    q.dequeue()?;
                }
                Ok(())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pool, bench_queue);
criterion_main!(benches);
