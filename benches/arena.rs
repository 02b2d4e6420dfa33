// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Arena allocation benchmark.
//!
//! Measures `RbufPool::rmsg_new`/`rmsg_alloc` throughput for the payload
//! sizes a receive thread actually sees: small control submessages,
//! typical sample sizes, and fragment-sized chunks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rtps_runtime::RbufPool;
use std::hint::black_box as bb;

fn bench_rmsg_new_by_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_rmsg_new");
    for size in [64usize, 1024, 4096, 16384] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let pool = RbufPool::new(1 << 20, 1 << 18);
            b.iter(|| {
                let (msg, ptr) = pool.rmsg_new(size);
                bb(ptr);
                bb(msg);
            });
        });
    }
    group.finish();
}

fn bench_rmsg_alloc_many_chunks(c: &mut Criterion) {
    c.bench_function("arena_rmsg_alloc_16_chunks", |b| {
        let pool = RbufPool::new(1 << 20, 1 << 18);
        b.iter(|| {
            let (msg, _) = pool.rmsg_new(256);
            for _ in 0..15 {
                let ptr = pool.rmsg_alloc(&msg, 256);
                bb(ptr);
            }
            msg.set_size(16 * 256);
            msg.commit();
        });
    });
}

criterion_group!(benches, bench_rmsg_new_by_size, bench_rmsg_alloc_many_chunks);
criterion_main!(benches);
