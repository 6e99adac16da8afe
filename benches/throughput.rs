//! Benchmark for DriftMap vs a mutex-wrapped standard HashMap.
//!
//! Measures single-threaded operation cost and multi-threaded throughput
//! where per-bin locking is expected to pay off.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use driftmap::DriftMap;
use std::collections::HashMap;
use std::hint::black_box;
use std::sync::Mutex;
use std::thread;

// =============================================================================
// insert Benchmark
// =============================================================================

fn benchmark_insert(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("insert");

    for size in [1_000, 10_000, 100_000] {
        group.bench_with_input(
            BenchmarkId::new("DriftMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let map = DriftMap::new();
                    let guard = map.guard();
                    for index in 0..size {
                        map.insert(black_box(index), black_box(index * 2), &guard);
                    }
                    drop(guard);
                    black_box(map)
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("Mutex<HashMap>", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let map = Mutex::new(HashMap::new());
                    for index in 0..size {
                        map.lock()
                            .unwrap()
                            .insert(black_box(index), black_box(index * 2));
                    }
                    black_box(map)
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// get Benchmark
// =============================================================================

fn benchmark_get(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("get");

    for size in [1_000, 100_000] {
        let map = DriftMap::new();
        {
            let guard = map.guard();
            for index in 0..size {
                map.insert(index, index * 2, &guard);
            }
        }

        group.bench_with_input(BenchmarkId::new("DriftMap", size), &size, |bencher, &size| {
            let guard = map.guard();
            bencher.iter(|| {
                for index in 0..size {
                    black_box(map.get(black_box(&index), &guard));
                }
            });
        });
    }

    group.finish();
}

// =============================================================================
// Multi-threaded throughput Benchmark
// =============================================================================

fn benchmark_contended_writes(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("contended_writes");
    group.sample_size(10);

    for threads in [2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("DriftMap", threads),
            &threads,
            |bencher, &threads| {
                bencher.iter(|| {
                    let map: DriftMap<u64, u64> = DriftMap::new();
                    thread::scope(|s| {
                        for t in 0..threads {
                            let map = &map;
                            s.spawn(move || {
                                let guard = map.guard();
                                for index in 0..10_000u64 {
                                    map.insert(t * 100_000 + index, index, &guard);
                                }
                            });
                        }
                    });
                    black_box(map)
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("Mutex<HashMap>", threads),
            &threads,
            |bencher, &threads| {
                bencher.iter(|| {
                    let map: Mutex<HashMap<u64, u64>> = Mutex::new(HashMap::new());
                    thread::scope(|s| {
                        for t in 0..threads {
                            let map = &map;
                            s.spawn(move || {
                                for index in 0..10_000u64 {
                                    map.lock().unwrap().insert(t * 100_000 + index, index);
                                }
                            });
                        }
                    });
                    black_box(map)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_insert,
    benchmark_get,
    benchmark_contended_writes
);
criterion_main!(benches);
