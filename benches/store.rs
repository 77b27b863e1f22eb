//! Benchmarks for the state store hot paths.
//!
//! Run with: cargo bench --bench store
//!
//! These benchmarks measure:
//! - evaluate + feedback round trips through the store
//! - Contention when several threads hit the same feature
//! - Delta flush cost as the number of features grows

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flagbandit::repository::memory::MemoryRepository;
use flagbandit::{EngineMetrics, FeedbackEvent, Settings, StateKey, StateStore, StoreRepositories};

fn create_store(repo: &Arc<MemoryRepository>) -> StateStore {
    StateStore::new(
        StoreRepositories::from_shared(repo.clone()),
        None,
        EngineMetrics::with_prefix("store_bench"),
        16,
    )
}

fn seeded_store(features: usize, algorithm: &str) -> (Arc<MemoryRepository>, StateStore) {
    let repo = Arc::new(MemoryRepository::new());
    for i in 0..features {
        repo.add_feature(
            StateKey::new(format!("feature-{i}"), "production"),
            algorithm,
            &["control", "treatment-a", "treatment-b"],
            Settings::new(),
        );
    }
    let store = create_store(&repo);
    store.load_state().expect("load should succeed");
    (repo, store)
}

// =============================================================================
// Round trips
// =============================================================================

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");
    group.throughput(Throughput::Elements(1));

    for algorithm in ["epsilon-greedy", "ucb", "thompson-sampling"] {
        let (_repo, store) = seeded_store(1, algorithm);
        let key = StateKey::new("feature-0", "production");
        group.bench_function(algorithm, |b| {
            b.iter(|| {
                if let Some(variant) = store.evaluate_feature(black_box(&key)) {
                    store.handle_feedback(&key, &variant, FeedbackEvent::Success, None);
                }
            });
        });
    }

    group.bench_function("unknown_feature", |b| {
        let (_repo, store) = seeded_store(1, "ucb");
        let key = StateKey::new("missing", "production");
        b.iter(|| black_box(store.evaluate_feature(black_box(&key))));
    });

    group.finish();
}

// =============================================================================
// Contention
// =============================================================================

fn bench_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("contention");
    const OPS_PER_THREAD: usize = 1_000;

    for threads in [1usize, 2, 4, 8] {
        group.throughput(Throughput::Elements((threads * OPS_PER_THREAD) as u64));
        group.bench_with_input(
            BenchmarkId::new("same_feature", threads),
            &threads,
            |b, &threads| {
                let (_repo, store) = seeded_store(1, "ucb");
                let store = Arc::new(store);
                b.iter(|| {
                    let workers: Vec<_> = (0..threads)
                        .map(|_| {
                            let store = store.clone();
                            thread::spawn(move || {
                                let key = StateKey::new("feature-0", "production");
                                for _ in 0..OPS_PER_THREAD {
                                    black_box(store.evaluate_feature(&key));
                                }
                            })
                        })
                        .collect();
                    for worker in workers {
                        worker.join().expect("worker panicked");
                    }
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// Flush
// =============================================================================

fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush_all");
    group.sample_size(20);

    for features in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(features as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(features),
            &features,
            |b, &features| {
                let (_repo, store) = seeded_store(features, "epsilon-greedy");
                let keys: Vec<StateKey> = (0..features)
                    .map(|i| StateKey::new(format!("feature-{i}"), "production"))
                    .collect();
                b.iter(|| {
                    for key in &keys {
                        store.handle_feedback(key, "control", FeedbackEvent::Evaluation, None);
                    }
                    black_box(store.flush_all().expect("flush should succeed"))
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_round_trip, bench_contention, bench_flush);
criterion_main!(benches);
