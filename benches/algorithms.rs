//! Benchmarks for the built-in algorithms.
//!
//! Run with: cargo bench --bench algorithms
//!
//! These benchmarks measure:
//! - Variant selection cost per bandit policy and arm count
//! - Context encoding and the linear solve behind contextual policies
//! - Optimizer proposal and feedback cost

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flagbandit::algorithms::{bandit, contextual, optimizer};
use flagbandit::encoding::encode_context;
use flagbandit::linalg::solve_linear;
use flagbandit::{
    AlgorithmState, AlgorithmType, Context, ContextualAlgorithmState, OptimizerFeedback, Settings,
};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde_json::json;

/// Bandit state with `arms` variants that have all been tried.
fn warm_state(algorithm: AlgorithmType, arms: usize) -> AlgorithmState {
    let variants: Vec<String> = (0..arms).map(|i| format!("v{i}")).collect();
    let mut state = AlgorithmState::new(algorithm, variants.clone(), Settings::new());
    for (i, variant) in variants.iter().enumerate() {
        let stats = state.stats_mut(variant);
        stats.evaluations = 1_000;
        stats.successes = 10 * (i as u64 + 1);
        stats.failures = stats.evaluations - stats.successes;
    }
    state
}

fn request_context() -> Context {
    [
        ("country".to_string(), json!("NL")),
        ("device".to_string(), json!("mobile")),
        ("plan".to_string(), json!("pro")),
        ("returning".to_string(), json!(true)),
        ("cart_items".to_string(), json!(3)),
    ]
    .into_iter()
    .collect()
}

// =============================================================================
// Bandits
// =============================================================================

fn bench_select_variant(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_variant");

    for algorithm in [
        AlgorithmType::EpsilonGreedy,
        AlgorithmType::Ucb1,
        AlgorithmType::ThompsonSampling,
    ] {
        for arms in [2usize, 8, 32] {
            group.throughput(Throughput::Elements(1));
            group.bench_with_input(
                BenchmarkId::new(algorithm.slug(), arms),
                &arms,
                |b, &arms| {
                    let mut state = warm_state(algorithm, arms);
                    let mut rng = SmallRng::seed_from_u64(7);
                    b.iter(|| black_box(bandit::select_variant(&mut state, &mut rng)));
                },
            );
        }
    }

    group.finish();
}

// =============================================================================
// Contextual
// =============================================================================

fn bench_encode_context(c: &mut Criterion) {
    let ctx = request_context();
    let mut group = c.benchmark_group("encode_context");
    for d in [8usize, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(d), &d, |b, &d| {
            b.iter(|| black_box(encode_context(black_box(&ctx), d)));
        });
    }
    group.finish();
}

fn bench_solve_linear(c: &mut Criterion) {
    let mut group = c.benchmark_group("solve_linear");
    for d in [4usize, 16, 32] {
        // Diagonally dominant, so always solvable
        let a: Vec<f64> = (0..d * d)
            .map(|i| if i / d == i % d { d as f64 + 1.0 } else { 0.5 })
            .collect();
        let rhs: Vec<f64> = (0..d).map(|i| i as f64).collect();
        group.bench_with_input(BenchmarkId::from_parameter(d), &d, |b, &d| {
            b.iter(|| black_box(solve_linear(black_box(&a), black_box(&rhs), d)));
        });
    }
    group.finish();
}

fn bench_select_contextual(c: &mut Criterion) {
    let ctx = request_context();
    let mut group = c.benchmark_group("select_contextual");

    for algorithm in [
        AlgorithmType::LinUcb,
        AlgorithmType::ContextualEpsilonGreedy,
        AlgorithmType::ContextualThompsonSampling,
    ] {
        for d in [8usize, 16] {
            let mut state = ContextualAlgorithmState::new(
                algorithm,
                d,
                vec!["a".into(), "b".into(), "c".into()],
                Settings::new(),
            );
            let x = encode_context(&ctx, d);
            for (i, variant) in ["a", "b", "c"].iter().enumerate() {
                for _ in 0..20 {
                    contextual::contextual_update(&mut state, variant, &x, i as f64 * 0.5);
                }
            }

            group.bench_with_input(BenchmarkId::new(algorithm.slug(), d), &d, |b, _| {
                let mut rng = SmallRng::seed_from_u64(11);
                b.iter(|| black_box(contextual::select_contextual(&state, &x, &mut rng)));
            });
        }
    }

    group.finish();
}

// =============================================================================
// Optimizers
// =============================================================================

fn bench_optimizer_feedback(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimizer_feedback");

    for algorithm in [
        AlgorithmType::HillClimbing,
        AlgorithmType::SimulatedAnnealing,
        AlgorithmType::PidController,
        AlgorithmType::CrossEntropy,
        AlgorithmType::BayesianOptimization,
    ] {
        group.bench_function(algorithm.slug(), |b| {
            let mut state = AlgorithmState::new(algorithm, vec![], Settings::new());
            let mut rng = SmallRng::seed_from_u64(3);
            let mut metric = 0.0;
            b.iter(|| {
                let value = optimizer::propose_value(&state, &mut rng);
                metric = (metric + 0.1) % 5.0;
                black_box(optimizer::apply_feedback(
                    &mut state,
                    OptimizerFeedback { value, metric },
                    &mut rng,
                ))
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_select_variant,
    bench_encode_context,
    bench_solve_linear,
    bench_select_contextual,
    bench_optimizer_feedback,
);
criterion_main!(benches);
