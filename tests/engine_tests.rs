//! End-to-end tests of the engine over the in-memory repository.

use std::sync::Arc;

use flagbandit::repository::memory::MemoryRepository;
use flagbandit::repository::StatsRecord;
use flagbandit::{
    AlgorithmType, Context, DecisionEngine, EngineBuilder, EngineError, FeedbackEvent,
    OptimizerFeedback, Settings, StateKey, VariantStats,
};
use serde_json::json;

fn key(feature: &str) -> StateKey {
    StateKey::new(feature, "production")
}

fn engine(repo: &Arc<MemoryRepository>) -> DecisionEngine {
    EngineBuilder::new()
        .prefix("e2e")
        .flush_interval_ms(60_000)
        .repository(repo.clone())
        .build()
        .unwrap()
}

#[test]
fn test_epsilon_greedy_serves_the_winner() {
    let repo = Arc::new(MemoryRepository::new());
    let settings: Settings = [("epsilon", 0.0)].into_iter().collect();
    repo.add_feature(key("checkout"), "epsilon-greedy", &["A", "B"], settings);

    let engine = engine(&repo);
    engine.start().unwrap();

    for _ in 0..10 {
        engine.handle_feedback(&key("checkout"), "A", FeedbackEvent::Evaluation, None);
        engine.handle_feedback(&key("checkout"), "B", FeedbackEvent::Evaluation, None);
        engine.handle_feedback(&key("checkout"), "B", FeedbackEvent::Success, None);
    }
    engine.handle_feedback(&key("checkout"), "A", FeedbackEvent::Failure, None);

    for _ in 0..5 {
        assert_eq!(engine.evaluate_feature(&key("checkout")).as_deref(), Some("B"));
    }
    engine.stop();
}

#[test]
fn test_learning_survives_a_restart() {
    let repo = Arc::new(MemoryRepository::new());
    let settings: Settings = [("epsilon", 0.0)].into_iter().collect();
    repo.add_feature(key("banner"), "epsilon-greedy", &["A", "B"], settings);

    let first = engine(&repo);
    first.start().unwrap();
    for _ in 0..4 {
        first.handle_feedback(&key("banner"), "B", FeedbackEvent::Evaluation, None);
        first.handle_feedback(&key("banner"), "B", FeedbackEvent::Success, None);
    }
    first.stop();
    drop(first);

    let second = engine(&repo);
    let summary = second.start().unwrap();
    assert_eq!(summary.restored_stats, 1);
    let state = second.snapshot(&key("banner")).unwrap();
    assert_eq!(state.stats["B"].successes, 4);
    assert_eq!(second.evaluate_feature(&key("banner")).as_deref(), Some("B"));
    second.stop();

    // The second engine only wrote its own impression.
    let total = repo.stats_for(&key("banner"), "epsilon-greedy", "B").unwrap();
    assert_eq!(total.evaluations, 5);
    assert_eq!(total.successes, 4);
}

#[test]
fn test_failed_flush_is_retried_without_loss() {
    let repo = Arc::new(MemoryRepository::new());
    repo.add_feature(key("price"), "ucb", &["A"], Settings::new());
    let engine = engine(&repo);
    engine.start().unwrap();

    engine.handle_feedback(&key("price"), "A", FeedbackEvent::Success, None);
    repo.set_fail_writes(true);
    assert!(matches!(engine.flush(), Err(EngineError::Repository(_))));

    engine.handle_feedback(&key("price"), "A", FeedbackEvent::Failure, None);
    repo.set_fail_writes(false);
    assert_eq!(engine.flush().unwrap(), 1);

    let total = repo.stats_for(&key("price"), "ucb", "A").unwrap();
    assert_eq!(
        total,
        VariantStats {
            evaluations: 0,
            successes: 1,
            failures: 1,
            metric_sum: Default::default(),
        }
    );
    engine.stop();
    assert_eq!(repo.stats_log().len(), 1);
}

#[test]
fn test_stats_of_a_previous_algorithm_are_ignored() {
    let repo = Arc::new(MemoryRepository::new());
    repo.add_feature(key("hero"), "thompson-sampling", &["A", "B"], Settings::new());
    repo.put_stats(StatsRecord {
        key: key("hero"),
        algorithm_slug: "ucb".into(),
        variant: "A".into(),
        stats: VariantStats {
            evaluations: 50,
            successes: 50,
            ..Default::default()
        },
    });

    let engine = engine(&repo);
    let summary = engine.start().unwrap();
    assert_eq!(summary.restored_stats, 0);
    assert_eq!(engine.snapshot(&key("hero")).unwrap().total_evaluations(), 0);
}

#[test]
fn test_optimizer_and_contextual_features() {
    let repo = Arc::new(MemoryRepository::new());
    let engine = engine(&repo);
    engine.start().unwrap();

    let settings: Settings = [("target", 10.0), ("kp", 0.5), ("initial_value", 1.0)]
        .into_iter()
        .collect();
    engine
        .register_algorithm(key("rate"), AlgorithmType::PidController, vec![], settings)
        .unwrap();
    assert_eq!(engine.evaluate_optimizer(&key("rate")), Some(1.0));
    assert!(engine.handle_optimizer_feedback(
        &key("rate"),
        OptimizerFeedback {
            value: 1.0,
            metric: 6.0,
        }
    ));
    let next = engine.evaluate_optimizer(&key("rate")).unwrap();
    assert!(next > 1.0, "moved toward the target, got {next}");

    let settings: Settings = [("dimension", 8.0), ("epsilon", 0.0)].into_iter().collect();
    engine
        .register_contextual(
            key("layout"),
            AlgorithmType::ContextualEpsilonGreedy,
            vec!["grid".into(), "list".into()],
            settings,
        )
        .unwrap();
    let mobile: Context = [("device".to_string(), json!("mobile"))].into_iter().collect();
    for _ in 0..10 {
        engine.handle_contextual_feedback(&key("layout"), "list", &mobile, 1.0);
        engine.handle_contextual_feedback(&key("layout"), "grid", &mobile, -1.0);
    }
    assert_eq!(
        engine.evaluate_contextual(&key("layout"), &mobile).as_deref(),
        Some("list")
    );
    // A bandit key is not an optimizer and vice versa.
    assert!(engine.evaluate_feature(&key("rate")).is_none());
    assert!(engine.evaluate_optimizer(&key("layout")).is_none());
}
