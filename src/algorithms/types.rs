//! Core types shared by the built-in algorithms.
//!
//! - `StateKey`: identifies one controlled (feature, environment) pair
//! - `AlgorithmType`: which built-in policy drives a feature
//! - `VariantStats`: per-variant counters
//! - `Settings`: hyperparameters and optimizer working variables
//! - `AlgorithmState` / `ContextualAlgorithmState`: per-feature model state

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::linalg::identity;

/// Identity of one controlled feature instance.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct StateKey {
    pub feature_key: String,
    pub environment_key: String,
}

impl StateKey {
    pub fn new(feature_key: impl Into<String>, environment_key: impl Into<String>) -> Self {
        Self {
            feature_key: feature_key.into(),
            environment_key: environment_key.into(),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.feature_key, self.environment_key)
    }
}

/// Built-in algorithms, identified in storage by their slug.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlgorithmType {
    EpsilonGreedy,
    #[serde(rename = "ucb")]
    Ucb1,
    ThompsonSampling,
    #[serde(rename = "linucb")]
    LinUcb,
    ContextualEpsilonGreedy,
    ContextualThompsonSampling,
    HillClimbing,
    SimulatedAnnealing,
    PidController,
    #[serde(rename = "cem")]
    CrossEntropy,
    BayesianOptimization,
}

/// Slug used in algorithm configs for operator-supplied sandboxed algorithms.
pub const CUSTOM_SLUG: &str = "custom";

impl AlgorithmType {
    pub const ALL: [AlgorithmType; 11] = [
        AlgorithmType::EpsilonGreedy,
        AlgorithmType::Ucb1,
        AlgorithmType::ThompsonSampling,
        AlgorithmType::LinUcb,
        AlgorithmType::ContextualEpsilonGreedy,
        AlgorithmType::ContextualThompsonSampling,
        AlgorithmType::HillClimbing,
        AlgorithmType::SimulatedAnnealing,
        AlgorithmType::PidController,
        AlgorithmType::CrossEntropy,
        AlgorithmType::BayesianOptimization,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            AlgorithmType::EpsilonGreedy => "epsilon-greedy",
            AlgorithmType::Ucb1 => "ucb",
            AlgorithmType::ThompsonSampling => "thompson-sampling",
            AlgorithmType::LinUcb => "linucb",
            AlgorithmType::ContextualEpsilonGreedy => "contextual-epsilon-greedy",
            AlgorithmType::ContextualThompsonSampling => "contextual-thompson-sampling",
            AlgorithmType::HillClimbing => "hill-climbing",
            AlgorithmType::SimulatedAnnealing => "simulated-annealing",
            AlgorithmType::PidController => "pid-controller",
            AlgorithmType::CrossEntropy => "cem",
            AlgorithmType::BayesianOptimization => "bayesian-optimization",
        }
    }

    /// Optimizers emit a scalar value instead of selecting a variant.
    pub fn is_optimizer(self) -> bool {
        matches!(
            self,
            AlgorithmType::HillClimbing
                | AlgorithmType::SimulatedAnnealing
                | AlgorithmType::PidController
                | AlgorithmType::CrossEntropy
                | AlgorithmType::BayesianOptimization
        )
    }

    /// Contextual algorithms require a request context to decide.
    pub fn is_contextual(self) -> bool {
        matches!(
            self,
            AlgorithmType::LinUcb
                | AlgorithmType::ContextualEpsilonGreedy
                | AlgorithmType::ContextualThompsonSampling
        )
    }

    /// Population-based optimizers update from a batch of samples.
    pub fn is_population_based(self) -> bool {
        matches!(
            self,
            AlgorithmType::CrossEntropy | AlgorithmType::BayesianOptimization
        )
    }
}

impl fmt::Display for AlgorithmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for AlgorithmType {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlgorithmType::ALL
            .into_iter()
            .find(|t| t.slug() == s)
            .ok_or_else(|| crate::error::EngineError::UnknownAlgorithm(s.to_string()))
    }
}

/// Per-variant counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantStats {
    pub evaluations: u64,
    pub successes: u64,
    pub failures: u64,
    pub metric_sum: Decimal,
}

impl VariantStats {
    /// Success rate, or 0 when never evaluated.
    pub fn success_rate(&self) -> f64 {
        if self.evaluations == 0 {
            0.0
        } else {
            self.successes as f64 / self.evaluations as f64
        }
    }

    /// Counters accumulated since `base`. Saturates instead of wrapping.
    pub fn delta_since(&self, base: &VariantStats) -> VariantStats {
        VariantStats {
            evaluations: self.evaluations.saturating_sub(base.evaluations),
            successes: self.successes.saturating_sub(base.successes),
            failures: self.failures.saturating_sub(base.failures),
            metric_sum: self.metric_sum - base.metric_sum,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.evaluations == 0
            && self.successes == 0
            && self.failures == 0
            && self.metric_sum.is_zero()
    }

    /// Add another set of counters onto these.
    pub fn accumulate(&mut self, other: &VariantStats) {
        self.evaluations += other.evaluations;
        self.successes += other.successes;
        self.failures += other.failures;
        self.metric_sum += other.metric_sum;
    }
}

/// Kind of observed outcome carried by a feedback call.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackEvent {
    Evaluation,
    Success,
    Failure,
    /// Counted as a failure.
    Error,
}

impl FeedbackEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackEvent::Evaluation => "evaluation",
            FeedbackEvent::Success => "success",
            FeedbackEvent::Failure => "failure",
            FeedbackEvent::Error => "error",
        }
    }
}

impl VariantStats {
    /// Apply exactly one feedback event.
    pub fn apply(&mut self, event: FeedbackEvent, metric: Option<Decimal>) {
        match event {
            FeedbackEvent::Evaluation => self.evaluations += 1,
            FeedbackEvent::Success => {
                self.successes += 1;
                if let Some(m) = metric {
                    self.metric_sum += m;
                }
            }
            FeedbackEvent::Failure | FeedbackEvent::Error => self.failures += 1,
        }
    }
}

/// Free-form algorithm settings: hyperparameters and, for optimizers,
/// working variables that persist between calls.
///
/// Values are decimals as stored; algorithms read them as `f64` with a
/// default so a missing or unrepresentable entry never errors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(HashMap<String, Decimal>);

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a setting as `f64`, falling back to `default`.
    pub fn get_f64(&self, name: &str, default: f64) -> f64 {
        self.0
            .get(name)
            .and_then(|d| d.to_f64())
            .filter(|v| v.is_finite())
            .unwrap_or(default)
    }

    /// Read a non-negative integer setting, falling back to `default`.
    pub fn get_usize(&self, name: &str, default: usize) -> usize {
        self.0
            .get(name)
            .and_then(|d| d.to_usize())
            .unwrap_or(default)
    }

    /// Store an `f64`. Non-finite values are ignored.
    pub fn set_f64(&mut self, name: &str, value: f64) {
        if let Some(d) = Decimal::from_f64(value) {
            self.0.insert(name.to_string(), d);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Decimal> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Decimal) {
        self.0.insert(name.into(), value);
    }

    /// Lossy `f64` view, used when handing settings across the sandbox.
    pub fn to_f64_map(&self) -> HashMap<String, f64> {
        self.0
            .iter()
            .filter_map(|(k, v)| v.to_f64().map(|f| (k.clone(), f)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        let mut settings = Settings::new();
        for (k, v) in iter {
            let k: String = k.into();
            settings.set_f64(&k, v);
        }
        settings
    }
}

/// One (value, reward) observation for population-based optimizers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSample {
    pub value: f64,
    pub reward: f64,
}

/// Feedback for an optimizer: the value that was served and the metric it
/// produced.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerFeedback {
    pub value: f64,
    pub metric: f64,
}

/// Model state for one context-free bandit or optimizer feature.
#[derive(Clone, Debug)]
pub struct AlgorithmState {
    pub algorithm: AlgorithmType,
    pub enabled: bool,
    pub is_optimizer: bool,
    /// Variant keys in their configured order. Iteration over this list is
    /// what makes tie-breaking deterministic.
    pub variants: Vec<String>,
    pub stats: HashMap<String, VariantStats>,
    pub settings: Settings,
    pub current_value: f64,
    pub iteration: u64,
    pub last_metric: f64,
    /// Buffered observations for CEM and noisy-greedy.
    pub samples: Vec<OptimizerSample>,
}

impl AlgorithmState {
    pub fn new(algorithm: AlgorithmType, variants: Vec<String>, settings: Settings) -> Self {
        let stats = variants
            .iter()
            .map(|v| (v.clone(), VariantStats::default()))
            .collect();
        let current_value = settings.get_f64("initial_value", 0.0);
        Self {
            algorithm,
            enabled: true,
            is_optimizer: algorithm.is_optimizer(),
            variants,
            stats,
            settings,
            current_value,
            iteration: 0,
            last_metric: 0.0,
            samples: Vec::new(),
        }
    }

    /// Mutable stats for `variant`, creating the entry if unseen.
    ///
    /// A variant outside the configured list gets counters but is never
    /// served.
    pub fn stats_mut(&mut self, variant: &str) -> &mut VariantStats {
        self.stats.entry(variant.to_string()).or_default()
    }

    /// Total evaluations across all variants.
    pub fn total_evaluations(&self) -> u64 {
        self.stats.values().map(|s| s.evaluations).sum()
    }
}

/// Ridge-regression accumulator for one variant of a contextual feature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextualVariantState {
    /// `d x d` row-major, starts at identity, receives only `x xᵀ`.
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    pub pulls: u64,
    pub total_reward: f64,
    pub successes: u64,
    pub failures: u64,
}

impl ContextualVariantState {
    pub fn new(d: usize) -> Self {
        Self {
            a: identity(d),
            b: vec![0.0; d],
            pulls: 0,
            total_reward: 0.0,
            successes: 0,
            failures: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.b.len()
    }
}

/// Model state for one contextual feature.
#[derive(Clone, Debug)]
pub struct ContextualAlgorithmState {
    pub algorithm: AlgorithmType,
    pub enabled: bool,
    pub dimension: usize,
    pub variants: Vec<String>,
    pub arms: HashMap<String, ContextualVariantState>,
    pub settings: Settings,
}

impl ContextualAlgorithmState {
    pub fn new(
        algorithm: AlgorithmType,
        dimension: usize,
        variants: Vec<String>,
        settings: Settings,
    ) -> Self {
        let arms = variants
            .iter()
            .map(|v| (v.clone(), ContextualVariantState::new(dimension)))
            .collect();
        Self {
            algorithm,
            enabled: true,
            dimension,
            variants,
            arms,
            settings,
        }
    }

    /// Mutable arm for `variant`, created at identity if unseen. Arms of
    /// unlisted variants learn but are not selectable.
    pub fn arm_mut(&mut self, variant: &str) -> &mut ContextualVariantState {
        let d = self.dimension;
        self.arms
            .entry(variant.to_string())
            .or_insert_with(|| ContextualVariantState::new(d))
    }
}
