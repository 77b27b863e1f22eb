use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::algorithms::{AlgorithmState, ContextualAlgorithmState, VariantStats};

/// One feature's state plus the counters last written to storage.
pub(crate) struct Slot<S> {
    pub(crate) state: RwLock<S>,
    /// Per-variant totals as of the last successful flush. Only the flush
    /// path touches this, and only while holding the store's flush lock.
    pub(crate) persisted: Mutex<HashMap<String, VariantStats>>,
}

impl<S: Counters> Slot<S> {
    /// Wrap a freshly loaded state; whatever it already counts is persisted.
    pub(crate) fn loaded(state: S) -> Self {
        let persisted = state.counters();
        Self {
            state: RwLock::new(state),
            persisted: Mutex::new(persisted),
        }
    }

    /// Wrap a state that has never been written to storage.
    pub(crate) fn fresh(state: S) -> Self {
        Self {
            state: RwLock::new(state),
            persisted: Mutex::new(HashMap::new()),
        }
    }

    /// Algorithm slug and per-variant deltas since the last flush, each
    /// paired with the total it was computed from.
    pub(crate) fn pending(&self) -> (&'static str, Vec<PendingDelta>) {
        let (slug, current) = {
            let state = self.state.read();
            (state.slug(), state.counters())
        };

        let persisted = self.persisted.lock();
        let zero = VariantStats::default();
        let mut pending: Vec<PendingDelta> = current
            .into_iter()
            .filter_map(|(variant, total)| {
                let delta = total.delta_since(persisted.get(&variant).unwrap_or(&zero));
                (!delta.is_zero()).then_some(PendingDelta {
                    variant,
                    delta,
                    total,
                })
            })
            .collect();
        pending.sort_by(|a, b| a.variant.cmp(&b.variant));
        (slug, pending)
    }

    /// Advance the baseline after the delta was stored.
    pub(crate) fn mark_persisted(&self, variant: &str, total: VariantStats) {
        self.persisted.lock().insert(variant.to_string(), total);
    }

    /// Move the unflushed counters of a retired slot into this one.
    ///
    /// The baseline is left alone, so the carried counters go out with the
    /// next flush. Nothing moves across an algorithm change. Returns the
    /// number of variants carried.
    pub(crate) fn carry_from(&self, retired: &Slot<S>) -> usize {
        let (slug, pending) = retired.pending();
        if pending.is_empty() {
            return 0;
        }

        let mut state = self.state.write();
        if state.slug() != slug {
            return 0;
        }
        for delta in &pending {
            state.carry(&delta.variant, &delta.delta);
        }
        pending.len()
    }
}

pub(crate) struct PendingDelta {
    pub(crate) variant: String,
    pub(crate) delta: VariantStats,
    pub(crate) total: VariantStats,
}

/// States whose per-variant counters can be persisted.
pub(crate) trait Counters {
    fn slug(&self) -> &'static str;
    fn counters(&self) -> HashMap<String, VariantStats>;
    fn restore(&mut self, variant: &str, stats: &VariantStats);
    /// Add counters on top of the current ones.
    fn carry(&mut self, variant: &str, delta: &VariantStats);
}

impl Counters for AlgorithmState {
    fn slug(&self) -> &'static str {
        self.algorithm.slug()
    }

    fn counters(&self) -> HashMap<String, VariantStats> {
        self.stats.clone()
    }

    fn restore(&mut self, variant: &str, stats: &VariantStats) {
        *self.stats_mut(variant) = stats.clone();
    }

    fn carry(&mut self, variant: &str, delta: &VariantStats) {
        self.stats_mut(variant).accumulate(delta);
    }
}

/// Contextual arms persist their pull and reward counters. The `A`/`b`
/// matrices live in memory only and restart at identity after a reload.
impl Counters for ContextualAlgorithmState {
    fn slug(&self) -> &'static str {
        self.algorithm.slug()
    }

    fn counters(&self) -> HashMap<String, VariantStats> {
        self.arms
            .iter()
            .map(|(variant, arm)| {
                let stats = VariantStats {
                    evaluations: arm.pulls,
                    successes: arm.successes,
                    failures: arm.failures,
                    metric_sum: Decimal::from_f64(arm.total_reward).unwrap_or_default(),
                };
                (variant.clone(), stats)
            })
            .collect()
    }

    fn restore(&mut self, variant: &str, stats: &VariantStats) {
        let arm = self.arm_mut(variant);
        arm.pulls = stats.evaluations;
        arm.successes = stats.successes;
        arm.failures = stats.failures;
        arm.total_reward = stats.metric_sum.to_f64().unwrap_or(0.0);
    }

    fn carry(&mut self, variant: &str, delta: &VariantStats) {
        let arm = self.arm_mut(variant);
        arm.pulls += delta.evaluations;
        arm.successes += delta.successes;
        arm.failures += delta.failures;
        arm.total_reward += delta.metric_sum.to_f64().unwrap_or(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{AlgorithmType, FeedbackEvent, Settings};

    #[test]
    fn test_pending_tracks_baseline() {
        let slot = Slot::fresh(AlgorithmState::new(
            AlgorithmType::EpsilonGreedy,
            vec!["a".into(), "b".into()],
            Settings::new(),
        ));
        slot.state
            .write()
            .stats_mut("a")
            .apply(FeedbackEvent::Evaluation, None);

        let (slug, pending) = slot.pending();
        assert_eq!(slug, "epsilon-greedy");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].variant, "a");
        assert_eq!(pending[0].delta.evaluations, 1);

        slot.mark_persisted("a", pending[0].total.clone());
        assert!(slot.pending().1.is_empty());

        slot.state
            .write()
            .stats_mut("a")
            .apply(FeedbackEvent::Success, None);
        let (_, pending) = slot.pending();
        assert_eq!(pending[0].delta.successes, 1);
        assert_eq!(pending[0].delta.evaluations, 0);
    }

    #[test]
    fn test_loaded_state_has_nothing_pending() {
        let mut state =
            AlgorithmState::new(AlgorithmType::Ucb1, vec!["a".into()], Settings::new());
        state.stats_mut("a").evaluations = 40;
        let slot = Slot::loaded(state);
        assert!(slot.pending().1.is_empty());
    }

    #[test]
    fn test_carry_moves_unflushed_counters() {
        let retired = Slot::fresh(AlgorithmState::new(
            AlgorithmType::Ucb1,
            vec!["a".into()],
            Settings::new(),
        ));
        retired.mark_persisted(
            "a",
            VariantStats {
                successes: 2,
                ..Default::default()
            },
        );
        retired.state.write().stats_mut("a").successes = 5;

        let mut reloaded =
            AlgorithmState::new(AlgorithmType::Ucb1, vec!["a".into()], Settings::new());
        reloaded.stats_mut("a").successes = 2;
        let slot = Slot::loaded(reloaded);

        assert_eq!(slot.carry_from(&retired), 1);
        assert_eq!(slot.state.read().stats["a"].successes, 5);
        let (_, pending) = slot.pending();
        assert_eq!(pending[0].delta.successes, 3);
    }

    #[test]
    fn test_carry_skips_algorithm_change() {
        let retired = Slot::fresh(AlgorithmState::new(
            AlgorithmType::Ucb1,
            vec!["a".into()],
            Settings::new(),
        ));
        retired
            .state
            .write()
            .stats_mut("a")
            .apply(FeedbackEvent::Success, None);

        let slot = Slot::fresh(AlgorithmState::new(
            AlgorithmType::ThompsonSampling,
            vec!["a".into()],
            Settings::new(),
        ));
        assert_eq!(slot.carry_from(&retired), 0);
        assert!(slot.pending().1.is_empty());
    }

    #[test]
    fn test_contextual_counters_round_trip() {
        let mut state =
            ContextualAlgorithmState::new(
                AlgorithmType::LinUcb,
                2,
                vec!["x".into()],
                Settings::new(),
            );
        crate::algorithms::contextual::contextual_update(&mut state, "x", &[1.0, 0.0], 0.5);
        let counters = state.counters();
        assert_eq!(counters["x"].evaluations, 1);
        assert_eq!(counters["x"].successes, 1);

        let mut restored =
            ContextualAlgorithmState::new(AlgorithmType::LinUcb, 2, vec![], Settings::new());
        restored.restore("x", &counters["x"]);
        assert_eq!(restored.arms["x"].pulls, 1);
        assert!((restored.arms["x"].total_reward - 0.5).abs() < 1e-12);
    }
}
