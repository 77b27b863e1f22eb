//! Context-free bandits: epsilon-greedy, UCB1 and Beta-Bernoulli Thompson
//! sampling.
//!
//! Each policy reads per-variant [`VariantStats`] and returns the selected
//! variant key. Selection counts as an impression: the chosen variant's
//! `evaluations` is incremented before returning. Variants are scanned in
//! their configured order, so ties resolve to the first variant listed.
//!
//! [`VariantStats`]: super::types::VariantStats

use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Beta, Distribution};

use super::types::{AlgorithmState, AlgorithmType};

/// Default exploration probability for epsilon-greedy.
pub const DEFAULT_EPSILON: f64 = 0.1;
/// Default UCB1 exploration coefficient.
pub const DEFAULT_UCB_C: f64 = std::f64::consts::SQRT_2;

/// Select a variant with whichever bandit policy `state` is configured for.
///
/// Returns `None` for optimizer or contextual algorithms and for states with
/// no variants.
pub fn select_variant<R: Rng + ?Sized>(
    state: &mut AlgorithmState,
    rng: &mut R,
) -> Option<String> {
    match state.algorithm {
        AlgorithmType::EpsilonGreedy => epsilon_greedy(state, rng),
        AlgorithmType::Ucb1 => ucb1(state, rng),
        AlgorithmType::ThompsonSampling => thompson_sampling(state, rng),
        _ => None,
    }
}

fn random_variant<R: Rng + ?Sized>(state: &AlgorithmState, rng: &mut R) -> Option<String> {
    state.variants.choose(rng).cloned()
}

fn record_impression(state: &mut AlgorithmState, variant: &str) {
    state.stats_mut(variant).evaluations += 1;
}

/// Epsilon-greedy.
///
/// With probability `epsilon` (setting, default 0.1) a uniformly random
/// variant is served. Otherwise the variant with the highest
/// successes/evaluations wins; if every rate is zero the choice is random.
pub fn epsilon_greedy<R: Rng + ?Sized>(
    state: &mut AlgorithmState,
    rng: &mut R,
) -> Option<String> {
    if state.variants.is_empty() {
        return None;
    }

    let epsilon = state.settings.get_f64("epsilon", DEFAULT_EPSILON);
    let chosen: Option<String> = if rng.gen::<f64>() < epsilon {
        random_variant(state, rng)
    } else {
        let mut best: Option<(&String, f64)> = None;
        for variant in &state.variants {
            let rate = state
                .stats
                .get(variant)
                .map(|s| s.success_rate())
                .unwrap_or(0.0);
            if best.map_or(true, |(_, b)| rate > b) {
                best = Some((variant, rate));
            }
        }
        match best {
            Some((variant, rate)) if rate > 0.0 => Some(variant.clone()),
            _ => random_variant(state, rng),
        }
    };
    let chosen = chosen?;

    record_impression(state, &chosen);
    Some(chosen)
}

/// UCB1.
///
/// Variants never evaluated are served first, in order. After that the
/// score is `mean + c * sqrt(ln(total) / n)` with `c` from the `c` setting
/// (default sqrt(2)).
pub fn ucb1<R: Rng + ?Sized>(state: &mut AlgorithmState, rng: &mut R) -> Option<String> {
    if state.variants.is_empty() {
        return None;
    }

    let unexplored = state.variants.iter().find(|v| {
        state
            .stats
            .get(v.as_str())
            .map_or(true, |s| s.evaluations == 0)
    });

    let chosen = if let Some(v) = unexplored {
        v.clone()
    } else {
        let c = state.settings.get_f64("c", DEFAULT_UCB_C);
        let ln_total = (state.total_evaluations().max(1) as f64).ln();

        let mut best: Option<(&String, f64)> = None;
        for variant in &state.variants {
            let Some(stats) = state.stats.get(variant) else {
                continue;
            };
            let n = stats.evaluations as f64;
            let score = stats.success_rate() + c * (ln_total / n).sqrt();
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((variant, score));
            }
        }
        match best {
            Some((v, _)) => v.clone(),
            None => random_variant(state, rng)?,
        }
    };

    record_impression(state, &chosen);
    Some(chosen)
}

/// Beta-Bernoulli Thompson sampling.
///
/// Each variant draws from `Beta(prior_alpha + successes, prior_beta +
/// failures)` (priors default to 1). The highest draw wins; exact ties are
/// broken uniformly at random.
pub fn thompson_sampling<R: Rng + ?Sized>(
    state: &mut AlgorithmState,
    rng: &mut R,
) -> Option<String> {
    if state.variants.is_empty() {
        return None;
    }

    let prior_alpha = positive_or(state.settings.get_f64("prior_alpha", 1.0), 1.0);
    let prior_beta = positive_or(state.settings.get_f64("prior_beta", 1.0), 1.0);

    let mut best_draw = f64::NEG_INFINITY;
    let mut leaders: Vec<&String> = Vec::new();
    for variant in &state.variants {
        let (s, f) = state
            .stats
            .get(variant)
            .map_or((0, 0), |st| (st.successes, st.failures));
        let draw = Beta::new(prior_alpha + s as f64, prior_beta + f as f64)
            .map(|d| d.sample(rng))
            .unwrap_or(0.5);
        if draw > best_draw {
            best_draw = draw;
            leaders.clear();
            leaders.push(variant);
        } else if draw == best_draw {
            leaders.push(variant);
        }
    }

    let chosen = leaders.choose(rng).map(|v| (*v).clone())?;
    record_impression(state, &chosen);
    Some(chosen)
}

fn positive_or(v: f64, default: f64) -> f64 {
    if v > 0.0 {
        v
    } else {
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::types::{Settings, VariantStats};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn state_with(
        algorithm: AlgorithmType,
        stats: &[(&str, u64, u64)],
        settings: Settings,
    ) -> AlgorithmState {
        let variants = stats.iter().map(|(v, _, _)| v.to_string()).collect();
        let mut state = AlgorithmState::new(algorithm, variants, settings);
        for (v, successes, evaluations) in stats {
            let s = state.stats_mut(v);
            s.successes = *successes;
            s.evaluations = *evaluations;
            s.failures = evaluations - successes;
        }
        state
    }

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    #[test]
    fn test_epsilon_zero_picks_best_rate() {
        let settings: Settings = [("epsilon", 0.0)].into_iter().collect();
        let mut state = state_with(
            AlgorithmType::EpsilonGreedy,
            &[("A", 30, 100), ("B", 70, 100), ("C", 50, 100)],
            settings,
        );
        let mut rng = rng();
        for _ in 0..10 {
            assert_eq!(epsilon_greedy(&mut state, &mut rng).as_deref(), Some("B"));
        }
        // Each selection was recorded as an impression.
        assert_eq!(state.stats["B"].evaluations, 110);
    }

    #[test]
    fn test_epsilon_zero_tie_goes_to_first() {
        let settings: Settings = [("epsilon", 0.0)].into_iter().collect();
        let mut state = state_with(
            AlgorithmType::EpsilonGreedy,
            &[("A", 5, 10), ("B", 50, 100)],
            settings,
        );
        let mut rng = rng();
        assert_eq!(epsilon_greedy(&mut state, &mut rng).as_deref(), Some("A"));
    }

    #[test]
    fn test_epsilon_greedy_all_zero_is_random() {
        let settings: Settings = [("epsilon", 0.0)].into_iter().collect();
        let mut state = state_with(
            AlgorithmType::EpsilonGreedy,
            &[("A", 0, 0), ("B", 0, 0), ("C", 0, 0)],
            settings,
        );
        let mut rng = rng();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(epsilon_greedy(&mut state, &mut rng).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_epsilon_one_is_uniform() {
        let settings: Settings = [("epsilon", 1.0)].into_iter().collect();
        let mut state = state_with(
            AlgorithmType::EpsilonGreedy,
            &[("A", 90, 100), ("B", 1, 100), ("C", 1, 100), ("D", 1, 100)],
            settings,
        );
        let mut rng = rng();
        let trials = 20_000;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..trials {
            *counts
                .entry(epsilon_greedy(&mut state, &mut rng).unwrap())
                .or_default() += 1;
        }
        for v in ["A", "B", "C", "D"] {
            let freq = counts[v] as f64 / trials as f64;
            assert!((freq - 0.25).abs() < 0.02, "{v}: {freq}");
        }
    }

    #[test]
    fn test_empty_variants() {
        let mut rng = rng();
        for algorithm in [
            AlgorithmType::EpsilonGreedy,
            AlgorithmType::Ucb1,
            AlgorithmType::ThompsonSampling,
        ] {
            let mut state = AlgorithmState::new(algorithm, vec![], Settings::new());
            assert!(select_variant(&mut state, &mut rng).is_none());
        }
    }

    #[test]
    fn test_ucb1_cold_start_sweeps_every_variant() {
        let mut state = AlgorithmState::new(
            AlgorithmType::Ucb1,
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
            Settings::new(),
        );
        let mut rng = rng();
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(ucb1(&mut state, &mut rng).unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_ucb1_prefers_unexplored_over_strong() {
        let mut state = state_with(
            AlgorithmType::Ucb1,
            &[("A", 99, 100), ("B", 0, 0)],
            Settings::new(),
        );
        let mut rng = rng();
        assert_eq!(ucb1(&mut state, &mut rng).as_deref(), Some("B"));
    }

    #[test]
    fn test_ucb1_exploits_after_warmup() {
        let mut state = state_with(
            AlgorithmType::Ucb1,
            &[("A", 900, 1000), ("B", 100, 1000)],
            Settings::new(),
        );
        let mut rng = rng();
        assert_eq!(ucb1(&mut state, &mut rng).as_deref(), Some("A"));
    }

    #[test]
    fn test_thompson_favors_strong_variant() {
        let mut state = state_with(
            AlgorithmType::ThompsonSampling,
            &[("A", 900, 1000), ("B", 100, 1000)],
            Settings::new(),
        );
        let mut rng = rng();
        let wins = (0..200)
            .filter(|_| thompson_sampling(&mut state, &mut rng).as_deref() == Some("A"))
            .count();
        assert!(wins > 190, "A won {wins}/200");
    }

    #[test]
    fn test_thompson_invalid_priors_fall_back() {
        let settings: Settings = [("prior_alpha", -3.0), ("prior_beta", 0.0)]
            .into_iter()
            .collect();
        let mut state = state_with(AlgorithmType::ThompsonSampling, &[("A", 0, 0)], settings);
        let mut rng = rng();
        assert_eq!(thompson_sampling(&mut state, &mut rng).as_deref(), Some("A"));
        assert_eq!(state.stats["A"], VariantStats { evaluations: 1, ..Default::default() });
    }

    #[test]
    fn test_select_variant_rejects_optimizers() {
        let mut state = AlgorithmState::new(
            AlgorithmType::HillClimbing,
            vec!["a".into()],
            Settings::new(),
        );
        let mut rng = rng();
        assert!(select_variant(&mut state, &mut rng).is_none());
    }
}
