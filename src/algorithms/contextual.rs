//! Linear contextual bandits: LinUCB, contextual epsilon-greedy and
//! contextual Thompson sampling.
//!
//! Every variant keeps a ridge-regression accumulator `(A, b)`; the reward
//! estimate for a context vector `x` is `xᵀθ` with `θ = A⁻¹b`. `A⁻¹` is never
//! formed explicitly: `θ` and `A⁻¹x` come from [`solve_linear`].
//!
//! [`solve_linear`]: crate::linalg::solve_linear

use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use super::types::{AlgorithmType, ContextualAlgorithmState, ContextualVariantState};
use crate::linalg::{dot_product, solve_linear};

/// Default LinUCB exploration width.
pub const DEFAULT_ALPHA: f64 = 1.0;
/// Default prior variance for contextual Thompson sampling.
pub const DEFAULT_PRIOR_VARIANCE: f64 = 1.0;
/// Keeps the diagonal posterior scale finite.
const VARIANCE_EPSILON: f64 = 1e-6;

/// Select a variant for context vector `x` with the configured policy.
///
/// Returns `None` for non-contextual algorithms, empty variant sets, or a
/// vector whose length does not match the state's dimension.
pub fn select_contextual<R: Rng + ?Sized>(
    state: &ContextualAlgorithmState,
    x: &[f64],
    rng: &mut R,
) -> Option<String> {
    if state.variants.is_empty() || x.len() != state.dimension {
        return None;
    }
    match state.algorithm {
        AlgorithmType::LinUcb => linucb(state, x),
        AlgorithmType::ContextualEpsilonGreedy => contextual_epsilon_greedy(state, x, rng),
        AlgorithmType::ContextualThompsonSampling => contextual_thompson_sampling(state, x, rng),
        _ => None,
    }
}

/// Scan variants in order and return the one with the highest score.
fn argmax_by<F>(state: &ContextualAlgorithmState, mut score: F) -> Option<String>
where
    F: FnMut(&ContextualVariantState) -> f64,
{
    let fresh = ContextualVariantState::new(state.dimension);
    let mut best: Option<(&String, f64)> = None;
    for variant in &state.variants {
        let arm = state.arms.get(variant).unwrap_or(&fresh);
        let s = score(arm);
        if !s.is_finite() {
            continue;
        }
        if best.map_or(true, |(_, b)| s > b) {
            best = Some((variant, s));
        }
    }
    best.map(|(v, _)| v.clone())
}

/// `θ = A⁻¹b` for one arm.
pub fn theta(arm: &ContextualVariantState) -> Vec<f64> {
    solve_linear(&arm.a, &arm.b, arm.dimension())
}

/// LinUCB: `argmax xᵀθ + alpha * sqrt(xᵀA⁻¹x)`.
pub fn linucb(state: &ContextualAlgorithmState, x: &[f64]) -> Option<String> {
    let alpha = state.settings.get_f64("alpha", DEFAULT_ALPHA);
    argmax_by(state, |arm| {
        let d = arm.dimension();
        let expected = dot_product(x, &theta(arm));
        let a_inv_x = solve_linear(&arm.a, x, d);
        let bonus = alpha * dot_product(x, &a_inv_x).max(0.0).sqrt();
        expected + bonus
    })
}

/// Epsilon-greedy over the linear reward estimate.
pub fn contextual_epsilon_greedy<R: Rng + ?Sized>(
    state: &ContextualAlgorithmState,
    x: &[f64],
    rng: &mut R,
) -> Option<String> {
    let epsilon = state.settings.get_f64("epsilon", super::bandit::DEFAULT_EPSILON);
    if rng.gen::<f64>() < epsilon {
        return state.variants.choose(rng).cloned();
    }
    argmax_by(state, |arm| dot_product(x, &theta(arm)))
}

/// Thompson sampling with a diagonal posterior approximation.
///
/// Each coordinate of `θ` is perturbed independently by
/// `N(0, 1) * sqrt(prior_variance / (A_ii + ε))`. Off-diagonal covariance is
/// ignored.
pub fn contextual_thompson_sampling<R: Rng + ?Sized>(
    state: &ContextualAlgorithmState,
    x: &[f64],
    rng: &mut R,
) -> Option<String> {
    let prior_variance = state
        .settings
        .get_f64("prior_variance", DEFAULT_PRIOR_VARIANCE)
        .max(0.0);
    argmax_by(state, |arm| {
        let d = arm.dimension();
        let mut sampled = theta(arm);
        for (i, t) in sampled.iter_mut().enumerate() {
            let z: f64 = StandardNormal.sample(rng);
            let scale = (prior_variance / (arm.a[i * d + i] + VARIANCE_EPSILON)).sqrt();
            *t += z * scale;
        }
        dot_product(x, &sampled)
    })
}

/// Rank-1 ridge update: `A += x xᵀ`, `b += reward * x`.
///
/// Also counts the pull, accumulates reward, and classifies it as a success
/// (`reward > 0`) or failure. A vector of the wrong length is ignored.
pub fn update_arm(arm: &mut ContextualVariantState, x: &[f64], reward: f64) -> bool {
    let d = arm.dimension();
    if x.len() != d || !reward.is_finite() {
        return false;
    }
    for i in 0..d {
        let xi = x[i];
        for j in 0..d {
            arm.a[i * d + j] += xi * x[j];
        }
        arm.b[i] += reward * xi;
    }
    arm.pulls += 1;
    arm.total_reward += reward;
    if reward > 0.0 {
        arm.successes += 1;
    } else {
        arm.failures += 1;
    }
    true
}

/// Apply a reward for `variant`, creating its arm on first sight.
pub fn contextual_update(
    state: &mut ContextualAlgorithmState,
    variant: &str,
    x: &[f64],
    reward: f64,
) -> bool {
    if x.len() != state.dimension {
        return false;
    }
    update_arm(state.arm_mut(variant), x, reward)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::types::Settings;
    use crate::linalg::identity;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn state(algorithm: AlgorithmType, d: usize, settings: Settings) -> ContextualAlgorithmState {
        ContextualAlgorithmState::new(
            algorithm,
            d,
            vec!["red".into(), "blue".into()],
            settings,
        )
    }

    fn unit(d: usize, i: usize) -> Vec<f64> {
        let mut x = vec![0.0; d];
        x[i] = 1.0;
        x
    }

    #[test]
    fn test_update_is_symmetric_rank_one() {
        let mut arm = ContextualVariantState::new(3);
        let before = arm.a.clone();
        let x = [0.2, -0.5, 0.9];
        assert!(update_arm(&mut arm, &x, 1.5));
        for i in 0..3 {
            for j in 0..3 {
                let expected = before[i * 3 + j] + x[i] * x[j];
                assert!((arm.a[i * 3 + j] - expected).abs() < 1e-12);
                assert_eq!(arm.a[i * 3 + j], arm.a[j * 3 + i]);
            }
            assert!((arm.b[i] - 1.5 * x[i]).abs() < 1e-12);
        }
        assert_eq!(arm.pulls, 1);
        assert_eq!(arm.successes, 1);
    }

    #[test]
    fn test_non_positive_reward_is_failure() {
        let mut arm = ContextualVariantState::new(2);
        update_arm(&mut arm, &[1.0, 0.0], 0.0);
        update_arm(&mut arm, &[1.0, 0.0], -1.0);
        assert_eq!(arm.failures, 2);
        assert_eq!(arm.successes, 0);
        assert_eq!(arm.total_reward, -1.0);
    }

    #[test]
    fn test_wrong_dimension_is_ignored() {
        let mut s = state(AlgorithmType::LinUcb, 3, Settings::new());
        assert!(!contextual_update(&mut s, "red", &[1.0, 0.0], 1.0));
        assert_eq!(s.arms["red"].a, identity(3));
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(select_contextual(&s, &[1.0], &mut rng).is_none());
    }

    #[test]
    fn test_linucb_learns_context_dependence() {
        let settings: Settings = [("alpha", 0.1)].into_iter().collect();
        let mut s = state(AlgorithmType::LinUcb, 2, settings);
        // red pays in context 0, blue pays in context 1.
        for _ in 0..50 {
            contextual_update(&mut s, "red", &unit(2, 0), 1.0);
            contextual_update(&mut s, "red", &unit(2, 1), 0.0);
            contextual_update(&mut s, "blue", &unit(2, 0), 0.0);
            contextual_update(&mut s, "blue", &unit(2, 1), 1.0);
        }
        assert_eq!(linucb(&s, &unit(2, 0)).as_deref(), Some("red"));
        assert_eq!(linucb(&s, &unit(2, 1)).as_deref(), Some("blue"));
    }

    #[test]
    fn test_linucb_cold_start_ties_to_first() {
        let s = state(AlgorithmType::LinUcb, 2, Settings::new());
        assert_eq!(linucb(&s, &unit(2, 0)).as_deref(), Some("red"));
    }

    #[test]
    fn test_linucb_bonus_favors_uncertain_arm() {
        let mut s = state(AlgorithmType::LinUcb, 2, Settings::new());
        // red is well explored with a mediocre reward; blue is untouched.
        for _ in 0..100 {
            contextual_update(&mut s, "red", &unit(2, 0), 0.3);
        }
        assert_eq!(linucb(&s, &unit(2, 0)).as_deref(), Some("blue"));
    }

    #[test]
    fn test_contextual_epsilon_greedy_exploits() {
        let settings: Settings = [("epsilon", 0.0)].into_iter().collect();
        let mut s = state(AlgorithmType::ContextualEpsilonGreedy, 2, settings);
        for _ in 0..20 {
            contextual_update(&mut s, "blue", &unit(2, 1), 1.0);
        }
        let mut rng = SmallRng::seed_from_u64(3);
        for _ in 0..20 {
            assert_eq!(
                select_contextual(&s, &unit(2, 1), &mut rng).as_deref(),
                Some("blue")
            );
        }
    }

    #[test]
    fn test_contextual_thompson_concentrates_with_data() {
        let mut s = state(AlgorithmType::ContextualThompsonSampling, 2, Settings::new());
        for _ in 0..500 {
            contextual_update(&mut s, "red", &unit(2, 0), 1.0);
            contextual_update(&mut s, "blue", &unit(2, 0), -1.0);
        }
        let mut rng = SmallRng::seed_from_u64(11);
        let red = (0..100)
            .filter(|_| {
                select_contextual(&s, &unit(2, 0), &mut rng).as_deref() == Some("red")
            })
            .count();
        assert!(red > 95, "red chosen {red}/100");
    }

    #[test]
    fn test_unlisted_variant_learns_but_is_not_served() {
        let mut s = state(AlgorithmType::LinUcb, 2, Settings::new());
        assert!(contextual_update(&mut s, "green", &unit(2, 0), 1.0));
        assert!(!s.variants.contains(&"green".to_string()));
        assert_eq!(s.arms["green"].pulls, 1);

        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..50 {
            assert_ne!(select_contextual(&s, &unit(2, 0), &mut rng).as_deref(), Some("green"));
        }
    }
}
