//! Scalar optimizers: hill climbing, simulated annealing, PID control, the
//! cross-entropy method and a noisy-greedy stand-in for Bayesian
//! optimization.
//!
//! Optimizers keep their working variables (direction, temperature, integral
//! term, previous error, sampling width) in `AlgorithmState::settings`, so
//! they survive a flush/load cycle like any other setting.

use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};

use super::types::{AlgorithmState, AlgorithmType, OptimizerFeedback, OptimizerSample};

/// Lower bound on the annealing temperature.
pub const DEFAULT_MIN_TEMPERATURE: f64 = 1e-3;
/// Samples collected per CEM / noisy-greedy update.
pub const DEFAULT_POPULATION_SIZE: usize = 10;

/// Value to serve for the next request.
///
/// Local-search optimizers serve their current point. CEM draws from its
/// sampling distribution `N(current, std_dev)`; noisy-greedy jitters the
/// current point by `U(-exploration_width, exploration_width)`.
pub fn propose_value<R: Rng + ?Sized>(state: &AlgorithmState, rng: &mut R) -> f64 {
    match state.algorithm {
        AlgorithmType::CrossEntropy => {
            let std_dev = state.settings.get_f64("std_dev", 1.0).max(0.0);
            Normal::new(state.current_value, std_dev)
                .map(|d| d.sample(rng))
                .unwrap_or(state.current_value)
        }
        AlgorithmType::BayesianOptimization => {
            let width = state.settings.get_f64("exploration_width", 1.0).abs();
            if width > 0.0 {
                state.current_value + rng.gen_range(-width..width)
            } else {
                state.current_value
            }
        }
        _ => state.current_value,
    }
}

/// Feed one observation to the optimizer and return the updated value.
///
/// Hill climbing, annealing and PID update on every call using `metric`.
/// CEM and noisy-greedy buffer `(value, metric)` pairs and update once
/// `population_size` samples have arrived. Non-finite metrics are dropped.
pub fn apply_feedback<R: Rng + ?Sized>(
    state: &mut AlgorithmState,
    feedback: OptimizerFeedback,
    rng: &mut R,
) -> f64 {
    if !feedback.metric.is_finite() {
        return state.current_value;
    }
    match state.algorithm {
        AlgorithmType::HillClimbing => hill_climbing(state, feedback.metric),
        AlgorithmType::SimulatedAnnealing => simulated_annealing(state, feedback.metric, rng),
        AlgorithmType::PidController => pid_control(state, feedback.metric),
        AlgorithmType::CrossEntropy | AlgorithmType::BayesianOptimization => {
            if !feedback.value.is_finite() {
                return state.current_value;
            }
            state.samples.push(OptimizerSample {
                value: feedback.value,
                reward: feedback.metric,
            });
            let population = state
                .settings
                .get_usize("population_size", DEFAULT_POPULATION_SIZE)
                .max(1);
            if state.samples.len() < population {
                return state.current_value;
            }
            let samples = std::mem::take(&mut state.samples);
            if state.algorithm == AlgorithmType::CrossEntropy {
                cross_entropy(state, &samples)
            } else {
                noisy_greedy(state, &samples, rng)
            }
        }
        _ => state.current_value,
    }
}

/// Hill climbing.
///
/// Moves `step_size * direction` when the reward beats `last_metric`,
/// otherwise reverses `direction` and stays put.
pub fn hill_climbing(state: &mut AlgorithmState, reward: f64) -> f64 {
    let step = state.settings.get_f64("step_size", 0.1);
    let mut direction = state.settings.get_f64("direction", 1.0);
    if direction == 0.0 {
        direction = 1.0;
    }

    if reward > state.last_metric {
        state.current_value += step * direction;
        state.last_metric = reward;
    } else {
        direction = -direction;
    }

    state.settings.set_f64("direction", direction);
    state.iteration += 1;
    state.current_value
}

/// Simulated annealing with the Metropolis acceptance rule.
///
/// The candidate `current + U(-step, step)` is accepted when the reward
/// improved on `last_metric`, or with probability `exp(Δ / temperature)`.
/// The temperature cools by `cooling_rate` on every call, floored at
/// `min_temperature`.
pub fn simulated_annealing<R: Rng + ?Sized>(
    state: &mut AlgorithmState,
    reward: f64,
    rng: &mut R,
) -> f64 {
    let step = state.settings.get_f64("step_size", 1.0).abs();
    let temperature = state.settings.get_f64("temperature", 100.0);
    let cooling = state.settings.get_f64("cooling_rate", 0.95);
    let min_temperature = state
        .settings
        .get_f64("min_temperature", DEFAULT_MIN_TEMPERATURE)
        .max(f64::MIN_POSITIVE);

    let candidate = if step > 0.0 {
        state.current_value + rng.gen_range(-step..step)
    } else {
        state.current_value
    };

    let delta = reward - state.last_metric;
    let accept =
        delta > 0.0 || rng.gen::<f64>() < (delta / temperature.max(min_temperature)).exp();
    if accept {
        state.current_value = candidate;
        state.last_metric = reward;
    }

    state
        .settings
        .set_f64("temperature", (temperature * cooling).max(min_temperature));
    state.iteration += 1;
    state.current_value
}

/// PID controller driving the measured metric toward `target`.
pub fn pid_control(state: &mut AlgorithmState, measured: f64) -> f64 {
    let target = state.settings.get_f64("target", 0.0);
    let kp = state.settings.get_f64("kp", 1.0);
    let ki = state.settings.get_f64("ki", 0.1);
    let kd = state.settings.get_f64("kd", 0.01);
    let prev_error = state.settings.get_f64("prev_error", 0.0);

    let error = target - measured;
    let integral = state.settings.get_f64("integral", 0.0) + error;
    let derivative = error - prev_error;
    let output = kp * error + ki * integral + kd * derivative;

    state.current_value += output;
    state.settings.set_f64("integral", integral);
    state.settings.set_f64("prev_error", error);
    state.last_metric = measured;
    state.iteration += 1;
    state.current_value
}

/// Cross-entropy method.
///
/// Keeps the top `population_size * elite_fraction` samples by reward (at
/// least one) and moves to their mean. The elite spread becomes the next
/// `std_dev`, floored at `min_std_dev`.
pub fn cross_entropy(state: &mut AlgorithmState, samples: &[OptimizerSample]) -> f64 {
    if samples.is_empty() {
        return state.current_value;
    }

    let population = state
        .settings
        .get_usize("population_size", DEFAULT_POPULATION_SIZE);
    let fraction = state.settings.get_f64("elite_fraction", 0.2).clamp(0.0, 1.0);
    let elite_count = ((population as f64 * fraction).floor() as usize).clamp(1, samples.len());

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| b.reward.total_cmp(&a.reward));
    let elite = &sorted[..elite_count];

    let mean = elite.iter().map(|s| s.value).sum::<f64>() / elite_count as f64;
    let variance =
        elite.iter().map(|s| (s.value - mean).powi(2)).sum::<f64>() / elite_count as f64;
    let min_std = state.settings.get_f64("min_std_dev", 0.01).max(0.0);

    state.current_value = mean;
    state.last_metric = elite[0].reward;
    state.settings.set_f64("std_dev", variance.sqrt().max(min_std));
    state.iteration += 1;
    state.current_value
}

/// Noisy-greedy placeholder for Bayesian optimization.
///
/// Picks the sample maximizing `reward + N(0, 1) * noise`. There is no
/// surrogate model and no acquisition function.
pub fn noisy_greedy<R: Rng + ?Sized>(
    state: &mut AlgorithmState,
    samples: &[OptimizerSample],
    rng: &mut R,
) -> f64 {
    let noise = state.settings.get_f64("noise", 0.1);
    let mut best: Option<(OptimizerSample, f64)> = None;
    for sample in samples {
        let z: f64 = StandardNormal.sample(rng);
        let score = sample.reward + z * noise;
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((*sample, score));
        }
    }

    if let Some((sample, _)) = best {
        state.current_value = sample.value;
        state.last_metric = sample.reward;
        state.iteration += 1;
    }
    state.current_value
}
