//! Built-in decision algorithms.
//!
//! All algorithms are plain functions over an [`AlgorithmState`] or
//! [`ContextualAlgorithmState`]. They hold no locks and do no I/O; the
//! [`StateStore`](crate::store::StateStore) owns the state and calls them
//! under the feature's lock.
//!
//! # Families
//!
//! | Family | Algorithms | Output |
//! |--------|------------|--------|
//! | Bandit | epsilon-greedy, UCB1, Thompson sampling | variant key |
//! | Contextual | LinUCB, contextual epsilon-greedy, contextual Thompson | variant key |
//! | Optimizer | hill climbing, simulated annealing, PID, CEM, noisy-greedy | `f64` value |
//!
//! # Settings
//!
//! Hyperparameters come from the feature's [`Settings`]. Every setting has a
//! default, so an empty settings map is always valid:
//!
//! ```ignore
//! use flagbandit::algorithms::{AlgorithmState, AlgorithmType, Settings, bandit};
//!
//! let settings: Settings = [("epsilon", 0.05)].into_iter().collect();
//! let mut state = AlgorithmState::new(
//!     AlgorithmType::EpsilonGreedy,
//!     vec!["control".into(), "treatment".into()],
//!     settings,
//! );
//! let variant = bandit::select_variant(&mut state, &mut rand::thread_rng());
//! ```

pub mod bandit;
pub mod contextual;
pub mod optimizer;
mod types;

pub use types::{
    AlgorithmState, AlgorithmType, ContextualAlgorithmState, ContextualVariantState,
    FeedbackEvent, OptimizerFeedback, OptimizerSample, Settings, StateKey, VariantStats,
    CUSTOM_SLUG,
};
