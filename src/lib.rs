//! # flagbandit
//!
//! **Adaptive decisions for feature flags**
//!
//! An in-process decision engine that picks which variant of a feature to
//! serve, or which numeric value to emit, and learns from the feedback it
//! receives.
//!
//! ## Features
//!
//! - **Bandits**: epsilon-greedy, UCB1 and Beta-Bernoulli Thompson sampling
//! - **Contextual Bandits**: LinUCB, contextual epsilon-greedy and contextual
//!   Thompson sampling over hashed request attributes
//! - **Optimizers**: hill climbing, simulated annealing, PID, cross-entropy
//!   and noisy-greedy search for a single scalar parameter
//! - **Custom Algorithms**: untrusted WebAssembly modules run in a wasmtime
//!   sandbox with per-call deadlines
//! - **Write-behind Persistence**: counters live in memory and are flushed as
//!   deltas on a background thread
//! - **Flexible Configuration**: files (TOML/YAML/JSON), environment
//!   variables, code, or CLI arguments
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use flagbandit::{EngineBuilder, FeedbackEvent, StateKey};
//! use flagbandit::repository::memory::MemoryRepository;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let repo = Arc::new(MemoryRepository::new());
//!     let key = StateKey::new("checkout-button", "production");
//!     repo.add_feature(key.clone(), "thompson-sampling", &["blue", "green"], Default::default());
//!
//!     let engine = EngineBuilder::new()
//!         .prefix("myapp")
//!         .repository(repo)
//!         .build()?;
//!     engine.start()?;
//!
//!     if let Some(variant) = engine.evaluate_feature(&key) {
//!         // ... serve it, observe the outcome ...
//!         engine.handle_feedback(&key, &variant, FeedbackEvent::Success, None);
//!     }
//!
//!     // Stops the flush thread and writes what is still pending
//!     engine.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Configuration sources are merged in order (later sources override earlier):
//!
//! 1. Default values
//! 2. Config files (via `.file()`)
//! 3. Environment variables (via `.env_prefix()`)
//! 4. Programmatic overrides
//! 5. CLI arguments (via `.with_cli_args()`)
//!
//! ### Config File Example (TOML)
//!
//! ```toml
//! prefix = "myapp"
//! flush_interval_ms = 10000
//! default_dimension = 32
//!
//! [sandbox]
//! timeout_ms = 50
//! epoch_tick_ms = 5
//! max_output_bytes = 65536
//! ```
//!
//! ### Environment Variables
//!
//! With `.env_prefix("FLAGBANDIT")`:
//! - `FLAGBANDIT_PREFIX=myapp`
//! - `FLAGBANDIT_FLUSH_INTERVAL_MS=10000`
//! - `FLAGBANDIT_SANDBOX__TIMEOUT_MS=50`
//!
//! ### CLI Arguments
//!
//! ```ignore
//! use clap::Parser;
//! use flagbandit::{EngineBuilder, EngineArgs};
//!
//! #[derive(Parser)]
//! struct MyArgs {
//!     #[command(flatten)]
//!     engine: EngineArgs,
//! }
//!
//! let args = MyArgs::parse();
//! let engine = EngineBuilder::new()
//!     .file("config.toml")
//!     .env_prefix("FLAGBANDIT")
//!     .with_cli_args(&args.engine)
//!     .repository(repo)
//!     .build()?;
//! ```
//!
//! ## Custom Algorithms
//!
//! Supplying the custom algorithm repositories enables features whose
//! algorithm slug is `"custom"`. Their module contract is described in
//! [`sandbox`].
//!
//! ```ignore
//! let engine = EngineBuilder::new()
//!     .repository(repo.clone())
//!     .custom_repositories(repo.clone(), repo)
//!     .sandbox_timeout_ms(50)
//!     .build()?;
//! ```
//!
//! ## Thread Naming
//!
//! Threads are named with the configured prefix:
//! - Flush thread: `{prefix}-flush`
//! - Sandbox epoch ticker: `{prefix}-epoch`

pub mod algorithms;
pub mod builder;
pub mod config;
pub mod custom;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod linalg;
pub mod metrics;
pub mod repository;
pub mod sandbox;
pub mod store;

pub use algorithms::{
    AlgorithmState, AlgorithmType, ContextualAlgorithmState, FeedbackEvent, OptimizerFeedback,
    Settings, StateKey, VariantStats,
};
pub use builder::{EngineArgs, EngineBuilder};
pub use config::{EngineConfig, SandboxConfig};
pub use custom::{CustomAlgorithmManager, CustomAlgorithmState, CustomKind};
pub use encoding::Context;
pub use engine::DecisionEngine;
pub use error::{EngineError, Result};
pub use metrics::EngineMetrics;
pub use repository::RepositoryError;
pub use sandbox::SandboxError;
pub use store::{LoadSummary, StateStore, StoreRepositories};

// Re-exported so callers can build metric values without a direct dependency
pub use rust_decimal::Decimal;
