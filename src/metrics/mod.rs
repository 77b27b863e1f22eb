//! Metrics for decision engine observability.
//!
//! # Available Metrics
//!
//! ## Gauges
//!
//! - `flagbandit_registered_features` - Features registered with the store
//! - `flagbandit_cached_modules` - Compiled custom algorithm modules
//! - `flagbandit_pooled_instances` - Live custom algorithm instances
//!
//! ## Counters
//!
//! - `flagbandit_decisions` / `flagbandit_no_decisions` - Evaluation outcomes
//! - `flagbandit_feedback_events` - Feedback events applied
//! - `flagbandit_sandbox_calls` - Guest calls attempted
//! - `flagbandit_sandbox_failures` - Guest calls that failed
//! - `flagbandit_sandbox_timeouts` - Guest calls that hit the deadline
//! - `flagbandit_feedback_fallbacks` - Custom feedback counted locally
//! - `flagbandit_flushed_rows` - Stats rows persisted
//! - `flagbandit_flush_errors` - Failed flushes

mod prometheus;

pub use prometheus::EngineMetrics;
