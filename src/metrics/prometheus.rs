//! Prometheus metrics for the decision engine.
//!
//! Counters and gauges are plain atomics and count whether or not a
//! Registry is attached; registration only matters for exposition.
//!
//! ```ignore
//! let registry = prometheus::Registry::new();
//! let engine = EngineBuilder::new()
//!     .prometheus_registry(registry.clone())
//!     // ... repositories ...
//!     .build()?;
//!
//! let encoder = prometheus::TextEncoder::new();
//! let mut buffer = Vec::new();
//! encoder.encode(&registry.gather(), &mut buffer)?;
//! ```

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Prometheus metrics for one engine.
#[derive(Clone)]
pub struct EngineMetrics {
    // === Gauges ===
    /// Features registered with the state store (built-in and custom)
    pub registered_features: IntGauge,

    /// Compiled modules held in the sandbox cache
    pub cached_modules: IntGauge,

    /// Live pooled module instances
    pub pooled_instances: IntGauge,

    // === Counters ===
    /// Evaluations that produced a variant or value
    pub decisions: IntCounter,

    /// Evaluations that produced nothing
    pub no_decisions: IntCounter,

    /// Feedback events applied
    pub feedback_events: IntCounter,

    /// Guest calls attempted
    pub sandbox_calls: IntCounter,

    /// Guest calls that failed for any reason
    pub sandbox_failures: IntCounter,

    /// Guest calls that hit the deadline
    pub sandbox_timeouts: IntCounter,

    /// Custom feedback handled by local counters instead of the guest
    pub feedback_fallbacks: IntCounter,

    /// Stats rows written by flushes
    pub flushed_rows: IntCounter,

    /// Flushes that failed and will be retried
    pub flush_errors: IntCounter,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace characters Prometheus does not accept in metric names.
fn sanitize_prefix(prefix: &str) -> String {
    prefix
        .chars()
        .enumerate()
        .map(|(i, c)| {
            let valid = c.is_ascii_alphabetic()
                || c == '_'
                || c == ':'
                || (i > 0 && c.is_ascii_digit());
            if valid {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn counter(prefix: &str, name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(format!("{prefix}_{name}"), help))
        .expect("metric creation should not fail")
}

fn gauge(prefix: &str, name: &str, help: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(format!("{prefix}_{name}"), help))
        .expect("metric creation should not fail")
}

impl EngineMetrics {
    /// Metrics with the default "flagbandit" prefix.
    pub fn new() -> Self {
        Self::with_prefix("flagbandit")
    }

    /// Metrics named `{prefix}_decisions`, `{prefix}_flush_errors`, etc.
    ///
    /// Hyphens and other characters invalid in Prometheus names become
    /// underscores, so `"my-app"` yields `my_app_decisions`.
    pub fn with_prefix(prefix: &str) -> Self {
        let p = sanitize_prefix(prefix);
        Self {
            registered_features: gauge(&p, "registered_features", "Registered features"),
            cached_modules: gauge(&p, "cached_modules", "Compiled modules in the sandbox cache"),
            pooled_instances: gauge(&p, "pooled_instances", "Pooled custom algorithm instances"),

            decisions: counter(&p, "decisions", "Evaluations that produced a decision"),
            no_decisions: counter(&p, "no_decisions", "Evaluations that produced no decision"),
            feedback_events: counter(&p, "feedback_events", "Feedback events applied"),
            sandbox_calls: counter(&p, "sandbox_calls", "Custom algorithm calls"),
            sandbox_failures: counter(&p, "sandbox_failures", "Failed custom algorithm calls"),
            sandbox_timeouts: counter(
                &p,
                "sandbox_timeouts",
                "Custom algorithm calls that timed out",
            ),
            feedback_fallbacks: counter(
                &p,
                "feedback_fallbacks",
                "Custom feedback recorded in local stats",
            ),
            flushed_rows: counter(&p, "flushed_rows", "Stats rows persisted"),
            flush_errors: counter(&p, "flush_errors", "Failed stats flushes"),
        }
    }

    /// Register all metrics with a Registry for exposition.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate names).
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.registered_features.clone()))?;
        registry.register(Box::new(self.cached_modules.clone()))?;
        registry.register(Box::new(self.pooled_instances.clone()))?;
        registry.register(Box::new(self.decisions.clone()))?;
        registry.register(Box::new(self.no_decisions.clone()))?;
        registry.register(Box::new(self.feedback_events.clone()))?;
        registry.register(Box::new(self.sandbox_calls.clone()))?;
        registry.register(Box::new(self.sandbox_failures.clone()))?;
        registry.register(Box::new(self.sandbox_timeouts.clone()))?;
        registry.register(Box::new(self.feedback_fallbacks.clone()))?;
        registry.register(Box::new(self.flushed_rows.clone()))?;
        registry.register(Box::new(self.flush_errors.clone()))?;
        Ok(())
    }

    /// Count an evaluation outcome.
    #[inline]
    pub fn record_decision(&self, decided: bool) {
        if decided {
            self.decisions.inc();
        } else {
            self.no_decisions.inc();
        }
    }

    /// Count a guest call and, if it failed, why.
    #[inline]
    pub fn record_sandbox_call(&self, error: Option<&crate::sandbox::SandboxError>) {
        self.sandbox_calls.inc();
        match error {
            None => {}
            Some(crate::sandbox::SandboxError::Timeout) => {
                self.sandbox_failures.inc();
                self.sandbox_timeouts.inc();
            }
            Some(_) => self.sandbox_failures.inc(),
        }
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("registered_features", &self.registered_features.get())
            .field("decisions", &self.decisions.get())
            .field("no_decisions", &self.no_decisions.get())
            .field("sandbox_failures", &self.sandbox_failures.get())
            .field("flush_errors", &self.flush_errors.get())
            .finish()
    }
}
