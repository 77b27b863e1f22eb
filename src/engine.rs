//! The decision engine facade and its background flush thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::algorithms::{
    AlgorithmState, AlgorithmType, ContextualAlgorithmState, FeedbackEvent, OptimizerFeedback,
    Settings, StateKey,
};
use crate::config::EngineConfig;
use crate::custom::{CustomAlgorithmManager, CustomAlgorithmState};
use crate::encoding::Context;
use crate::error::{EngineError, Result};
use crate::metrics::EngineMetrics;
use crate::sandbox::ModuleExports;
use crate::store::{LoadSummary, StateStore};

/// Adaptive decision engine.
///
/// Built with [`EngineBuilder`](crate::EngineBuilder). Evaluation and
/// feedback are served from memory; [`start`](Self::start) loads state and
/// begins flushing counters every `flush_interval_ms`.
///
/// # Examples
///
/// ```ignore
/// use flagbandit::{EngineBuilder, StateKey};
///
/// let engine = EngineBuilder::new()
///     .file("flagbandit.toml")
///     .repository(repo)
///     .build()?;
/// engine.start()?;
///
/// let key = StateKey::new("checkout-button", "production");
/// if let Some(variant) = engine.evaluate_feature(&key) {
///     // serve `variant`
/// }
///
/// engine.stop();
/// ```
pub struct DecisionEngine {
    config: EngineConfig,
    store: Arc<StateStore>,
    metrics: EngineMetrics,
    flusher: Mutex<Option<Flusher>>,
}

struct Flusher {
    signal: Arc<StopSignal>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *self.stopped.lock() = true;
        self.condvar.notify_all();
    }
}

impl DecisionEngine {
    pub(crate) fn from_parts(
        config: EngineConfig,
        store: StateStore,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            config,
            store: Arc::new(store),
            metrics,
            flusher: Mutex::new(None),
        }
    }

    /// Load state from the repositories and start the flush thread.
    ///
    /// Calling `start` on a running engine reloads state and keeps the
    /// existing thread.
    pub fn start(&self) -> Result<LoadSummary> {
        let summary = self.store.load_state()?;

        let mut flusher = self.flusher.lock();
        if flusher.is_none() {
            *flusher = Some(self.spawn_flusher()?);
        }

        info!(
            prefix = %self.config.prefix,
            features = summary.loaded(),
            flush_interval_ms = self.config.flush_interval_ms,
            "decision engine started"
        );
        Ok(summary)
    }

    fn spawn_flusher(&self) -> Result<Flusher> {
        let signal = Arc::new(StopSignal::default());
        let store = self.store.clone();
        let interval = self.config.flush_interval();
        let thread_signal = signal.clone();

        let handle = thread::Builder::new()
            .name(format!("{}-flush", self.config.prefix))
            .spawn(move || {
                let mut stopped = thread_signal.stopped.lock();
                while !*stopped {
                    let timed_out = thread_signal
                        .condvar
                        .wait_for(&mut stopped, interval)
                        .timed_out();
                    if *stopped || !timed_out {
                        continue;
                    }
                    MutexGuard::unlocked(&mut stopped, || {
                        if let Err(e) = store.flush_all() {
                            warn!(%e, "periodic flush failed");
                        }
                    });
                }
                debug!("flush thread exiting");
            })
            .map_err(EngineError::Spawn)?;

        Ok(Flusher { signal, handle })
    }

    /// Stop the flush thread and persist whatever is still pending.
    ///
    /// The final flush is best-effort: failures are logged. Safe to call
    /// more than once.
    pub fn stop(&self) {
        let Some(flusher) = self.flusher.lock().take() else {
            return;
        };
        flusher.signal.stop();
        if flusher.handle.join().is_err() {
            warn!("flush thread panicked");
        }

        match self.store.flush_all() {
            Ok(rows) => info!(rows, "decision engine stopped"),
            Err(e) => warn!(%e, "final flush failed; unflushed stats are lost"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.flusher.lock().is_some()
    }

    /// Flush immediately, outside the periodic schedule.
    pub fn flush(&self) -> Result<usize> {
        self.store.flush_all()
    }

    /// Reload every state from the repositories.
    pub fn reload(&self) -> Result<LoadSummary> {
        self.store.load_state()
    }

    pub fn evaluate_feature(&self, key: &StateKey) -> Option<String> {
        self.store.evaluate_feature(key)
    }

    pub fn evaluate_optimizer(&self, key: &StateKey) -> Option<f64> {
        self.store.evaluate_optimizer(key)
    }

    pub fn evaluate_contextual(&self, key: &StateKey, context: &Context) -> Option<String> {
        self.store.evaluate_contextual(key, context)
    }

    pub fn handle_feedback(
        &self,
        key: &StateKey,
        variant: &str,
        event: FeedbackEvent,
        metric: Option<Decimal>,
    ) -> bool {
        self.store.handle_feedback(key, variant, event, metric)
    }

    pub fn handle_optimizer_feedback(&self, key: &StateKey, feedback: OptimizerFeedback) -> bool {
        self.store.handle_optimizer_feedback(key, feedback)
    }

    pub fn handle_contextual_feedback(
        &self,
        key: &StateKey,
        variant: &str,
        context: &Context,
        reward: f64,
    ) -> bool {
        self.store
            .handle_contextual_feedback(key, variant, context, reward)
    }

    pub fn register_algorithm(
        &self,
        key: StateKey,
        algorithm: AlgorithmType,
        variants: Vec<String>,
        settings: Settings,
    ) -> Result<()> {
        self.store
            .register_algorithm(key, algorithm, variants, settings)
    }

    pub fn register_contextual(
        &self,
        key: StateKey,
        algorithm: AlgorithmType,
        variants: Vec<String>,
        settings: Settings,
    ) -> Result<()> {
        self.store
            .register_contextual(key, algorithm, variants, settings)
    }

    pub fn register_custom_algorithm(
        &self,
        key: StateKey,
        algorithm_id: &str,
        variants: Vec<String>,
        settings: Settings,
    ) -> Result<()> {
        self.store
            .register_custom_algorithm(key, algorithm_id, variants, settings)
    }

    pub fn unregister(&self, key: &StateKey) -> bool {
        self.store.unregister(key)
    }

    pub fn snapshot(&self, key: &StateKey) -> Option<AlgorithmState> {
        self.store.snapshot(key)
    }

    pub fn contextual_snapshot(&self, key: &StateKey) -> Option<ContextualAlgorithmState> {
        self.store.contextual_snapshot(key)
    }

    pub fn custom_snapshot(&self, key: &StateKey) -> Option<CustomAlgorithmState> {
        self.custom_manager()?.snapshot(key)
    }

    /// Check uploaded module bytes against the guest contract.
    pub fn validate_algorithm(&self, binary: &[u8]) -> Result<ModuleExports> {
        let manager = self
            .custom_manager()
            .ok_or(EngineError::MissingCollaborator("custom algorithm repository"))?;
        Ok(manager.validate_algorithm(binary)?)
    }

    /// Forget the compiled code of an algorithm whose binary changed.
    pub fn invalidate_algorithm(&self, algorithm_id: &str) {
        if let Some(manager) = self.custom_manager() {
            manager.invalidate_algorithm(algorithm_id);
        }
    }

    pub fn custom_manager(&self) -> Option<&Arc<CustomAlgorithmManager>> {
        self.store.custom_manager()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Metrics are always collected. They are exposed only if a registry
    /// was given to the builder.
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }
}

impl Drop for DecisionEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("running", &self.is_running())
            .finish()
    }
}
