use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::state::CustomAlgorithmState;
use crate::algorithms::{FeedbackEvent, OptimizerFeedback, Settings, StateKey};
use crate::encoding::Context;
use crate::error::Result;
use crate::metrics::EngineMetrics;
use crate::repository::{CustomAlgorithmRepository, CustomStatsRecord, CustomStatsRepository};
use crate::sandbox::protocol::{
    BanditInput, BanditOutput, ContextualInput, FeedbackInput, FeedbackOutput, OptimizerInput,
    OptimizerOutput,
};
use crate::sandbox::{CustomKind, ModuleExports, ModuleInstance, SandboxError, SandboxRuntime};

type StateSlot = Arc<RwLock<CustomAlgorithmState>>;

/// A custom feature read from the configuration repository.
#[derive(Debug)]
pub(crate) struct Registration {
    pub(crate) key: StateKey,
    pub(crate) algorithm_id: String,
    pub(crate) variants: Vec<String>,
    pub(crate) settings: Settings,
    pub(crate) enabled: bool,
}

/// Registrations built by [`CustomAlgorithmManager::stage`], not yet visible.
#[derive(Debug, Default)]
pub(crate) struct StagedRegistrations {
    states: HashMap<StateKey, CustomAlgorithmState>,
    pub(crate) skipped: usize,
    pub(crate) restored: usize,
}

impl StagedRegistrations {
    pub(crate) fn len(&self) -> usize {
        self.states.len()
    }
}

/// Routes (feature, environment) pairs to sandboxed algorithm instances.
///
/// One [`ModuleInstance`] is pooled per algorithm id and shared by every
/// feature using that algorithm. Instances are created on first use.
pub struct CustomAlgorithmManager {
    runtime: Arc<SandboxRuntime>,
    algorithms: Arc<dyn CustomAlgorithmRepository>,
    stats_repo: Arc<dyn CustomStatsRepository>,
    metrics: EngineMetrics,
    states: RwLock<HashMap<StateKey, StateSlot>>,
    instances: RwLock<HashMap<String, Arc<ModuleInstance>>>,
    /// Algorithm id -> content hash of the module its instance was built from.
    hashes: RwLock<HashMap<String, String>>,
}

impl CustomAlgorithmManager {
    pub fn new(
        runtime: Arc<SandboxRuntime>,
        algorithms: Arc<dyn CustomAlgorithmRepository>,
        stats_repo: Arc<dyn CustomStatsRepository>,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            runtime,
            algorithms,
            stats_repo,
            metrics,
            states: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            hashes: RwLock::new(HashMap::new()),
        }
    }

    /// Bind `key` to custom algorithm `algorithm_id`.
    ///
    /// The algorithm's kind is looked up once here. Re-registering a key
    /// replaces its state, blob included.
    pub fn register_custom_algorithm(
        &self,
        key: StateKey,
        algorithm_id: &str,
        variants: Vec<String>,
        settings: Settings,
        enabled: bool,
    ) -> Result<()> {
        let record = self
            .algorithms
            .get_algorithm(algorithm_id)?
            .ok_or_else(|| SandboxError::AlgorithmNotFound(algorithm_id.to_string()))?;

        let mut state = CustomAlgorithmState::new(algorithm_id, record.kind, variants, settings);
        state.enabled = enabled;

        debug!(
            feature = %key,
            algorithm_id,
            kind = record.kind.as_str(),
            "registered custom algorithm"
        );
        self.states.write().insert(key, Arc::new(RwLock::new(state)));
        Ok(())
    }

    /// Build states for `registrations` and restore their persisted stats,
    /// without making them visible.
    ///
    /// Registrations naming an algorithm the repository does not know are
    /// skipped. Any repository failure is returned before anything changes.
    pub(crate) fn stage(&self, registrations: Vec<Registration>) -> Result<StagedRegistrations> {
        let algorithms: HashMap<String, CustomKind> = self
            .algorithms
            .list_algorithms()?
            .into_iter()
            .map(|record| (record.id, record.kind))
            .collect();

        let mut staged = StagedRegistrations::default();
        for registration in registrations {
            let Some(kind) = algorithms.get(&registration.algorithm_id).copied() else {
                warn!(
                    feature = %registration.key,
                    algorithm_id = %registration.algorithm_id,
                    "skipping custom feature with an unknown algorithm"
                );
                staged.skipped += 1;
                continue;
            };
            let mut state = CustomAlgorithmState::new(
                registration.algorithm_id,
                kind,
                registration.variants,
                registration.settings,
            );
            state.enabled = registration.enabled;
            staged.states.insert(registration.key, state);
        }

        for record in self.stats_repo.load_all()? {
            let Some(state) = staged.states.get_mut(&record.key) else {
                continue;
            };
            if state.algorithm_id == record.algorithm_id {
                state.stats.insert(record.variant, record.stats);
                staged.restored += 1;
            }
        }
        Ok(staged)
    }

    /// Replace every registration with `staged`.
    ///
    /// A key that keeps its algorithm keeps its in-memory counters, which
    /// include anything not yet flushed. Pooled instances are kept.
    pub(crate) fn commit(&self, staged: StagedRegistrations) {
        let next: HashMap<StateKey, StateSlot> = staged
            .states
            .into_iter()
            .map(|(key, state)| (key, Arc::new(RwLock::new(state))))
            .collect();
        let retired = std::mem::replace(&mut *self.states.write(), next);

        let pairs: Vec<(StateSlot, StateSlot)> = {
            let current = self.states.read();
            retired
                .into_iter()
                .filter_map(|(key, old)| Some((old, current.get(&key)?.clone())))
                .collect()
        };
        for (old, new) in pairs {
            let old = old.read();
            let mut new = new.write();
            if old.algorithm_id == new.algorithm_id {
                for (variant, stats) in &old.stats {
                    new.stats.insert(variant.clone(), stats.clone());
                }
            }
        }
    }

    pub fn unregister_custom_algorithm(&self, key: &StateKey) -> bool {
        self.states.write().remove(key).is_some()
    }

    pub fn contains(&self, key: &StateKey) -> bool {
        self.states.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    /// Copy of the state registered for `key`.
    pub fn snapshot(&self, key: &StateKey) -> Option<CustomAlgorithmState> {
        let slot = self.slot(key)?;
        let state = slot.read().clone();
        Some(state)
    }

    pub fn pooled_instances(&self) -> usize {
        self.instances.read().len()
    }

    /// Check an uploaded module against the guest contract.
    pub fn validate_algorithm(
        &self,
        binary: &[u8],
    ) -> std::result::Result<ModuleExports, SandboxError> {
        self.runtime.validate_module(binary)
    }

    /// Drop the pooled instance and cached module of `algorithm_id`.
    ///
    /// The next call recompiles from the repository, picking up new code.
    pub fn invalidate_algorithm(&self, algorithm_id: &str) {
        let removed = self.instances.write().remove(algorithm_id).is_some();
        if let Some(hash) = self.hashes.write().remove(algorithm_id) {
            self.runtime.remove_from_cache(&hash);
        }
        self.update_pool_gauges();
        debug!(algorithm_id, removed, "invalidated custom algorithm");
    }

    fn slot(&self, key: &StateKey) -> Option<StateSlot> {
        self.states.read().get(key).cloned()
    }

    fn update_pool_gauges(&self) {
        self.metrics
            .pooled_instances
            .set(self.instances.read().len() as i64);
        self.metrics
            .cached_modules
            .set(self.runtime.cached_modules() as i64);
    }

    /// Pooled instance for `algorithm_id`, created on first use.
    ///
    /// The module is fetched and compiled without holding the pool lock. If
    /// another caller pooled an instance meanwhile, that one wins.
    fn instance(&self, algorithm_id: &str) -> Result<Arc<ModuleInstance>> {
        if let Some(instance) = self.instances.read().get(algorithm_id) {
            return Ok(instance.clone());
        }

        let record = self
            .algorithms
            .get_algorithm(algorithm_id)?
            .ok_or_else(|| SandboxError::AlgorithmNotFound(algorithm_id.to_string()))?;
        let module = self
            .runtime
            .compile_module(&record.content_hash, &record.binary)?;
        let created = Arc::new(self.runtime.instantiate(&module)?);

        let instance = {
            let mut instances = self.instances.write();
            if let Some(existing) = instances.get(algorithm_id) {
                return Ok(existing.clone());
            }
            instances.insert(algorithm_id.to_string(), created.clone());
            created
        };
        self.hashes
            .write()
            .insert(algorithm_id.to_string(), record.content_hash.clone());
        info!(
            algorithm_id,
            hash = %record.content_hash,
            feedback = instance.has_feedback_handler(),
            "created custom algorithm instance"
        );
        self.update_pool_gauges();
        Ok(instance)
    }

    /// Run one guest call, recording metrics and logging failures.
    fn call<O>(
        &self,
        key: &StateKey,
        algorithm_id: &str,
        op: &'static str,
        f: impl FnOnce(&ModuleInstance) -> std::result::Result<O, SandboxError>,
    ) -> Option<O> {
        let instance = match self.instance(algorithm_id) {
            Ok(instance) => instance,
            Err(e) => {
                warn!(feature = %key, algorithm_id, op, %e, "custom algorithm unavailable");
                return None;
            }
        };

        let result = f(&instance);
        self.metrics.record_sandbox_call(result.as_ref().err());
        match result {
            Ok(output) => Some(output),
            Err(e) => {
                warn!(feature = %key, algorithm_id, op, %e, "custom algorithm call failed");
                None
            }
        }
    }

    /// Variant chosen by a custom bandit.
    pub fn evaluate_bandit(&self, key: &StateKey) -> Option<String> {
        let slot = self.slot(key)?;
        let mut state = slot.write();
        if !state.enabled || state.kind != CustomKind::Bandit {
            return None;
        }

        let output: BanditOutput = {
            let input = BanditInput {
                feature_key: &key.feature_key,
                environment_key: &key.environment_key,
                variants: state.variant_views(),
                settings: state.settings.to_f64_map(),
                state: state.state_blob.as_deref(),
            };
            self.call(key, &state.algorithm_id, "evaluate", |i| i.evaluate(&input))?
        };

        state.replace_blob(output.state);
        accept_variant(key, &state, output.variant)
    }

    /// Variant chosen by a custom contextual bandit for `context`.
    pub fn evaluate_contextual(&self, key: &StateKey, context: &Context) -> Option<String> {
        let slot = self.slot(key)?;
        let mut state = slot.write();
        if !state.enabled || state.kind != CustomKind::ContextualBandit {
            return None;
        }

        let output: BanditOutput = {
            let input = ContextualInput {
                feature_key: &key.feature_key,
                environment_key: &key.environment_key,
                variants: state.variant_views(),
                context,
                settings: state.settings.to_f64_map(),
                state: state.state_blob.as_deref(),
            };
            self.call(key, &state.algorithm_id, "evaluate", |i| i.evaluate(&input))?
        };

        state.replace_blob(output.state);
        accept_variant(key, &state, output.variant)
    }

    /// Value proposed by a custom optimizer.
    pub fn evaluate_optimizer(&self, key: &StateKey) -> Option<f64> {
        let slot = self.slot(key)?;
        let mut state = slot.write();
        if !state.enabled || state.kind != CustomKind::Optimizer {
            return None;
        }

        let output: OptimizerOutput = {
            let input = OptimizerInput {
                feature_key: &key.feature_key,
                environment_key: &key.environment_key,
                current_value: state.current_value,
                iteration: state.iteration,
                last_metric: state.last_metric,
                settings: state.settings.to_f64_map(),
                state: state.state_blob.as_deref(),
            };
            self.call(key, &state.algorithm_id, "evaluate", |i| i.evaluate(&input))?
        };

        state.replace_blob(output.state);
        match output.value {
            Some(value) if value.is_finite() => {
                state.current_value = value;
                Some(value)
            }
            other => {
                warn!(
                    feature = %key,
                    value = ?other,
                    "custom optimizer returned no usable value"
                );
                None
            }
        }
    }

    /// Deliver a bandit feedback event.
    ///
    /// Goes to the guest's `handle_feedback` when it has one. If it does not,
    /// or the call fails, the event is counted in local stats instead.
    /// Returns `false` if `key` is not registered.
    pub fn handle_feedback(
        &self,
        key: &StateKey,
        variant: &str,
        event: FeedbackEvent,
        metric: Option<Decimal>,
    ) -> bool {
        let Some(slot) = self.slot(key) else {
            return false;
        };
        let mut state = slot.write();
        if !state.enabled || state.kind != CustomKind::Bandit {
            return false;
        }

        let delivered = {
            let input = FeedbackInput {
                feature_key: &key.feature_key,
                environment_key: &key.environment_key,
                variant: Some(variant),
                event: Some(event),
                metric: metric.and_then(|m| m.to_f64()),
                value: None,
                context: None,
                settings: state.settings.to_f64_map(),
                state: state.state_blob.as_deref(),
            };
            self.deliver_feedback(key, &state.algorithm_id, &input)
        };
        match delivered {
            Some(blob) => state.replace_blob(blob),
            None => {
                state.apply_local(variant, event, metric);
                self.metrics.feedback_fallbacks.inc();
                debug!(
                    feature = %key,
                    variant,
                    event = event.as_str(),
                    "custom feedback counted locally"
                );
            }
        }
        true
    }

    /// Deliver a reward observed for `variant` under `context`.
    pub fn handle_contextual_feedback(
        &self,
        key: &StateKey,
        variant: &str,
        context: &Context,
        reward: f64,
    ) -> bool {
        let Some(slot) = self.slot(key) else {
            return false;
        };
        let mut state = slot.write();
        if !state.enabled || state.kind != CustomKind::ContextualBandit {
            return false;
        }

        let event = if reward > 0.0 {
            FeedbackEvent::Success
        } else {
            FeedbackEvent::Failure
        };
        let delivered = {
            let input = FeedbackInput {
                feature_key: &key.feature_key,
                environment_key: &key.environment_key,
                variant: Some(variant),
                event: Some(event),
                metric: Some(reward),
                value: None,
                context: Some(context),
                settings: state.settings.to_f64_map(),
                state: state.state_blob.as_deref(),
            };
            self.deliver_feedback(key, &state.algorithm_id, &input)
        };
        match delivered {
            Some(blob) => state.replace_blob(blob),
            None => {
                state.apply_local(variant, FeedbackEvent::Evaluation, None);
                state.apply_local(variant, event, Decimal::from_f64_retain(reward));
                self.metrics.feedback_fallbacks.inc();
            }
        }
        true
    }

    /// Deliver an optimizer observation.
    pub fn handle_optimizer_feedback(&self, key: &StateKey, feedback: OptimizerFeedback) -> bool {
        let Some(slot) = self.slot(key) else {
            return false;
        };
        let mut state = slot.write();
        if !state.enabled || state.kind != CustomKind::Optimizer {
            return false;
        }

        let delivered = {
            let input = FeedbackInput {
                feature_key: &key.feature_key,
                environment_key: &key.environment_key,
                variant: None,
                event: None,
                metric: Some(feedback.metric),
                value: Some(feedback.value),
                context: None,
                settings: state.settings.to_f64_map(),
                state: state.state_blob.as_deref(),
            };
            self.deliver_feedback(key, &state.algorithm_id, &input)
        };
        match delivered {
            Some(blob) => state.replace_blob(blob),
            None => {
                self.metrics.feedback_fallbacks.inc();
            }
        }
        state.last_metric = feedback.metric;
        state.iteration += 1;
        true
    }

    /// `Some(blob)` when the guest handled the feedback, `None` to fall back.
    fn deliver_feedback(
        &self,
        key: &StateKey,
        algorithm_id: &str,
        input: &FeedbackInput<'_>,
    ) -> Option<Option<Box<serde_json::value::RawValue>>> {
        let instance = match self.instance(algorithm_id) {
            Ok(instance) => instance,
            Err(e) => {
                warn!(
                    feature = %key,
                    algorithm_id,
                    %e,
                    "custom algorithm unavailable for feedback"
                );
                return None;
            }
        };
        if !instance.has_feedback_handler() {
            return None;
        }

        let result = instance.handle_feedback::<_, FeedbackOutput>(input);
        self.metrics.record_sandbox_call(result.as_ref().err());
        match result {
            Ok(output) => Some(output.and_then(|o| o.state)),
            Err(e) => {
                warn!(
                    feature = %key,
                    algorithm_id,
                    %e,
                    "custom feedback failed, counting locally"
                );
                None
            }
        }
    }

    /// Restore local stats persisted by an earlier run.
    ///
    /// Records for keys that are not registered, or that now use a different
    /// algorithm, are ignored.
    pub fn load_stats(&self) -> Result<usize> {
        let records = self.stats_repo.load_all()?;
        let states = self.states.read();
        let mut restored = 0;
        for record in records {
            let Some(slot) = states.get(&record.key) else {
                continue;
            };
            let mut state = slot.write();
            if state.algorithm_id != record.algorithm_id {
                continue;
            }
            state.stats.insert(record.variant, record.stats);
            restored += 1;
        }
        debug!(restored, "loaded custom algorithm stats");
        Ok(restored)
    }

    /// Upsert the local stats of every registered feature.
    pub fn flush_stats(&self) -> Result<usize> {
        let records: Vec<CustomStatsRecord> = {
            let states = self.states.read();
            let mut records = Vec::new();
            for (key, slot) in states.iter() {
                let state = slot.read();
                for (variant, stats) in &state.stats {
                    if stats.is_zero() {
                        continue;
                    }
                    records.push(CustomStatsRecord {
                        algorithm_id: state.algorithm_id.clone(),
                        key: key.clone(),
                        variant: variant.clone(),
                        stats: stats.clone(),
                    });
                }
            }
            records
        };

        if records.is_empty() {
            return Ok(0);
        }
        self.stats_repo.upsert_batch(&records)?;
        Ok(records.len())
    }
}

/// Accept a guest-chosen variant if it is one the feature serves.
fn accept_variant(
    key: &StateKey,
    state: &CustomAlgorithmState,
    variant: Option<String>,
) -> Option<String> {
    match variant {
        Some(v) if !v.is_empty() && (state.variants.is_empty() || state.variants.contains(&v)) => {
            Some(v)
        }
        other => {
            warn!(
                feature = %key,
                variant = ?other,
                "custom algorithm returned an unknown variant"
            );
            None
        }
    }
}

impl std::fmt::Debug for CustomAlgorithmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomAlgorithmManager")
            .field("features", &self.len())
            .field("instances", &self.pooled_instances())
            .finish()
    }
}
