//! In-memory decision state and its write-behind persistence.
//!
//! The [`StateStore`] owns one slot per registered (feature, environment)
//! pair. Evaluation and feedback only touch memory; [`StateStore::flush_all`]
//! periodically appends the counters accumulated since the previous flush.
//!
//! # Locking
//!
//! ```text
//! states / contextual     RwLock<HashMap<StateKey, Arc<Slot>>>
//!   read: lookup, clone the Arc, release      write: register / unregister / load
//!
//! Slot.state              RwLock<AlgorithmState | ContextualAlgorithmState>
//!   write: evaluate (bandit), feedback        read: optimizer proposal, contextual
//!                                                   selection, flush snapshot
//!
//! Slot.persisted          Mutex<baseline>, touched only under flush_lock
//! ```
//!
//! The map lock is never held while a slot lock is taken for writing, so
//! registration does not wait on a slow feedback call and vice versa.

mod slot;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use self::slot::{Counters, Slot};
use crate::algorithms::{
    bandit, contextual, optimizer, AlgorithmState, AlgorithmType, ContextualAlgorithmState,
    FeedbackEvent, OptimizerFeedback, Settings, StateKey, VariantStats, CUSTOM_SLUG,
};
use crate::custom::{CustomAlgorithmManager, Registration, StagedRegistrations};
use crate::encoding::{encode_context, Context};
use crate::error::{EngineError, Result};
use crate::metrics::EngineMetrics;
use crate::repository::{
    AlgorithmConfigRecord, AlgorithmConfigRepository, CachedFeatureLookup, FeatureLookup,
    StatsRepository, StatsRow, VariantRepository,
};

/// Largest accepted contextual dimension. Each arm holds a `d x d` matrix.
pub const MAX_DIMENSION: usize = 4096;

type BanditSlot = Arc<Slot<AlgorithmState>>;
type ContextualSlot = Arc<Slot<ContextualAlgorithmState>>;

/// Repositories the store reads configuration from and flushes stats to.
#[derive(Clone)]
pub struct StoreRepositories {
    pub configs: Arc<dyn AlgorithmConfigRepository>,
    pub variants: Arc<dyn VariantRepository>,
    pub stats: Arc<dyn StatsRepository>,
    pub features: Arc<dyn FeatureLookup>,
}

impl StoreRepositories {
    /// Use one object for every repository role.
    pub fn from_shared<R>(repo: Arc<R>) -> Self
    where
        R: AlgorithmConfigRepository
            + VariantRepository
            + StatsRepository
            + FeatureLookup
            + 'static,
    {
        Self {
            configs: repo.clone(),
            variants: repo.clone(),
            stats: repo.clone(),
            features: repo,
        }
    }
}

impl std::fmt::Debug for StoreRepositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRepositories").finish_non_exhaustive()
    }
}

/// Counts from one [`StateStore::load_state`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub bandits: usize,
    pub contextual: usize,
    pub custom: usize,
    pub skipped: usize,
    /// Persisted stats records applied to loaded states.
    pub restored_stats: usize,
    /// Variants whose unflushed counters moved into the reloaded state.
    pub carried: usize,
}

impl LoadSummary {
    pub fn loaded(&self) -> usize {
        self.bandits + self.contextual + self.custom
    }
}

/// Registry of per-feature algorithm state.
pub struct StateStore {
    states: RwLock<HashMap<StateKey, BanditSlot>>,
    contextual: RwLock<HashMap<StateKey, ContextualSlot>>,
    custom: Option<Arc<CustomAlgorithmManager>>,
    configs: Arc<dyn AlgorithmConfigRepository>,
    variants: Arc<dyn VariantRepository>,
    stats: Arc<dyn StatsRepository>,
    lookup: CachedFeatureLookup,
    metrics: EngineMetrics,
    default_dimension: usize,
    /// Serializes flushes so baselines advance in order.
    flush_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(
        repositories: StoreRepositories,
        custom: Option<Arc<CustomAlgorithmManager>>,
        metrics: EngineMetrics,
        default_dimension: usize,
    ) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            contextual: RwLock::new(HashMap::new()),
            custom,
            configs: repositories.configs,
            variants: repositories.variants,
            stats: repositories.stats,
            lookup: CachedFeatureLookup::new(repositories.features),
            metrics,
            default_dimension: default_dimension.clamp(1, MAX_DIMENSION),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn custom_manager(&self) -> Option<&Arc<CustomAlgorithmManager>> {
        self.custom.as_ref()
    }

    /// Rebuild every state from the repositories.
    ///
    /// Configurations are joined with their variant sets and persisted
    /// stats. Features without a variant set, and configurations naming an
    /// unknown algorithm, are skipped with a warning. Every read happens
    /// before anything is replaced, so a repository failure aborts the load
    /// and leaves the current state untouched.
    ///
    /// Counters not yet flushed are carried into the reloaded state of the
    /// same feature and algorithm, and go out with the next flush.
    pub fn load_state(&self) -> Result<LoadSummary> {
        let _guard = self.flush_lock.lock();

        let configs = self.configs.list_configs()?;
        let mut variant_sets: HashMap<StateKey, Vec<String>> = self
            .variants
            .list_variant_sets()?
            .into_iter()
            .map(|record| (record.key, record.variants))
            .collect();

        let mut persisted: HashMap<(StateKey, String), Vec<(String, VariantStats)>> =
            HashMap::new();
        for record in self.stats.load_all()? {
            persisted
                .entry((record.key, record.algorithm_slug))
                .or_default()
                .push((record.variant, record.stats));
        }

        let mut summary = LoadSummary::default();
        let mut states = HashMap::new();
        let mut contextual = HashMap::new();
        let mut custom = Vec::new();

        for config in configs {
            let Some(variants) = variant_sets.remove(&config.key) else {
                warn!(feature = %config.key, "skipping feature without a variant set");
                summary.skipped += 1;
                continue;
            };

            if config.algorithm_slug == CUSTOM_SLUG {
                custom.push((config, variants));
                continue;
            }

            let algorithm: AlgorithmType = match config.algorithm_slug.parse() {
                Ok(algorithm) => algorithm,
                Err(e) => {
                    warn!(feature = %config.key, %e, "skipping feature");
                    summary.skipped += 1;
                    continue;
                }
            };

            let restore = persisted
                .remove(&(config.key.clone(), config.algorithm_slug.clone()))
                .unwrap_or_default();

            if algorithm.is_contextual() {
                let dimension = config
                    .settings
                    .get_usize("dimension", self.default_dimension);
                if !(1..=MAX_DIMENSION).contains(&dimension) {
                    warn!(
                        feature = %config.key,
                        dimension,
                        max = MAX_DIMENSION,
                        "skipping contextual feature with an unusable dimension"
                    );
                    summary.skipped += 1;
                    continue;
                }
                let mut state =
                    ContextualAlgorithmState::new(algorithm, dimension, variants, config.settings);
                state.enabled = config.enabled;
                restore_counters(&mut state, &restore);
                contextual.insert(config.key, Arc::new(Slot::loaded(state)));
                summary.contextual += 1;
            } else {
                let mut state = AlgorithmState::new(algorithm, variants, config.settings);
                state.enabled = config.enabled;
                restore_counters(&mut state, &restore);
                states.insert(config.key, Arc::new(Slot::loaded(state)));
                summary.bandits += 1;
            }
            summary.restored_stats += restore.len();
        }

        let staged = self.stage_custom(custom, &mut summary)?;

        // Nothing below can fail.
        summary.carried =
            swap_in(&self.states, states) + swap_in(&self.contextual, contextual);
        if let (Some(manager), Some(staged)) = (&self.custom, staged) {
            manager.commit(staged);
        }
        self.update_gauge();

        info!(
            bandits = summary.bandits,
            contextual = summary.contextual,
            custom = summary.custom,
            skipped = summary.skipped,
            restored_stats = summary.restored_stats,
            carried = summary.carried,
            "loaded decision state"
        );
        Ok(summary)
    }

    /// Read custom registrations and their stats without applying them.
    fn stage_custom(
        &self,
        configs: Vec<(AlgorithmConfigRecord, Vec<String>)>,
        summary: &mut LoadSummary,
    ) -> Result<Option<StagedRegistrations>> {
        let Some(manager) = &self.custom else {
            if !configs.is_empty() {
                warn!(
                    count = configs.len(),
                    "custom algorithms configured but no sandbox is available"
                );
                summary.skipped += configs.len();
            }
            return Ok(None);
        };

        let mut registrations = Vec::with_capacity(configs.len());
        for (config, variants) in configs {
            let Some(algorithm_id) = config.custom_algorithm_id else {
                warn!(feature = %config.key, "custom feature has no algorithm id");
                summary.skipped += 1;
                continue;
            };
            registrations.push(Registration {
                key: config.key,
                algorithm_id,
                variants,
                settings: config.settings,
                enabled: config.enabled,
            });
        }

        let staged = manager.stage(registrations)?;
        summary.custom = staged.len();
        summary.skipped += staged.skipped;
        summary.restored_stats += staged.restored;
        Ok(Some(staged))
    }

    /// Register a context-free bandit or optimizer, replacing any state the
    /// key had.
    pub fn register_algorithm(
        &self,
        key: StateKey,
        algorithm: AlgorithmType,
        variants: Vec<String>,
        settings: Settings,
    ) -> Result<()> {
        if algorithm.is_contextual() {
            return Err(invalid(&key, "contextual algorithms need register_contextual"));
        }
        if !algorithm.is_optimizer() && variants.is_empty() {
            return Err(invalid(&key, "a bandit needs at least one variant"));
        }

        let state = AlgorithmState::new(algorithm, variants, settings);
        self.remove_everywhere(&key);
        debug!(feature = %key, algorithm = algorithm.slug(), "registered algorithm");
        self.states.write().insert(key, Arc::new(Slot::fresh(state)));
        self.update_gauge();
        Ok(())
    }

    /// Register a contextual bandit. The vector dimension comes from the
    /// `dimension` setting, falling back to the configured default.
    pub fn register_contextual(
        &self,
        key: StateKey,
        algorithm: AlgorithmType,
        variants: Vec<String>,
        settings: Settings,
    ) -> Result<()> {
        if !algorithm.is_contextual() {
            return Err(invalid(&key, "not a contextual algorithm"));
        }
        let dimension = settings.get_usize("dimension", self.default_dimension);
        if !(1..=MAX_DIMENSION).contains(&dimension) {
            return Err(invalid(&key, "dimension must be between 1 and 4096"));
        }

        let state = ContextualAlgorithmState::new(algorithm, dimension, variants, settings);
        self.remove_everywhere(&key);
        debug!(
            feature = %key,
            algorithm = algorithm.slug(),
            dimension,
            "registered contextual algorithm"
        );
        self.contextual
            .write()
            .insert(key, Arc::new(Slot::fresh(state)));
        self.update_gauge();
        Ok(())
    }

    /// Bind a feature to a sandboxed custom algorithm.
    pub fn register_custom_algorithm(
        &self,
        key: StateKey,
        algorithm_id: &str,
        variants: Vec<String>,
        settings: Settings,
    ) -> Result<()> {
        let manager = self
            .custom
            .as_ref()
            .ok_or(EngineError::MissingCollaborator("custom algorithm repository"))?;
        self.states.write().remove(&key);
        self.contextual.write().remove(&key);
        manager.register_custom_algorithm(key, algorithm_id, variants, settings, true)?;
        self.update_gauge();
        Ok(())
    }

    /// Drop a feature's state. Unflushed counters are discarded.
    pub fn unregister(&self, key: &StateKey) -> bool {
        let removed = self.remove_everywhere(key);
        self.lookup.invalidate(key);
        self.update_gauge();
        removed
    }

    fn remove_everywhere(&self, key: &StateKey) -> bool {
        let bandit = self.states.write().remove(key).is_some();
        let contextual = self.contextual.write().remove(key).is_some();
        let custom = self
            .custom
            .as_ref()
            .is_some_and(|m| m.unregister_custom_algorithm(key));
        bandit || contextual || custom
    }

    /// Number of registered features across all algorithm families.
    pub fn len(&self) -> usize {
        self.states.read().len()
            + self.contextual.read().len()
            + self.custom.as_ref().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self, key: &StateKey) -> Option<AlgorithmState> {
        let slot = self.states.read().get(key).cloned()?;
        let state = slot.state.read().clone();
        Some(state)
    }

    pub fn contextual_snapshot(&self, key: &StateKey) -> Option<ContextualAlgorithmState> {
        let slot = self.contextual.read().get(key).cloned()?;
        let state = slot.state.read().clone();
        Some(state)
    }

    fn bandit_slot(&self, key: &StateKey) -> Option<BanditSlot> {
        self.states.read().get(key).cloned()
    }

    fn contextual_slot(&self, key: &StateKey) -> Option<ContextualSlot> {
        self.contextual.read().get(key).cloned()
    }

    fn custom_for(&self, key: &StateKey) -> Option<&CustomAlgorithmManager> {
        self.custom.as_deref().filter(|m| m.contains(key))
    }

    fn update_gauge(&self) {
        self.metrics.registered_features.set(self.len() as i64);
    }

    /// Pick a variant for a context-free bandit feature.
    ///
    /// `None` when the feature is unknown, disabled, an optimizer, or has no
    /// variants.
    pub fn evaluate_feature(&self, key: &StateKey) -> Option<String> {
        let decision = if let Some(slot) = self.bandit_slot(key) {
            let mut state = slot.state.write();
            if state.enabled && !state.is_optimizer {
                bandit::select_variant(&mut state, &mut rand::thread_rng())
            } else {
                None
            }
        } else if let Some(manager) = self.custom_for(key) {
            manager.evaluate_bandit(key)
        } else {
            None
        };
        self.metrics.record_decision(decision.is_some());
        decision
    }

    /// Propose a value for an optimizer feature.
    pub fn evaluate_optimizer(&self, key: &StateKey) -> Option<f64> {
        let value = if let Some(slot) = self.bandit_slot(key) {
            let state = slot.state.read();
            (state.enabled && state.is_optimizer)
                .then(|| optimizer::propose_value(&state, &mut rand::thread_rng()))
        } else if let Some(manager) = self.custom_for(key) {
            manager.evaluate_optimizer(key)
        } else {
            None
        };
        self.metrics.record_decision(value.is_some());
        value
    }

    /// Pick a variant for a contextual feature given request attributes.
    pub fn evaluate_contextual(&self, key: &StateKey, context: &Context) -> Option<String> {
        let decision = if let Some(slot) = self.contextual_slot(key) {
            let state = slot.state.read();
            if state.enabled {
                let x = encode_context(context, state.dimension);
                contextual::select_contextual(&state, &x, &mut rand::thread_rng())
            } else {
                None
            }
        } else if let Some(manager) = self.custom_for(key) {
            manager.evaluate_contextual(key, context)
        } else {
            None
        };
        self.metrics.record_decision(decision.is_some());
        decision
    }

    /// Record a feedback event for a bandit variant.
    ///
    /// Returns `false` if the feature is unknown, disabled, or not a bandit.
    pub fn handle_feedback(
        &self,
        key: &StateKey,
        variant: &str,
        event: FeedbackEvent,
        metric: Option<Decimal>,
    ) -> bool {
        let handled = if let Some(slot) = self.bandit_slot(key) {
            let mut state = slot.state.write();
            if state.enabled && !state.is_optimizer {
                state.stats_mut(variant).apply(event, metric);
                true
            } else {
                false
            }
        } else if let Some(manager) = self.custom_for(key) {
            manager.handle_feedback(key, variant, event, metric)
        } else {
            false
        };
        self.record_feedback(key, handled);
        handled
    }

    /// Feed an observed metric back into an optimizer.
    pub fn handle_optimizer_feedback(&self, key: &StateKey, feedback: OptimizerFeedback) -> bool {
        let handled = if let Some(slot) = self.bandit_slot(key) {
            let mut state = slot.state.write();
            if state.enabled && state.is_optimizer {
                let next =
                    optimizer::apply_feedback(&mut state, feedback, &mut rand::thread_rng());
                debug!(
                    feature = %key,
                    value = feedback.value,
                    metric = feedback.metric,
                    next,
                    "optimizer feedback"
                );
                true
            } else {
                false
            }
        } else if let Some(manager) = self.custom_for(key) {
            manager.handle_optimizer_feedback(key, feedback)
        } else {
            false
        };
        self.record_feedback(key, handled);
        handled
    }

    /// Update a contextual arm with the reward observed under `context`.
    pub fn handle_contextual_feedback(
        &self,
        key: &StateKey,
        variant: &str,
        context: &Context,
        reward: f64,
    ) -> bool {
        let handled = if let Some(slot) = self.contextual_slot(key) {
            let mut state = slot.state.write();
            if state.enabled {
                let x = encode_context(context, state.dimension);
                contextual::contextual_update(&mut state, variant, &x, reward)
            } else {
                false
            }
        } else if let Some(manager) = self.custom_for(key) {
            manager.handle_contextual_feedback(key, variant, context, reward)
        } else {
            false
        };
        self.record_feedback(key, handled);
        handled
    }

    fn record_feedback(&self, key: &StateKey, handled: bool) {
        if handled {
            self.metrics.feedback_events.inc();
        } else {
            debug!(feature = %key, "feedback ignored");
        }
    }

    /// Persist counters accumulated since the previous successful flush.
    ///
    /// Deltas are appended in a single batch. The baseline of each variant
    /// advances only once the batch is stored, so a failed flush is retried
    /// in full by the next one. Features that do not resolve to internal ids
    /// are skipped and keep accumulating. Custom algorithm stats are
    /// upserted afterwards. Returns the number of rows written.
    pub fn flush_all(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock();

        let bandits: Vec<(StateKey, BanditSlot)> = self
            .states
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        let contextual: Vec<(StateKey, ContextualSlot)> = self
            .contextual
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();

        let mut rows = Vec::new();
        let mut commits: Vec<Box<dyn FnOnce()>> = Vec::new();
        for (key, slot) in &bandits {
            self.collect(key, slot, &mut rows, &mut commits)?;
        }
        for (key, slot) in &contextual {
            self.collect(key, slot, &mut rows, &mut commits)?;
        }

        let written = rows.len();
        if !rows.is_empty() {
            if let Err(e) = self.stats.insert_batch(&rows) {
                self.metrics.flush_errors.inc();
                warn!(rows = written, %e, "stats flush failed; will retry");
                return Err(e.into());
            }
            for commit in commits {
                commit();
            }
            self.metrics.flushed_rows.inc_by(written as u64);
        }

        let custom = match &self.custom {
            Some(manager) => manager.flush_stats().inspect_err(|e| {
                self.metrics.flush_errors.inc();
                warn!(%e, "custom stats flush failed");
            })?,
            None => 0,
        };

        debug!(rows = written, custom, "flushed stats");
        Ok(written + custom)
    }

    /// Queue the pending deltas of one slot, with a commit that advances its
    /// baseline.
    fn collect<S: Counters + 'static>(
        &self,
        key: &StateKey,
        slot: &Arc<Slot<S>>,
        rows: &mut Vec<StatsRow>,
        commits: &mut Vec<Box<dyn FnOnce()>>,
    ) -> Result<()> {
        let (slug, pending) = slot.pending();
        if pending.is_empty() {
            return Ok(());
        }

        let ids = match self.lookup.resolve(&key.feature_key, &key.environment_key) {
            Ok(Some(ids)) => ids,
            Ok(None) => {
                warn!(feature = %key, "feature does not resolve; keeping its stats in memory");
                return Ok(());
            }
            Err(e) => {
                self.metrics.flush_errors.inc();
                return Err(e.into());
            }
        };

        for delta in pending {
            rows.push(StatsRow {
                ids: ids.clone(),
                algorithm_slug: slug.to_string(),
                variant: delta.variant.clone(),
                delta: delta.delta,
            });
            let slot = slot.clone();
            let total = delta.total;
            let variant = delta.variant;
            commits.push(Box::new(move || slot.mark_persisted(&variant, total)));
        }
        Ok(())
    }
}

/// Replace the slots in `map` with `next`, carrying unflushed counters from
/// each retired slot into its successor. Returns the number of variants
/// carried.
fn swap_in<S: Counters>(
    map: &RwLock<HashMap<StateKey, Arc<Slot<S>>>>,
    next: HashMap<StateKey, Arc<Slot<S>>>,
) -> usize {
    let retired = std::mem::replace(&mut *map.write(), next);

    let pairs: Vec<(Arc<Slot<S>>, Arc<Slot<S>>)> = {
        let current = map.read();
        retired
            .into_iter()
            .filter_map(|(key, old)| match current.get(&key) {
                Some(new) => Some((old, new.clone())),
                None => {
                    if !old.pending().1.is_empty() {
                        warn!(feature = %key, "dropping unflushed stats of a removed feature");
                    }
                    None
                }
            })
            .collect()
    };
    pairs.iter().map(|(old, new)| new.carry_from(old)).sum()
}

fn restore_counters<S: Counters>(state: &mut S, records: &[(String, VariantStats)]) {
    for (variant, stats) in records {
        state.restore(variant, stats);
    }
}

fn invalid(key: &StateKey, reason: &str) -> EngineError {
    EngineError::InvalidRegistration {
        feature: key.feature_key.clone(),
        environment: key.environment_key.clone(),
        reason: reason.to_string(),
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("bandits", &self.states.read().len())
            .field("contextual", &self.contextual.read().len())
            .field("custom", &self.custom)
            .field("default_dimension", &self.default_dimension)
            .finish()
    }
}
