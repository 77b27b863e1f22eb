//! In-memory implementation of every repository trait.
//!
//! Stats written through [`StatsRepository::insert_batch`] are kept both as
//! an append-only row log and folded into cumulative totals, so a second
//! engine loading from the same repository sees what the first one flushed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::{
    AlgorithmConfigRecord, AlgorithmConfigRepository, CustomAlgorithmRecord,
    CustomAlgorithmRepository, CustomStatsRecord, CustomStatsRepository, FeatureIds,
    FeatureLookup, RepoResult, RepositoryError, StatsRecord, StatsRepository, StatsRow,
    VariantRepository, VariantSetRecord,
};
use crate::algorithms::{Settings, StateKey, VariantStats};
use crate::sandbox::{content_hash, CustomKind};

type StatsKey = (StateKey, String, String);
type CustomStatsKey = (String, StateKey, String);

#[derive(Default)]
struct Tables {
    configs: Vec<AlgorithmConfigRecord>,
    variant_sets: HashMap<StateKey, Vec<String>>,
    features: HashMap<StateKey, FeatureIds>,
    stats: HashMap<StatsKey, VariantStats>,
    stats_log: Vec<StatsRow>,
    algorithms: HashMap<String, CustomAlgorithmRecord>,
    custom_stats: HashMap<CustomStatsKey, VariantStats>,
}

/// Thread-safe in-memory store backing all engine collaborators.
#[derive(Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    fail_custom_stats_reads: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a feature with its variants and algorithm, and make it resolvable
    /// by [`FeatureLookup`].
    pub fn add_feature(
        &self,
        key: StateKey,
        algorithm_slug: &str,
        variants: &[&str],
        settings: Settings,
    ) -> FeatureIds {
        let ids = FeatureIds {
            project_id: "default".to_string(),
            environment_id: key.environment_key.clone(),
            feature_id: key.feature_key.clone(),
        };
        let mut tables = self.tables.write();
        tables.configs.retain(|c| c.key != key);
        tables.configs.push(AlgorithmConfigRecord {
            key: key.clone(),
            algorithm_slug: algorithm_slug.to_string(),
            enabled: true,
            settings,
            custom_algorithm_id: None,
        });
        tables
            .variant_sets
            .insert(key.clone(), variants.iter().map(|v| v.to_string()).collect());
        tables.features.insert(key, ids.clone());
        ids
    }

    pub fn put_config(&self, record: AlgorithmConfigRecord) {
        let mut tables = self.tables.write();
        tables.configs.retain(|c| c.key != record.key);
        tables.configs.push(record);
    }

    pub fn put_variants(&self, key: StateKey, variants: Vec<String>) {
        self.tables.write().variant_sets.insert(key, variants);
    }

    pub fn put_feature_ids(&self, key: StateKey, ids: FeatureIds) {
        self.tables.write().features.insert(key, ids);
    }

    /// Seed cumulative stats, as if flushed by an earlier run.
    pub fn put_stats(&self, record: StatsRecord) {
        let key = (record.key, record.algorithm_slug, record.variant);
        self.tables.write().stats.insert(key, record.stats);
    }

    /// Store a custom algorithm, computing its content hash.
    pub fn put_algorithm(
        &self,
        id: &str,
        name: &str,
        kind: CustomKind,
        binary: Vec<u8>,
    ) -> CustomAlgorithmRecord {
        let record = CustomAlgorithmRecord {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            content_hash: content_hash(&binary),
            binary,
        };
        self.tables
            .write()
            .algorithms
            .insert(id.to_string(), record.clone());
        record
    }

    /// Make subsequent writes fail, for exercising retry paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent reads fail, for exercising load errors.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make only custom stats reads fail, the last read of a load.
    pub fn set_fail_custom_stats_reads(&self, fail: bool) {
        self.fail_custom_stats_reads.store(fail, Ordering::SeqCst);
    }

    /// Cumulative persisted counters for one variant.
    pub fn stats_for(
        &self,
        key: &StateKey,
        algorithm_slug: &str,
        variant: &str,
    ) -> Option<VariantStats> {
        let lookup = (key.clone(), algorithm_slug.to_string(), variant.to_string());
        self.tables.read().stats.get(&lookup).cloned()
    }

    /// Every row ever appended, in insertion order.
    pub fn stats_log(&self) -> Vec<StatsRow> {
        self.tables.read().stats_log.clone()
    }

    pub fn custom_stats_for(
        &self,
        algorithm_id: &str,
        key: &StateKey,
        variant: &str,
    ) -> Option<VariantStats> {
        let lookup = (algorithm_id.to_string(), key.clone(), variant.to_string());
        self.tables.read().custom_stats.get(&lookup).cloned()
    }

    fn check_read(&self) -> RepoResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(RepositoryError::new("read failure injected"));
        }
        Ok(())
    }

    fn check_write(&self) -> RepoResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::new("write failure injected"));
        }
        Ok(())
    }
}

impl AlgorithmConfigRepository for MemoryRepository {
    fn list_configs(&self) -> RepoResult<Vec<AlgorithmConfigRecord>> {
        self.check_read()?;
        Ok(self.tables.read().configs.clone())
    }
}

impl VariantRepository for MemoryRepository {
    fn list_variant_sets(&self) -> RepoResult<Vec<VariantSetRecord>> {
        self.check_read()?;
        Ok(self
            .tables
            .read()
            .variant_sets
            .iter()
            .map(|(key, variants)| VariantSetRecord {
                key: key.clone(),
                variants: variants.clone(),
            })
            .collect())
    }
}

impl StatsRepository for MemoryRepository {
    fn load_all(&self) -> RepoResult<Vec<StatsRecord>> {
        self.check_read()?;
        Ok(self
            .tables
            .read()
            .stats
            .iter()
            .map(|((key, slug, variant), stats)| StatsRecord {
                key: key.clone(),
                algorithm_slug: slug.clone(),
                variant: variant.clone(),
                stats: stats.clone(),
            })
            .collect())
    }

    fn insert_batch(&self, rows: &[StatsRow]) -> RepoResult<()> {
        self.check_write()?;
        let mut tables = self.tables.write();

        // Resolve every row before touching totals so a bad row stores nothing.
        let mut resolved = Vec::with_capacity(rows.len());
        for row in rows {
            let key = tables
                .features
                .iter()
                .find(|(_, ids)| **ids == row.ids)
                .map(|(key, _)| key.clone())
                .ok_or_else(|| {
                    RepositoryError::new(format!("unknown feature id {}", row.ids.feature_id))
                })?;
            resolved.push((key, row));
        }

        for (key, row) in resolved {
            tables
                .stats
                .entry((key, row.algorithm_slug.clone(), row.variant.clone()))
                .or_default()
                .accumulate(&row.delta);
            tables.stats_log.push(row.clone());
        }
        Ok(())
    }
}

impl FeatureLookup for MemoryRepository {
    fn resolve(&self, feature_key: &str, environment_key: &str) -> RepoResult<Option<FeatureIds>> {
        self.check_read()?;
        let key = StateKey::new(feature_key, environment_key);
        Ok(self.tables.read().features.get(&key).cloned())
    }
}

impl CustomAlgorithmRepository for MemoryRepository {
    fn list_algorithms(&self) -> RepoResult<Vec<CustomAlgorithmRecord>> {
        self.check_read()?;
        Ok(self.tables.read().algorithms.values().cloned().collect())
    }

    fn get_algorithm(&self, id: &str) -> RepoResult<Option<CustomAlgorithmRecord>> {
        self.check_read()?;
        Ok(self.tables.read().algorithms.get(id).cloned())
    }
}

impl CustomStatsRepository for MemoryRepository {
    fn load_all(&self) -> RepoResult<Vec<CustomStatsRecord>> {
        self.check_read()?;
        if self.fail_custom_stats_reads.load(Ordering::SeqCst) {
            return Err(RepositoryError::new("custom stats read failure injected"));
        }
        Ok(self
            .tables
            .read()
            .custom_stats
            .iter()
            .map(|((algorithm_id, key, variant), stats)| CustomStatsRecord {
                algorithm_id: algorithm_id.clone(),
                key: key.clone(),
                variant: variant.clone(),
                stats: stats.clone(),
            })
            .collect())
    }

    fn upsert_batch(&self, records: &[CustomStatsRecord]) -> RepoResult<()> {
        self.check_write()?;
        let mut tables = self.tables.write();
        for record in records {
            tables.custom_stats.insert(
                (
                    record.algorithm_id.clone(),
                    record.key.clone(),
                    record.variant.clone(),
                ),
                record.stats.clone(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(evaluations: u64, successes: u64) -> VariantStats {
        VariantStats {
            evaluations,
            successes,
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_batch_accumulates() {
        let repo = MemoryRepository::new();
        let key = StateKey::new("checkout", "prod");
        let ids = repo.add_feature(key.clone(), "ucb", &["a", "b"], Settings::new());

        let row = StatsRow {
            ids,
            algorithm_slug: "ucb".into(),
            variant: "a".into(),
            delta: delta(3, 1),
        };
        repo.insert_batch(&[row.clone(), row]).unwrap();

        assert_eq!(repo.stats_for(&key, "ucb", "a"), Some(delta(6, 2)));
        assert_eq!(repo.stats_log().len(), 2);
        assert_eq!(StatsRepository::load_all(&repo).unwrap().len(), 1);
    }

    #[test]
    fn test_insert_batch_is_all_or_nothing() {
        let repo = MemoryRepository::new();
        let key = StateKey::new("checkout", "prod");
        let ids = repo.add_feature(key.clone(), "ucb", &["a"], Settings::new());

        let good = StatsRow {
            ids,
            algorithm_slug: "ucb".into(),
            variant: "a".into(),
            delta: delta(1, 0),
        };
        let bad = StatsRow {
            ids: FeatureIds {
                project_id: "x".into(),
                environment_id: "x".into(),
                feature_id: "x".into(),
            },
            ..good.clone()
        };
        assert!(repo.insert_batch(&[good, bad]).is_err());
        assert!(repo.stats_for(&key, "ucb", "a").is_none());
        assert!(repo.stats_log().is_empty());
    }

    #[test]
    fn test_failure_injection() {
        let repo = MemoryRepository::new();
        repo.set_fail_reads(true);
        assert!(repo.list_configs().is_err());
        repo.set_fail_reads(false);
        assert!(repo.list_configs().unwrap().is_empty());

        repo.set_fail_writes(true);
        assert!(repo.insert_batch(&[]).is_err());
        assert!(repo.upsert_batch(&[]).is_err());
    }

    #[test]
    fn test_put_algorithm_hashes_binary() {
        let repo = MemoryRepository::new();
        let record = repo.put_algorithm("alg-1", "demo", CustomKind::Bandit, b"abc".to_vec());
        assert_eq!(
            record.content_hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(repo.get_algorithm("alg-1").unwrap(), Some(record));
        assert!(repo.get_algorithm("nope").unwrap().is_none());
    }

    #[test]
    fn test_custom_stats_upsert_replaces() {
        let repo = MemoryRepository::new();
        let key = StateKey::new("f", "e");
        let mut record = CustomStatsRecord {
            algorithm_id: "alg".into(),
            key: key.clone(),
            variant: "a".into(),
            stats: delta(1, 0),
        };
        repo.upsert_batch(&[record.clone()]).unwrap();
        record.stats = delta(5, 2);
        repo.upsert_batch(&[record]).unwrap();
        assert_eq!(repo.custom_stats_for("alg", &key, "a"), Some(delta(5, 2)));
    }
}
