//! Interfaces to durable storage.
//!
//! The engine never talks to a database directly. Each concern is a small
//! `Send + Sync` trait so a deployment can back it with whatever store it
//! runs; [`memory::MemoryRepository`] implements all of them in memory.
//!
//! ```text
//! AlgorithmConfigRepository ─┐
//! VariantRepository ─────────┼─► StateStore::load_state()
//! StatsRepository::load_all ─┘
//!
//! StateStore::flush_all() ─► FeatureLookup ─► StatsRepository::insert_batch
//!
//! CustomAlgorithmRepository ─► CustomAlgorithmManager (lazy compile)
//! CustomStatsRepository ◄──► CustomAlgorithmManager (load / upsert)
//! ```

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::algorithms::{Settings, StateKey, VariantStats};
use crate::sandbox::CustomKind;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure reported by a storage collaborator.
#[derive(Debug, Error)]
#[error("repository error: {message}")]
pub struct RepositoryError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl RepositoryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Result type alias for repository calls.
pub type RepoResult<T> = std::result::Result<T, RepositoryError>;

/// Which algorithm drives one (feature, environment) pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmConfigRecord {
    pub key: StateKey,
    /// Built-in slug, or `"custom"` for sandboxed algorithms.
    pub algorithm_slug: String,
    pub enabled: bool,
    #[serde(default)]
    pub settings: Settings,
    /// Set when `algorithm_slug` is `"custom"`.
    #[serde(default)]
    pub custom_algorithm_id: Option<String>,
}

/// Ordered variant names for one (feature, environment) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSetRecord {
    pub key: StateKey,
    pub variants: Vec<String>,
}

/// Cumulative persisted counters for one variant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub key: StateKey,
    pub algorithm_slug: String,
    pub variant: String,
    pub stats: VariantStats,
}

/// Stable internal identifiers of a (feature, environment) pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureIds {
    pub project_id: String,
    pub environment_id: String,
    pub feature_id: String,
}

/// Counters accumulated since the previous flush, ready to append.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRow {
    pub ids: FeatureIds,
    pub algorithm_slug: String,
    pub variant: String,
    pub delta: VariantStats,
}

/// A stored custom algorithm: metadata, module bytes and their content hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomAlgorithmRecord {
    pub id: String,
    pub name: String,
    pub kind: CustomKind,
    /// Hex SHA-256 of `binary`; keys the compiled-module cache.
    pub content_hash: String,
    #[serde(with = "serde_bytes_hex")]
    pub binary: Vec<u8>,
}

/// Persisted counters of one variant of a custom-algorithm feature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomStatsRecord {
    pub algorithm_id: String,
    pub key: StateKey,
    pub variant: String,
    pub stats: VariantStats,
}

pub trait AlgorithmConfigRepository: Send + Sync {
    fn list_configs(&self) -> RepoResult<Vec<AlgorithmConfigRecord>>;
}

pub trait VariantRepository: Send + Sync {
    fn list_variant_sets(&self) -> RepoResult<Vec<VariantSetRecord>>;
}

pub trait StatsRepository: Send + Sync {
    /// Cumulative counters per (feature, environment, algorithm, variant).
    fn load_all(&self) -> RepoResult<Vec<StatsRecord>>;

    /// Append counter deltas. Either every row is stored or none is.
    fn insert_batch(&self, rows: &[StatsRow]) -> RepoResult<()>;
}

pub trait FeatureLookup: Send + Sync {
    /// Resolve keys to internal identifiers; `None` if the pair is unknown.
    fn resolve(&self, feature_key: &str, environment_key: &str) -> RepoResult<Option<FeatureIds>>;
}

pub trait CustomAlgorithmRepository: Send + Sync {
    fn list_algorithms(&self) -> RepoResult<Vec<CustomAlgorithmRecord>>;
    fn get_algorithm(&self, id: &str) -> RepoResult<Option<CustomAlgorithmRecord>>;
}

pub trait CustomStatsRepository: Send + Sync {
    fn load_all(&self) -> RepoResult<Vec<CustomStatsRecord>>;
    fn upsert_batch(&self, records: &[CustomStatsRecord]) -> RepoResult<()>;
}

/// [`FeatureLookup`] with an in-memory cache of successful resolutions.
///
/// Misses are not cached, so a feature created after startup resolves on a
/// later flush.
pub struct CachedFeatureLookup {
    inner: Arc<dyn FeatureLookup>,
    cache: RwLock<HashMap<StateKey, FeatureIds>>,
}

impl CachedFeatureLookup {
    pub fn new(inner: Arc<dyn FeatureLookup>) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }

    /// Drop a cached entry, e.g. after the feature was deleted.
    pub fn invalidate(&self, key: &StateKey) {
        self.cache.write().remove(key);
    }
}

impl FeatureLookup for CachedFeatureLookup {
    fn resolve(&self, feature_key: &str, environment_key: &str) -> RepoResult<Option<FeatureIds>> {
        let key = StateKey::new(feature_key, environment_key);
        if let Some(ids) = self.cache.read().get(&key) {
            return Ok(Some(ids.clone()));
        }

        let resolved = self.inner.resolve(feature_key, environment_key)?;
        if let Some(ref ids) = resolved {
            self.cache.write().insert(key, ids.clone());
        }
        Ok(resolved)
    }
}

/// Hex encoding keeps module bytes readable in JSON/TOML fixtures.
mod serde_bytes_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}
