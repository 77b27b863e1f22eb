//! Builder pattern for constructing decision engines.
//!
//! The builder supports multiple configuration sources using figment:
//! - Default values
//! - Config files (TOML, YAML, JSON)
//! - Environment variables
//! - Programmatic overrides
//! - CLI arguments via clap
//!
//! It also collects the repositories the engine reads from and writes to.

use crate::config::{EngineConfig, SandboxConfig};
use crate::custom::CustomAlgorithmManager;
use crate::engine::DecisionEngine;
use crate::error::{EngineError, Result};
use crate::metrics::EngineMetrics;
use crate::repository::{
    AlgorithmConfigRepository, CustomAlgorithmRepository, CustomStatsRepository, FeatureLookup,
    StatsRepository, VariantRepository,
};
use crate::sandbox::SandboxRuntime;
use crate::store::{StateStore, StoreRepositories};

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use prometheus::Registry;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Builder for constructing a [`DecisionEngine`].
///
/// Configuration sources are merged in the following order (later sources override earlier):
/// 1. Default values
/// 2. Config files (in order added)
/// 3. Environment variables
/// 4. Programmatic overrides
///
/// The algorithm config, variant, stats and feature lookup repositories are
/// required. Custom algorithms are enabled by supplying both custom
/// repositories; without them no sandbox is created.
///
/// # Examples
///
/// ```ignore
/// use flagbandit::EngineBuilder;
///
/// let engine = EngineBuilder::new()
///     .file("flagbandit.toml")
///     .env_prefix("FLAGBANDIT")
///     .flush_interval_ms(10_000)
///     .repository(repo.clone())
///     .custom_repositories(algorithms, custom_stats)
///     .build()?;
/// ```
pub struct EngineBuilder {
    figment: Figment,
    prometheus_registry: Option<Registry>,
    configs: Option<Arc<dyn AlgorithmConfigRepository>>,
    variants: Option<Arc<dyn VariantRepository>>,
    stats: Option<Arc<dyn StatsRepository>>,
    features: Option<Arc<dyn FeatureLookup>>,
    custom_algorithms: Option<Arc<dyn CustomAlgorithmRepository>>,
    custom_stats: Option<Arc<dyn CustomStatsRepository>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("figment", &self.figment)
            .field(
                "prometheus_registry",
                &self.prometheus_registry.as_ref().map(|_| "<Registry>"),
            )
            .field("configs", &self.configs.is_some())
            .field("variants", &self.variants.is_some())
            .field("stats", &self.stats.is_some())
            .field("features", &self.features.is_some())
            .field("custom_algorithms", &self.custom_algorithms.is_some())
            .field("custom_stats", &self.custom_stats.is_some())
            .finish()
    }
}

impl EngineBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            figment: Figment::from(Serialized::defaults(EngineConfig::default())),
            prometheus_registry: None,
            configs: None,
            variants: None,
            stats: None,
            features: None,
            custom_algorithms: None,
            custom_stats: None,
        }
    }

    /// Add a configuration file.
    ///
    /// Supports TOML, YAML, and JSON formats (detected by extension).
    /// Files are merged in the order they are added.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let builder = EngineBuilder::new()
    ///     .file("flagbandit.toml")
    ///     .file("flagbandit.local.toml"); // Overrides values from flagbandit.toml
    /// ```
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        self.figment = match extension.to_lowercase().as_str() {
            "toml" => self.figment.merge(Toml::file(path)),
            "yaml" | "yml" => self.figment.merge(Yaml::file(path)),
            "json" => self.figment.merge(Json::file(path)),
            _ => {
                // Default to TOML
                self.figment.merge(Toml::file(path))
            }
        };
        self
    }

    /// Add environment variables with a prefix.
    ///
    /// Variables are read as `{PREFIX}_{KEY}`. Nested keys use a double
    /// underscore, since field names contain single ones:
    ///
    /// ```ignore
    /// // Reads MYAPP_FLUSH_INTERVAL_MS, MYAPP_SANDBOX__TIMEOUT_MS, etc.
    /// let builder = EngineBuilder::new().env_prefix("MYAPP");
    /// ```
    pub fn env_prefix(mut self, prefix: &str) -> Self {
        let prefix = format!("{}_", prefix.trim_end_matches('_'));
        self.figment = self.figment.merge(Env::prefixed(&prefix).split("__"));
        self
    }

    /// Set the thread name and metric prefix.
    ///
    /// The flush thread is named `{prefix}-flush`, the sandbox epoch ticker
    /// `{prefix}-epoch`, and metrics are exported as `{prefix}_*`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("prefix", prefix.into()));
        self
    }

    /// Set the period of the background stats flush.
    pub fn flush_interval_ms(mut self, ms: u64) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("flush_interval_ms", ms));
        self
    }

    /// Set the context dimension used by contextual features that do not
    /// configure one.
    pub fn default_dimension(mut self, d: usize) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("default_dimension", d));
        self
    }

    /// Set the deadline for one custom algorithm call.
    pub fn sandbox_timeout_ms(mut self, ms: u64) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("sandbox.timeout_ms", ms));
        self
    }

    /// Replace all sandbox limits.
    pub fn sandbox_config(mut self, config: SandboxConfig) -> Self {
        self.figment = self.figment.merge(Serialized::default("sandbox", config));
        self
    }

    /// Provide an external Prometheus registry for metrics exposition.
    pub fn prometheus_registry(mut self, registry: Registry) -> Self {
        self.prometheus_registry = Some(registry);
        self
    }

    /// Use one object for every required repository role.
    pub fn repository<R>(mut self, repo: Arc<R>) -> Self
    where
        R: AlgorithmConfigRepository
            + VariantRepository
            + StatsRepository
            + FeatureLookup
            + 'static,
    {
        let repos = StoreRepositories::from_shared(repo);
        self.configs = Some(repos.configs);
        self.variants = Some(repos.variants);
        self.stats = Some(repos.stats);
        self.features = Some(repos.features);
        self
    }

    pub fn config_repository(mut self, repo: Arc<dyn AlgorithmConfigRepository>) -> Self {
        self.configs = Some(repo);
        self
    }

    pub fn variant_repository(mut self, repo: Arc<dyn VariantRepository>) -> Self {
        self.variants = Some(repo);
        self
    }

    pub fn stats_repository(mut self, repo: Arc<dyn StatsRepository>) -> Self {
        self.stats = Some(repo);
        self
    }

    pub fn feature_lookup(mut self, lookup: Arc<dyn FeatureLookup>) -> Self {
        self.features = Some(lookup);
        self
    }

    /// Enable custom algorithms.
    pub fn custom_repositories(
        mut self,
        algorithms: Arc<dyn CustomAlgorithmRepository>,
        stats: Arc<dyn CustomStatsRepository>,
    ) -> Self {
        self.custom_algorithms = Some(algorithms);
        self.custom_stats = Some(stats);
        self
    }

    /// Apply CLI argument overrides.
    ///
    /// This method applies any non-None values from the `EngineArgs` struct.
    pub fn with_cli_args(mut self, args: &EngineArgs) -> Self {
        if let Some(ref prefix) = args.engine_prefix {
            self.figment = self
                .figment
                .merge(Serialized::default("prefix", prefix.clone()));
        }
        if let Some(ms) = args.engine_flush_interval_ms {
            self.figment = self
                .figment
                .merge(Serialized::default("flush_interval_ms", ms));
        }
        if let Some(ms) = args.engine_sandbox_timeout_ms {
            self.figment = self
                .figment
                .merge(Serialized::default("sandbox.timeout_ms", ms));
        }
        self
    }

    /// Build the engine.
    ///
    /// State is not loaded until [`DecisionEngine::start`].
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration extraction fails
    /// - A required repository was not supplied
    /// - The sandbox engine cannot be created
    pub fn build(self) -> Result<DecisionEngine> {
        let config: EngineConfig = self.figment.extract().map_err(Box::new)?;

        let repositories = StoreRepositories {
            configs: self
                .configs
                .ok_or(EngineError::MissingCollaborator("algorithm config repository"))?,
            variants: self
                .variants
                .ok_or(EngineError::MissingCollaborator("variant repository"))?,
            stats: self
                .stats
                .ok_or(EngineError::MissingCollaborator("stats repository"))?,
            features: self
                .features
                .ok_or(EngineError::MissingCollaborator("feature lookup"))?,
        };

        let metrics = EngineMetrics::with_prefix(&config.prefix);
        if let Some(ref registry) = self.prometheus_registry {
            if let Err(e) = metrics.register(registry) {
                warn!(%e, "failed to register prometheus metrics");
            }
        }

        let custom = match (self.custom_algorithms, self.custom_stats) {
            (Some(algorithms), Some(stats)) => {
                let runtime =
                    Arc::new(SandboxRuntime::new(config.sandbox.clone(), &config.prefix)?);
                Some(Arc::new(CustomAlgorithmManager::new(
                    runtime,
                    algorithms,
                    stats,
                    metrics.clone(),
                )))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(EngineError::MissingCollaborator("custom stats repository"))
            }
            (None, Some(_)) => {
                return Err(EngineError::MissingCollaborator("custom algorithm repository"))
            }
        };

        info!(
            prefix = %config.prefix,
            flush_interval_ms = config.flush_interval_ms,
            default_dimension = config.default_dimension,
            custom_algorithms = custom.is_some(),
            "building decision engine"
        );

        let store = StateStore::new(
            repositories,
            custom,
            metrics.clone(),
            config.default_dimension,
        );
        Ok(DecisionEngine::from_parts(config, store, metrics))
    }
}

/// CLI arguments for engine configuration.
///
/// Use with clap's `Parser` derive macro. These arguments can be applied
/// to an `EngineBuilder` using `with_cli_args`.
///
/// # Examples
///
/// ```ignore
/// use clap::Parser;
/// use flagbandit::{EngineBuilder, EngineArgs};
///
/// #[derive(Parser)]
/// struct MyArgs {
///     #[command(flatten)]
///     engine: EngineArgs,
///     // ... other args
/// }
///
/// let args = MyArgs::parse();
/// let engine = EngineBuilder::new()
///     .with_cli_args(&args.engine)
///     .repository(repo)
///     .build()?;
/// ```
#[derive(Debug, Default, Clone, clap::Args)]
pub struct EngineArgs {
    /// Thread name and metric prefix
    #[arg(long)]
    pub engine_prefix: Option<String>,

    /// Stats flush period in milliseconds
    #[arg(long)]
    pub engine_flush_interval_ms: Option<u64>,

    /// Deadline for one custom algorithm call in milliseconds
    #[arg(long)]
    pub engine_sandbox_timeout_ms: Option<u64>,
}
