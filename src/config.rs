//! Configuration types for the decision engine.

use serde::{Deserialize, Serialize};

/// Configuration for the decision engine.
///
/// This struct can be deserialized from TOML, YAML, JSON, or environment
/// variables using figment.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Thread name and metric prefix (default: "flagbandit")
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Period of the background stats flush (default: 30s)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Context vector dimension for contextual features that do not set a
    /// `dimension` setting (default: 16)
    #[serde(default = "default_dimension")]
    pub default_dimension: usize,

    /// Limits applied to custom algorithm calls.
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

fn default_prefix() -> String {
    "flagbandit".to_string()
}

fn default_flush_interval_ms() -> u64 {
    30_000
}

fn default_dimension() -> usize {
    16
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            flush_interval_ms: default_flush_interval_ms(),
            default_dimension: default_dimension(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// Hard ceiling on a guest output frame, whatever the configuration says.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Per-call limits for sandboxed algorithms.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SandboxConfig {
    /// Deadline for one guest call (default: 100ms)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Epoch tick period; the timeout resolution (default: 5ms)
    #[serde(default = "default_epoch_tick_ms")]
    pub epoch_tick_ms: u64,

    /// Largest output frame a guest may return (default and ceiling: 1 MiB)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_timeout_ms() -> u64 {
    100
}

fn default_epoch_tick_ms() -> u64 {
    5
}

fn default_max_output_bytes() -> usize {
    MAX_OUTPUT_BYTES
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            epoch_tick_ms: default_epoch_tick_ms(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl SandboxConfig {
    /// Call deadline in epoch ticks, rounded up and at least one.
    pub fn deadline_ticks(&self) -> u64 {
        let tick = self.epoch_tick_ms.max(1);
        self.timeout_ms.div_ceil(tick).max(1)
    }

    /// Effective output frame limit: `max_output_bytes` capped at
    /// [`MAX_OUTPUT_BYTES`].
    pub fn output_limit(&self) -> usize {
        self.max_output_bytes.clamp(1, MAX_OUTPUT_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.prefix, "flagbandit");
        assert_eq!(config.flush_interval_ms, 30_000);
        assert_eq!(config.default_dimension, 16);
        assert_eq!(config.sandbox.timeout_ms, 100);
        assert_eq!(config.sandbox.max_output_bytes, 1 << 20);
    }

    #[test]
    fn test_deadline_ticks() {
        let mut sandbox = SandboxConfig::default();
        assert_eq!(sandbox.deadline_ticks(), 20);

        sandbox.timeout_ms = 101;
        assert_eq!(sandbox.deadline_ticks(), 21);

        sandbox.timeout_ms = 0;
        assert_eq!(sandbox.deadline_ticks(), 1);

        sandbox.timeout_ms = 50;
        sandbox.epoch_tick_ms = 0;
        assert_eq!(sandbox.deadline_ticks(), 50);
    }

    #[test]
    fn test_output_limit_is_capped() {
        let mut sandbox = SandboxConfig::default();
        assert_eq!(sandbox.output_limit(), MAX_OUTPUT_BYTES);

        sandbox.max_output_bytes = 4096;
        assert_eq!(sandbox.output_limit(), 4096);

        sandbox.max_output_bytes = 64 * MAX_OUTPUT_BYTES;
        assert_eq!(sandbox.output_limit(), MAX_OUTPUT_BYTES);
    }

    #[test]
    fn test_deserialize_config() {
        let toml = r#"
            prefix = "flags"
            flush_interval_ms = 5000

            [sandbox]
            timeout_ms = 250
        "#;

        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.prefix, "flags");
        assert_eq!(config.flush_interval_ms, 5000);
        assert_eq!(config.default_dimension, 16);
        assert_eq!(config.sandbox.timeout_ms, 250);
        assert_eq!(config.sandbox.epoch_tick_ms, 5);
    }
}
