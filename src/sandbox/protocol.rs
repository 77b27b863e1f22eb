//! JSON payloads exchanged with guest modules.
//!
//! Every call passes one JSON document in and reads one JSON document back.
//! The `state` field carries the algorithm's opaque blob: whatever the guest
//! returned last time is handed back verbatim on the next call.

use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::algorithms::{FeedbackEvent, VariantStats};
use crate::encoding::Context;

/// Shape of a custom algorithm, fixed when it is uploaded.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomKind {
    Bandit,
    ContextualBandit,
    Optimizer,
}

impl CustomKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CustomKind::Bandit => "bandit",
            CustomKind::ContextualBandit => "contextual_bandit",
            CustomKind::Optimizer => "optimizer",
        }
    }
}

/// Per-variant counters as the guest sees them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantView {
    pub key: String,
    pub evaluations: u64,
    pub successes: u64,
    pub failures: u64,
    pub metric_sum: f64,
}

impl VariantView {
    pub fn new(key: &str, stats: &VariantStats) -> Self {
        Self {
            key: key.to_string(),
            evaluations: stats.evaluations,
            successes: stats.successes,
            failures: stats.failures,
            metric_sum: stats.metric_sum.to_f64().unwrap_or(0.0),
        }
    }
}

#[derive(Serialize)]
pub struct BanditInput<'a> {
    pub feature_key: &'a str,
    pub environment_key: &'a str,
    pub variants: Vec<VariantView>,
    pub settings: HashMap<String, f64>,
    pub state: Option<&'a RawValue>,
}

#[derive(Serialize)]
pub struct ContextualInput<'a> {
    pub feature_key: &'a str,
    pub environment_key: &'a str,
    pub variants: Vec<VariantView>,
    pub context: &'a Context,
    pub settings: HashMap<String, f64>,
    pub state: Option<&'a RawValue>,
}

#[derive(Serialize)]
pub struct OptimizerInput<'a> {
    pub feature_key: &'a str,
    pub environment_key: &'a str,
    pub current_value: f64,
    pub iteration: u64,
    pub last_metric: f64,
    pub settings: HashMap<String, f64>,
    pub state: Option<&'a RawValue>,
}

/// Feedback for any kind. Fields that do not apply to the kind are omitted.
#[derive(Serialize)]
pub struct FeedbackInput<'a> {
    pub feature_key: &'a str,
    pub environment_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<FeedbackEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<&'a Context>,
    pub settings: HashMap<String, f64>,
    pub state: Option<&'a RawValue>,
}

/// Common view over guest outputs so the executor can detect guest errors.
pub trait GuestOutput {
    /// Error reported by the guest. Empty strings do not count.
    fn error(&self) -> Option<&str>;
}

#[derive(Debug, Default, Deserialize)]
pub struct BanditOutput {
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub state: Option<Box<RawValue>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OptimizerOutput {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub state: Option<Box<RawValue>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedbackOutput {
    #[serde(default)]
    pub state: Option<Box<RawValue>>,
    #[serde(default)]
    pub error: Option<String>,
}

fn non_empty(error: &Option<String>) -> Option<&str> {
    error.as_deref().filter(|e| !e.is_empty())
}

impl GuestOutput for BanditOutput {
    fn error(&self) -> Option<&str> {
        non_empty(&self.error)
    }
}

impl GuestOutput for OptimizerOutput {
    fn error(&self) -> Option<&str> {
        non_empty(&self.error)
    }
}

impl GuestOutput for FeedbackOutput {
    fn error(&self) -> Option<&str> {
        non_empty(&self.error)
    }
}
