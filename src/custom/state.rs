use std::collections::HashMap;

use serde_json::value::RawValue;

use crate::algorithms::{FeedbackEvent, Settings, VariantStats};
use crate::sandbox::protocol::VariantView;
use crate::sandbox::CustomKind;

/// Host-side state of one feature driven by a custom algorithm.
#[derive(Clone, Debug)]
pub struct CustomAlgorithmState {
    pub algorithm_id: String,
    pub kind: CustomKind,
    pub enabled: bool,
    pub settings: Settings,
    /// Guest-owned JSON. Replaced wholesale whenever a call returns one and
    /// never parsed by the host.
    pub state_blob: Option<Box<RawValue>>,
    pub variants: Vec<String>,
    /// Local counters, updated when the guest cannot take feedback.
    pub stats: HashMap<String, VariantStats>,
    pub current_value: f64,
    pub iteration: u64,
    pub last_metric: f64,
}

impl CustomAlgorithmState {
    pub fn new(
        algorithm_id: impl Into<String>,
        kind: CustomKind,
        variants: Vec<String>,
        settings: Settings,
    ) -> Self {
        let stats = variants
            .iter()
            .map(|v| (v.clone(), VariantStats::default()))
            .collect();
        let current_value = settings.get_f64("initial_value", 0.0);
        Self {
            algorithm_id: algorithm_id.into(),
            kind,
            enabled: true,
            settings,
            state_blob: None,
            variants,
            stats,
            current_value,
            iteration: 0,
            last_metric: 0.0,
        }
    }

    /// Counters of every variant, in configured order.
    pub fn variant_views(&self) -> Vec<VariantView> {
        let empty = VariantStats::default();
        self.variants
            .iter()
            .map(|v| VariantView::new(v, self.stats.get(v).unwrap_or(&empty)))
            .collect()
    }

    /// Record one feedback event locally. An unlisted variant gets counters
    /// but is not offered to the guest.
    pub fn apply_local(
        &mut self,
        variant: &str,
        event: FeedbackEvent,
        metric: Option<rust_decimal::Decimal>,
    ) {
        self.stats
            .entry(variant.to_string())
            .or_default()
            .apply(event, metric);
    }

    /// Replace the opaque blob if the guest returned one.
    pub fn replace_blob(&mut self, blob: Option<Box<RawValue>>) {
        if let Some(blob) = blob {
            self.state_blob = Some(blob);
        }
    }
}
