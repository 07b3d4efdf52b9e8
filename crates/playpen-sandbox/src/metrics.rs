//! Prometheus metrics for the playpen sandbox.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Label set for validation metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// "accepted" or "rejected".
    pub outcome: String,
}

/// Label set for rejection metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// `SandboxError::kind()` of the rejection.
    pub error_kind: String,
}

/// Label set for fail-closed callbacks.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
    /// "privileged_access", "post_check" or "tamper_detection".
    pub stage: String,
}

/// Prometheus metrics for the playpen sandbox.
pub struct SandboxMetrics {
    /// Validation attempts by outcome.
    pub validations_total: Family<OutcomeLabels, Counter>,
    /// Validation duration in seconds.
    pub validation_duration_seconds: Family<OutcomeLabels, Histogram>,
    /// Rejections by error kind.
    pub rejections_total: Family<ErrorLabels, Counter>,
    /// Callbacks that failed the level closed, by stage.
    pub callback_failures_total: Family<StageLabels, Counter>,
}

impl SandboxMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let validations_total = Family::default();
        registry.register(
            "playpen_validations_total",
            "Level script validation attempts",
            validations_total.clone(),
        );

        let validation_duration_seconds =
            Family::<OutcomeLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0].into_iter())
            });
        registry.register(
            "playpen_validation_duration_seconds",
            "Level script validation duration",
            validation_duration_seconds.clone(),
        );

        let rejections_total = Family::default();
        registry.register(
            "playpen_rejections_total",
            "Rejected level scripts by error kind",
            rejections_total.clone(),
        );

        let callback_failures_total = Family::default();
        registry.register(
            "playpen_callback_failures_total",
            "Callbacks that failed the level closed",
            callback_failures_total.clone(),
        );

        Self {
            validations_total,
            validation_duration_seconds,
            rejections_total,
            callback_failures_total,
        }
    }

    /// Record a finished validation attempt.
    pub fn record_validation(&self, outcome: &str, duration_secs: f64) {
        let labels = OutcomeLabels {
            outcome: outcome.to_string(),
        };
        self.validations_total.get_or_create(&labels).inc();
        self.validation_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a rejection.
    pub fn record_rejection(&self, error_kind: &str) {
        let labels = ErrorLabels {
            error_kind: error_kind.to_string(),
        };
        self.rejections_total.get_or_create(&labels).inc();
    }

    /// Record a fail-closed callback.
    pub fn record_callback_failure(&self, stage: &str) {
        let labels = StageLabels {
            stage: stage.to_string(),
        };
        self.callback_failures_total.get_or_create(&labels).inc();
    }
}
