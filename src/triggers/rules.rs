//! Built-in trigger rules
//!
//! Threshold rules compare one aggregate metric of the rule window against a
//! fixed value: `metric operator value sustained for duration`.

use crate::aggregator::ErrorOverviewMetrics;
use crate::config::{ThresholdMetric, ThresholdOperator, ThresholdRuleConfig};
use crate::events::Severity;
use crate::triggers::{RuleEvaluation, TriggerRule};
use chrono::Duration;

/// Trigger rule built from a `[[thresholds]]` configuration entry
pub struct ThresholdRule {
    pub name: String,
    pub metric: ThresholdMetric,
    pub operator: ThresholdOperator,
    pub value: f64,
    /// How long the condition must hold
    pub sustain: Duration,
    /// Metrics window the condition is evaluated over
    pub window: Duration,
    pub severity: Severity,
}

impl ThresholdRule {
    pub fn from_config(config: &ThresholdRuleConfig) -> Self {
        Self {
            name: config.name.clone(),
            metric: config.metric,
            operator: config.operator,
            value: config.value,
            sustain: config.sustain(),
            window: config.window(),
            severity: config.severity,
        }
    }
}

/// Value of `metric` in an aggregate snapshot
pub fn metric_value(metric: ThresholdMetric, metrics: &ErrorOverviewMetrics) -> f64 {
    match metric {
        ThresholdMetric::ErrorRate => metrics.error_rate,
        ThresholdMetric::TotalErrors => metrics.total_errors as f64,
        ThresholdMetric::UniqueErrors => metrics.unique_errors as f64,
        ThresholdMetric::CriticalErrors => metrics.severity_distribution.critical as f64,
        ThresholdMetric::AffectedUsers => metrics.affected_users as f64,
    }
}

fn metric_name(metric: ThresholdMetric) -> &'static str {
    match metric {
        ThresholdMetric::ErrorRate => "error_rate",
        ThresholdMetric::TotalErrors => "total_errors",
        ThresholdMetric::UniqueErrors => "unique_errors",
        ThresholdMetric::CriticalErrors => "critical_errors",
        ThresholdMetric::AffectedUsers => "affected_users",
    }
}

impl TriggerRule for ThresholdRule {
    fn evaluate(&self, metrics: &ErrorOverviewMetrics) -> RuleEvaluation {
        let observed = metric_value(self.metric, metrics);
        RuleEvaluation {
            breached: self.operator.compare(observed, self.value),
            observed,
        }
    }

    fn window(&self) -> Duration {
        self.window
    }

    fn sustain(&self) -> Duration {
        self.sustain
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    fn condition(&self) -> String {
        format!(
            "{} {} {}",
            metric_name(self.metric),
            self.operator.symbol(),
            self.value
        )
    }
}
