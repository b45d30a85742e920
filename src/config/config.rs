use crate::error::ConfigError;
use crate::events::Severity;
use chrono::Duration;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete configuration for an analytics core instance
///
/// Every option has a default; unknown keys are rejected when parsing so a
/// misspelled option never silently falls back to its default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyticsConfig {
    /// Width of one aggregation bucket
    pub bucket_width_seconds: u64,
    /// Number of buckets kept in memory; also defines the retention horizon
    pub retention_buckets: usize,
    /// Minimum similarity for assigning an event to an existing pattern, in (0, 1]
    pub cluster_similarity_threshold: f64,
    /// Standard deviations a closed bucket must deviate to be anomalous
    pub anomaly_k_factor: f64,
    /// Period of the threshold evaluation tick
    pub alert_tick_interval_seconds: u64,
    /// How long after its end a bucket still accepts late increments
    pub late_event_grace_seconds: u64,
    /// Accepted clock skew for timestamps in the future
    pub clock_skew_tolerance_seconds: u64,
    /// Number of stack frames that participate in the fingerprint
    pub fingerprint_max_frames: usize,
    /// Attempts below which a strategy's success rate is flagged low confidence
    pub min_recovery_samples: usize,
    /// Latency samples kept per strategy
    pub latency_reservoir_size: usize,
    /// Failure reasons reported per strategy
    pub failure_reason_top_k: usize,
    /// Undelivered items buffered per subscriber before the oldest is dropped
    pub subscriber_buffer: usize,
    /// How long resolved alerts are kept before being purged
    pub resolved_alert_grace_seconds: u64,
    /// Closed buckets kept for trend and seasonality history
    pub history_retention_buckets: usize,
    /// Static threshold rules evaluated on every tick
    pub thresholds: Vec<ThresholdRuleConfig>,
}

/// Metric a threshold rule compares against
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMetric {
    /// Errors per minute over the rule window
    ErrorRate,
    TotalErrors,
    UniqueErrors,
    CriticalErrors,
    AffectedUsers,
}

/// Comparison operator of a threshold rule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdOperator {
    Gt,
    Lt,
    Gte,
    Lte,
}

impl ThresholdOperator {
    pub fn compare(self, observed: f64, value: f64) -> bool {
        match self {
            ThresholdOperator::Gt => observed > value,
            ThresholdOperator::Lt => observed < value,
            ThresholdOperator::Gte => observed >= value,
            ThresholdOperator::Lte => observed <= value,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ThresholdOperator::Gt => ">",
            ThresholdOperator::Lt => "<",
            ThresholdOperator::Gte => ">=",
            ThresholdOperator::Lte => "<=",
        }
    }
}

/// `metric operator value sustained for duration`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ThresholdRuleConfig {
    /// Unique rule name, used as the alert source reference
    pub name: String,
    pub metric: ThresholdMetric,
    pub operator: ThresholdOperator,
    pub value: f64,
    /// How long the condition must hold before an alert is raised
    #[serde(default)]
    pub duration_seconds: u64,
    /// Length of the metrics window the condition is evaluated over
    #[serde(default = "default_rule_window")]
    pub window_seconds: u64,
    #[serde(default = "default_rule_severity")]
    pub severity: Severity,
}

impl ThresholdRuleConfig {
    pub fn sustain(&self) -> Duration {
        clamp_span(seconds(self.duration_seconds))
    }

    pub fn window(&self) -> Duration {
        clamp_span(seconds(self.window_seconds.max(1)))
    }
}

fn default_rule_window() -> u64 {
    60
}

fn default_rule_severity() -> Severity {
    Severity::High
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            bucket_width_seconds: 60,
            retention_buckets: 1440,
            cluster_similarity_threshold: 0.85,
            anomaly_k_factor: 3.0,
            alert_tick_interval_seconds: 10,
            late_event_grace_seconds: 5,
            clock_skew_tolerance_seconds: 30,
            fingerprint_max_frames: 5,
            min_recovery_samples: 10,
            latency_reservoir_size: 1024,
            failure_reason_top_k: 5,
            subscriber_buffer: 256,
            resolved_alert_grace_seconds: 3600,
            history_retention_buckets: 40320,
            thresholds: Vec::new(),
        }
    }
}

impl AnalyticsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read,
    /// `ConfigError::TomlError` if it is not valid TOML or contains unknown
    /// keys, and `ConfigError::ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AnalyticsConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every option against its accepted range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_width_seconds == 0 {
            return Err(invalid("bucket_width_seconds must be greater than zero"));
        }
        if self.retention_buckets == 0 {
            return Err(invalid("retention_buckets must be greater than zero"));
        }
        if !(self.cluster_similarity_threshold > 0.0 && self.cluster_similarity_threshold <= 1.0)
        {
            return Err(invalid("cluster_similarity_threshold must be in (0, 1]"));
        }
        if !(self.anomaly_k_factor.is_finite() && self.anomaly_k_factor > 0.0) {
            return Err(invalid("anomaly_k_factor must be a positive number"));
        }
        if self.alert_tick_interval_seconds == 0 {
            return Err(invalid("alert_tick_interval_seconds must be greater than zero"));
        }
        if self.fingerprint_max_frames == 0 {
            return Err(invalid("fingerprint_max_frames must be greater than zero"));
        }
        if self.latency_reservoir_size == 0 {
            return Err(invalid("latency_reservoir_size must be greater than zero"));
        }
        if self.subscriber_buffer == 0 {
            return Err(invalid("subscriber_buffer must be greater than zero"));
        }
        if self.history_retention_buckets < self.retention_buckets {
            return Err(invalid(
                "history_retention_buckets must be at least retention_buckets",
            ));
        }

        let width = check_span("bucket_width_seconds", seconds(self.bucket_width_seconds))?;
        check_span(
            "retention_buckets",
            buckets(width, self.retention_buckets),
        )?;
        check_span(
            "history_retention_buckets",
            buckets(width, self.history_retention_buckets),
        )?;
        check_span(
            "alert_tick_interval_seconds",
            seconds(self.alert_tick_interval_seconds),
        )?;
        check_span("late_event_grace_seconds", seconds(self.late_event_grace_seconds))?;
        check_span(
            "clock_skew_tolerance_seconds",
            seconds(self.clock_skew_tolerance_seconds),
        )?;
        check_span(
            "resolved_alert_grace_seconds",
            seconds(self.resolved_alert_grace_seconds),
        )?;

        let mut names = std::collections::HashSet::new();
        for rule in &self.thresholds {
            if rule.name.trim().is_empty() {
                return Err(invalid("threshold rule name must not be empty"));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate threshold rule name '{}'",
                    rule.name
                )));
            }
            if !rule.value.is_finite() {
                return Err(ConfigError::ValidationError(format!(
                    "threshold rule '{}' has a non-finite value",
                    rule.name
                )));
            }
            if rule.window_seconds == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "threshold rule '{}' window_seconds must be greater than zero",
                    rule.name
                )));
            }
            check_span("threshold duration_seconds", seconds(rule.duration_seconds))?;
            check_span("threshold window_seconds", seconds(rule.window_seconds))?;
        }

        Ok(())
    }

    pub fn bucket_width(&self) -> Duration {
        clamp_span(seconds(self.bucket_width_seconds))
    }

    /// Age after which events are rejected and patterns become dormant
    pub fn retention_horizon(&self) -> Duration {
        clamp_span(buckets(self.bucket_width(), self.retention_buckets))
    }

    /// Span of closed buckets kept for trend history
    pub fn history_horizon(&self) -> Duration {
        clamp_span(buckets(self.bucket_width(), self.history_retention_buckets))
    }

    pub fn alert_tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.alert_tick_interval_seconds)
    }

    pub fn late_event_grace(&self) -> Duration {
        clamp_span(seconds(self.late_event_grace_seconds))
    }

    pub fn clock_skew_tolerance(&self) -> Duration {
        clamp_span(seconds(self.clock_skew_tolerance_seconds))
    }

    pub fn resolved_alert_grace(&self) -> Duration {
        clamp_span(seconds(self.resolved_alert_grace_seconds))
    }
}

/// Longest span any duration option may cover
///
/// Keeps `now - span` and `now + span` representable for any realistic `now`.
pub const MAX_SPAN_DAYS: i64 = 36_500;

fn max_span() -> Duration {
    Duration::days(MAX_SPAN_DAYS)
}

fn seconds(value: u64) -> Option<Duration> {
    i64::try_from(value).ok().and_then(Duration::try_seconds)
}

fn buckets(width: Duration, count: usize) -> Option<Duration> {
    i32::try_from(count)
        .ok()
        .and_then(|count| width.checked_mul(count))
}

fn check_span(option: &str, span: Option<Duration>) -> Result<Duration, ConfigError> {
    match span {
        Some(span) if span <= max_span() => Ok(span),
        _ => Err(ConfigError::ValidationError(format!(
            "{} covers more than {} days",
            option, MAX_SPAN_DAYS
        ))),
    }
}

/// Accessors never panic on an unvalidated config; out-of-range spans clamp
fn clamp_span(span: Option<Duration>) -> Duration {
    span.map_or_else(max_span, |span| span.min(max_span()))
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}
