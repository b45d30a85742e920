use crate::aggregator::ErrorOverviewMetrics;
use crate::events::{Severity, Timestamp};
use chrono::Duration;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Engine evaluating threshold conditions against live aggregates on every tick
pub struct TriggerEngine {
    rules: Vec<Box<dyn TriggerRule>>,
    /// When each currently breaching rule started breaching
    breach_since: HashMap<String, Timestamp>,
}

/// Outcome of evaluating a rule against one metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleEvaluation {
    pub breached: bool,
    /// Value of the rule's metric in the snapshot
    pub observed: f64,
}

/// Trait for implementing rules that raise threshold alerts
pub trait TriggerRule: Send + Sync {
    /// Evaluate the condition against aggregates over `window()`
    fn evaluate(&self, metrics: &ErrorOverviewMetrics) -> RuleEvaluation;

    /// Length of the metrics window the rule looks at
    fn window(&self) -> Duration;

    /// How long the condition must hold before the rule fires
    fn sustain(&self) -> Duration;

    /// Unique name; used as the alert source reference
    fn name(&self) -> &str;

    fn severity(&self) -> Severity;

    /// Human readable condition, e.g. `error_rate > 10`
    fn condition(&self) -> String;
}

/// A rule whose condition has held for at least its sustain duration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerContext {
    /// Tick at which the rule fired
    pub timestamp: Timestamp,
    /// Name of the rule that fired
    pub triggered_by: String,
    pub expected_severity: Severity,
    pub observed: f64,
    /// Start of the current breach
    pub breach_started: Timestamp,
    pub trigger_reason: String,
}

impl Default for TriggerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            breach_since: HashMap::new(),
        }
    }

    /// Add a rule; a rule with the same name replaces the earlier one
    pub fn add_rule(&mut self, rule: Box<dyn TriggerRule>) {
        self.rules.retain(|existing| existing.name() != rule.name());
        self.breach_since.remove(rule.name());
        self.rules.push(rule);
    }

    /// Evaluate every rule and return those whose breach has been sustained
    ///
    /// `metrics_for` produces the aggregate over a window ending at `now`.
    /// A sustained rule keeps firing on every tick until it clears; the
    /// alert engine collapses the repeats into one alert.
    pub fn evaluate<F>(&mut self, now: Timestamp, mut metrics_for: F) -> Vec<TriggerContext>
    where
        F: FnMut(Duration) -> ErrorOverviewMetrics,
    {
        let mut contexts = Vec::new();

        for rule in &self.rules {
            let metrics = metrics_for(rule.window());
            let evaluation = rule.evaluate(&metrics);

            if !evaluation.breached {
                if self.breach_since.remove(rule.name()).is_some() {
                    debug!("Rule '{}' cleared", rule.name());
                }
                continue;
            }

            let since = *self
                .breach_since
                .entry(rule.name().to_string())
                .or_insert(now);
            if now - since >= rule.sustain() {
                contexts.push(TriggerContext {
                    timestamp: now,
                    triggered_by: rule.name().to_string(),
                    expected_severity: rule.severity(),
                    observed: evaluation.observed,
                    breach_started: since,
                    trigger_reason: format!(
                        "{} (observed {:.2}) sustained for {}s",
                        rule.condition(),
                        evaluation.observed,
                        (now - since).num_seconds()
                    ),
                });
            }
        }

        contexts
    }

    /// Get the number of configured rules
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Rules currently breaching, sustained or not
    pub fn breaching(&self) -> usize {
        self.breach_since.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{DomainBreakdown, SeverityBreakdown};
    use crate::events::TimeRange;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn base() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn metrics(total: u64) -> ErrorOverviewMetrics {
        ErrorOverviewMetrics {
            range: TimeRange::ending_at(base(), Duration::minutes(1)),
            total_errors: total,
            error_rate: total as f64,
            severity_distribution: SeverityBreakdown::default(),
            domain_distribution: DomainBreakdown::default(),
            unique_errors: 1,
            affected_users: 0,
            recoverable_errors: 0,
            buckets_covered: 1,
            late_events: 0,
        }
    }

    // Mock trigger rule for testing
    struct MockTriggerRule {
        name: String,
        should_trigger: Arc<AtomicBool>,
        sustain: Duration,
        severity: Severity,
    }

    impl TriggerRule for MockTriggerRule {
        fn evaluate(&self, metrics: &ErrorOverviewMetrics) -> RuleEvaluation {
            RuleEvaluation {
                breached: self.should_trigger.load(Ordering::SeqCst),
                observed: metrics.total_errors as f64,
            }
        }

        fn window(&self) -> Duration {
            Duration::minutes(1)
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
            "mock".to_string()
        }
    }

    fn mock(name: &str, trigger: bool, sustain: Duration) -> (Box<MockTriggerRule>, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(trigger));
        let rule = Box::new(MockTriggerRule {
            name: name.to_string(),
            should_trigger: flag.clone(),
            sustain,
            severity: Severity::High,
        });
        (rule, flag)
    }

    #[test]
    fn test_trigger_engine_creation() {
        let engine = TriggerEngine::new();
        assert_eq!(engine.rule_count(), 0);

        let engine_default = TriggerEngine::default();
        assert_eq!(engine_default.rule_count(), 0);
    }

    #[test]
    fn test_same_name_replaces_rule() {
        let mut engine = TriggerEngine::new();
        engine.add_rule(mock("rate", false, Duration::zero()).0);
        engine.add_rule(mock("rate", true, Duration::zero()).0);
        assert_eq!(engine.rule_count(), 1);
        assert_eq!(engine.evaluate(base(), |_| metrics(3)).len(), 1);
    }

    #[test]
    fn test_immediate_rule_fires_on_first_breach() {
        let mut engine = TriggerEngine::new();
        engine.add_rule(mock("fires", true, Duration::zero()).0);
        engine.add_rule(mock("quiet", false, Duration::zero()).0);

        let contexts = engine.evaluate(base(), |_| metrics(42));
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].triggered_by, "fires");
        assert_eq!(contexts[0].observed, 42.0);
        assert_eq!(contexts[0].expected_severity, Severity::High);
    }

    #[test]
    fn test_sustained_breach_required() {
        let mut engine = TriggerEngine::new();
        engine.add_rule(mock("sustained", true, Duration::seconds(60)).0);

        for tick in 0..6 {
            let now = base() + Duration::seconds(tick * 10);
            assert!(engine.evaluate(now, |_| metrics(1)).is_empty());
        }
        let contexts = engine.evaluate(base() + Duration::seconds(60), |_| metrics(1));
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].breach_started, base());
    }

    #[test]
    fn test_clearing_resets_breach() {
        let mut engine = TriggerEngine::new();
        let (rule, flag) = mock("flaky", true, Duration::seconds(30));
        engine.add_rule(rule);

        engine.evaluate(base(), |_| metrics(1));
        assert_eq!(engine.breaching(), 1);
        flag.store(false, Ordering::SeqCst);
        engine.evaluate(base() + Duration::seconds(20), |_| metrics(1));
        assert_eq!(engine.breaching(), 0);

        flag.store(true, Ordering::SeqCst);
        assert!(engine
            .evaluate(base() + Duration::seconds(40), |_| metrics(1))
            .is_empty());
        assert_eq!(
            engine
                .evaluate(base() + Duration::seconds(70), |_| metrics(1))
                .len(),
            1
        );
    }

    #[test]
    fn test_metrics_requested_per_rule_window() {
        let mut engine = TriggerEngine::new();
        engine.add_rule(mock("a", false, Duration::zero()).0);
        engine.add_rule(mock("b", false, Duration::zero()).0);
        let mut windows = Vec::new();
        engine.evaluate(base(), |window| {
            windows.push(window);
            metrics(0)
        });
        assert_eq!(windows, vec![Duration::minutes(1), Duration::minutes(1)]);
    }
}
