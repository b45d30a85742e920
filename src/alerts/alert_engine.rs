use crate::alerts::broadcast::{Broadcaster, Subscription};
use crate::alerts::sink::AlertSink;
use crate::error::AlertError;
use crate::events::{Severity, Timestamp};
use crate::patterns::{AssignmentKind, ClusterAssignment};
use crate::trends::Anomaly;
use crate::triggers::TriggerContext;
use chrono::Duration;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Source reference of anomaly alerts on the total error series
pub const ANOMALY_SOURCE_REF: &str = "anomaly:total_errors";

const MAX_TITLE_LENGTH: usize = 256;
const MAX_DESCRIPTION_LENGTH: usize = 1024;

/// What raised an alert
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Threshold,
    Anomaly,
    Pattern,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    /// Rule name, pattern id or subsystem the alert is about
    pub source_ref: String,
    pub created_at: Timestamp,
    /// Last time the condition was raised again while open
    pub last_seen: Timestamp,
    /// Times the condition was raised while this alert was open
    pub count: u64,
    pub acknowledged: bool,
    pub resolved: bool,
    pub resolved_at: Option<Timestamp>,
}

/// Input for raising an alert
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDraft {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub source_ref: String,
}

/// Whether raising produced a new alert or bumped an open one
#[derive(Debug, Clone, PartialEq)]
pub enum RaiseOutcome {
    Created(Alert),
    Deduplicated(Alert),
}

impl RaiseOutcome {
    pub fn alert(&self) -> &Alert {
        match self {
            RaiseOutcome::Created(alert) | RaiseOutcome::Deduplicated(alert) => alert,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, RaiseOutcome::Created(_))
    }
}

/// Selection of alerts for listing
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertFilter {
    #[serde(rename = "type")]
    pub alert_type: Option<AlertType>,
    pub min_severity: Option<Severity>,
    pub acknowledged: Option<bool>,
    pub include_resolved: bool,
    pub limit: Option<usize>,
}

#[derive(Default)]
struct AlertBook {
    alerts: HashMap<String, Alert>,
    /// `(type, source_ref)` of every unresolved alert
    open: HashMap<(AlertType, String), String>,
}

/// Creates, deduplicates and fans out alerts
///
/// An unresolved alert with the same `(type, source_ref)` suppresses
/// creation; the existing alert's `count` and `last_seen` are bumped instead
/// and nothing is published.
pub struct AlertEngine {
    book: Mutex<AlertBook>,
    broadcaster: Broadcaster<Alert>,
    resolved_grace: Duration,
    created: AtomicU64,
    deduplicated: AtomicU64,
    delivery_failures: Arc<AtomicU64>,
    sink_subscription: Mutex<Option<Subscription<Alert>>>,
}

impl AlertEngine {
    /// # Arguments
    ///
    /// * `subscriber_buffer` - Undelivered alerts buffered per subscriber
    /// * `resolved_grace` - How long resolved alerts are kept
    pub fn new(subscriber_buffer: usize, resolved_grace: Duration) -> Self {
        Self {
            book: Mutex::new(AlertBook::default()),
            broadcaster: Broadcaster::new("alerts", subscriber_buffer),
            resolved_grace,
            created: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            delivery_failures: Arc::new(AtomicU64::new(0)),
            sink_subscription: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AlertBook> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Route every new alert to `sink` through its own subscriber
    ///
    /// Replaces a previously attached sink. Delivery failures are logged and
    /// counted, never retried.
    pub fn attach_sink(&self, sink: Arc<dyn AlertSink>) -> io::Result<()> {
        let failures = Arc::clone(&self.delivery_failures);
        let subscription = self.broadcaster.subscribe(move |alert: &Alert| {
            if let Err(e) = sink.deliver(alert) {
                failures.fetch_add(1, Ordering::Relaxed);
                error!("Alert sink failed for {}: {}", alert.id, e);
            }
        })?;
        let previous = self
            .sink_subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(subscription);
        drop(previous);
        Ok(())
    }

    pub fn raise(&self, draft: AlertDraft, now: Timestamp) -> RaiseOutcome {
        let key = (draft.alert_type, draft.source_ref.clone());
        let outcome = {
            let mut book = self.lock();
            let existing = book.open.get(&key).cloned();
            let open = match existing {
                Some(id) => book.alerts.get_mut(&id),
                None => None,
            };
            match open {
                Some(alert) => {
                    alert.count += 1;
                    alert.last_seen = alert.last_seen.max(now);
                    alert.severity = alert.severity.max(draft.severity);
                    RaiseOutcome::Deduplicated(alert.clone())
                }
                None => {
                    let alert = Alert {
                        id: Uuid::new_v4().to_string(),
                        alert_type: draft.alert_type,
                        severity: draft.severity,
                        title: truncate_text(&draft.title, MAX_TITLE_LENGTH),
                        description: truncate_text(&draft.description, MAX_DESCRIPTION_LENGTH),
                        source_ref: draft.source_ref,
                        created_at: now,
                        last_seen: now,
                        count: 1,
                        acknowledged: false,
                        resolved: false,
                        resolved_at: None,
                    };
                    book.open.insert(key, alert.id.clone());
                    book.alerts.insert(alert.id.clone(), alert.clone());
                    RaiseOutcome::Created(alert)
                }
            }
        };

        match &outcome {
            RaiseOutcome::Created(alert) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Alert {} created: [{}] {}",
                    alert.id, alert.severity, alert.title
                );
                self.broadcaster.publish(alert);
            }
            RaiseOutcome::Deduplicated(_) => {
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    /// Raise a pattern alert for a created or reactivated pattern
    pub fn on_pattern(&self, assignment: &ClusterAssignment, now: Timestamp) -> Option<RaiseOutcome> {
        let pattern = &assignment.pattern;
        let title = match assignment.kind {
            AssignmentKind::Matched => return None,
            AssignmentKind::Created => format!("New error pattern: {}", pattern.sample_message),
            AssignmentKind::Reactivated => {
                format!("Error pattern reactivated: {}", pattern.sample_message)
            }
        };
        let description = format!(
            "Component '{}', {} occurrence(s), first seen {}",
            pattern.centroid_fingerprint.component, pattern.member_count, pattern.first_seen
        );
        Some(self.raise(
            AlertDraft {
                alert_type: AlertType::Pattern,
                severity: pattern.severity,
                title,
                description,
                source_ref: pattern.id.clone(),
            },
            now,
        ))
    }

    pub fn on_anomaly(&self, anomaly: &Anomaly, now: Timestamp) -> RaiseOutcome {
        self.raise(
            AlertDraft {
                alert_type: AlertType::Anomaly,
                severity: anomaly.severity,
                title: format!(
                    "Error volume anomaly: {} errors, expected {:.1}",
                    anomaly.observed, anomaly.expected
                ),
                description: format!(
                    "Bucket starting {} deviates by {:.1} ({:.1} standard deviations)",
                    anomaly.timestamp, anomaly.deviation, anomaly.z_score
                ),
                source_ref: ANOMALY_SOURCE_REF.to_string(),
            },
            now,
        )
    }

    pub fn on_trigger(&self, context: &TriggerContext, now: Timestamp) -> RaiseOutcome {
        self.raise(
            AlertDraft {
                alert_type: AlertType::Threshold,
                severity: context.expected_severity,
                title: format!("Threshold '{}' breached", context.triggered_by),
                description: context.trigger_reason.clone(),
                source_ref: context.triggered_by.clone(),
            },
            now,
        )
    }

    /// Raise an alert about the analytics pipeline itself
    pub fn raise_system(
        &self,
        source_ref: &str,
        severity: Severity,
        title: &str,
        description: &str,
        now: Timestamp,
    ) -> RaiseOutcome {
        self.raise(
            AlertDraft {
                alert_type: AlertType::System,
                severity,
                title: title.to_string(),
                description: description.to_string(),
                source_ref: source_ref.to_string(),
            },
            now,
        )
    }

    /// # Errors
    ///
    /// Returns `AlertError::NotFound` for an unknown or purged id.
    pub fn acknowledge(&self, id: &str) -> Result<Alert, AlertError> {
        let mut book = self.lock();
        let alert = book
            .alerts
            .get_mut(id)
            .ok_or_else(|| AlertError::NotFound(id.to_string()))?;
        alert.acknowledged = true;
        Ok(alert.clone())
    }

    /// Resolve an alert; a later raise for the same source creates a new one
    ///
    /// Resolving twice keeps the first resolution time.
    pub fn resolve(&self, id: &str, now: Timestamp) -> Result<Alert, AlertError> {
        let mut book = self.lock();
        let alert = book
            .alerts
            .get_mut(id)
            .ok_or_else(|| AlertError::NotFound(id.to_string()))?;
        if !alert.resolved {
            alert.resolved = true;
            alert.resolved_at = Some(now);
        }
        let snapshot = alert.clone();
        let key = (snapshot.alert_type, snapshot.source_ref.clone());
        if book.open.get(&key) == Some(&snapshot.id) {
            book.open.remove(&key);
        }
        Ok(snapshot)
    }

    /// Drop alerts resolved longer than the grace period ago
    pub fn purge_resolved(&self, now: Timestamp) -> usize {
        let mut book = self.lock();
        let before = book.alerts.len();
        let grace = self.resolved_grace;
        book.alerts.retain(|_, alert| match alert.resolved_at {
            Some(resolved_at) => now - resolved_at < grace,
            None => true,
        });
        before - book.alerts.len()
    }

    /// Alerts matching `filter`, newest first
    pub fn alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        let book = self.lock();
        let mut alerts: Vec<Alert> = book
            .alerts
            .values()
            .filter(|alert| filter.include_resolved || !alert.resolved)
            .filter(|alert| filter.alert_type.map_or(true, |t| t == alert.alert_type))
            .filter(|alert| filter.min_severity.map_or(true, |s| alert.severity >= s))
            .filter(|alert| filter.acknowledged.map_or(true, |a| a == alert.acknowledged))
            .cloned()
            .collect();
        drop(book);

        alerts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = filter.limit {
            alerts.truncate(limit);
        }
        alerts
    }

    pub fn get(&self, id: &str) -> Option<Alert> {
        self.lock().alerts.get(id).cloned()
    }

    pub fn open_count(&self) -> usize {
        self.lock().open.len()
    }

    pub fn subscribe<F>(&self, callback: F) -> io::Result<Subscription<Alert>>
    where
        F: Fn(&Alert) + Send + 'static,
    {
        self.broadcaster.subscribe(callback)
    }

    pub fn alerts_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn alerts_deduplicated(&self) -> u64 {
        self.deduplicated.load(Ordering::Relaxed)
    }

    /// Alerts dropped for slow subscribers
    pub fn subscriber_drops(&self) -> u64 {
        self.broadcaster.dropped_total()
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }
}

/// Truncate text to a maximum byte length on a character boundary
///
/// Truncated text ends with `...` and stays within `max_length` bytes.
pub fn truncate_text(text: &str, max_length: usize) -> String {
    if text.len() <= max_length {
        return text.to_string();
    }
    let mut truncate_at = max_length.saturating_sub(3);
    while truncate_at > 0 && !text.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    format!("{}...", &text[..truncate_at])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::sink::MockAlertSink;
    use crate::events::ErrorDomain;
    use crate::fingerprint::Fingerprint;
    use crate::patterns::{ErrorPattern, ImpactScope, PatternImpact};
    use chrono::{TimeZone, Utc};
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    fn base() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn engine() -> AlertEngine {
        AlertEngine::new(16, Duration::hours(1))
    }

    fn draft(alert_type: AlertType, source_ref: &str, severity: Severity) -> AlertDraft {
        AlertDraft {
            alert_type,
            severity,
            title: "title".to_string(),
            description: "description".to_string(),
            source_ref: source_ref.to_string(),
        }
    }

    fn assignment(kind: AssignmentKind) -> ClusterAssignment {
        ClusterAssignment {
            kind,
            pattern: ErrorPattern {
                id: "pat_0123456789abcdef".to_string(),
                centroid_fingerprint: Fingerprint {
                    normalized_message: "timeout after <num> ms".to_string(),
                    stack_shape_hash: String::new(),
                    component: "api".to_string(),
                    route: None,
                    key: "0123456789abcdef".repeat(4),
                },
                sample_message: "timeout after 300 ms".to_string(),
                member_count: 1,
                first_seen: base(),
                last_seen: base(),
                affected_users: 1,
                severity: Severity::High,
                domain: ErrorDomain::Network,
                impact: PatternImpact {
                    user_experience: 0.75,
                    business_impact: 0.5,
                    frequency: 1.0,
                    scope: ImpactScope::Isolated,
                },
                dormant: false,
            },
        }
    }

    #[test]
    fn test_dedup_while_unresolved() {
        let engine = engine();
        let first = engine.raise(draft(AlertType::Threshold, "rate", Severity::Medium), base());
        assert!(first.is_created());

        let second = engine.raise(
            draft(AlertType::Threshold, "rate", Severity::Critical),
            base() + Duration::seconds(10),
        );
        assert!(!second.is_created());
        assert_eq!(second.alert().id, first.alert().id);
        assert_eq!(second.alert().count, 2);
        assert_eq!(second.alert().severity, Severity::Critical);
        assert_eq!(second.alert().last_seen, base() + Duration::seconds(10));
        assert_eq!(engine.alerts(&AlertFilter::default()).len(), 1);
        assert_eq!(engine.alerts_deduplicated(), 1);
    }

    #[test]
    fn test_same_source_different_type_is_distinct() {
        let engine = engine();
        engine.raise(draft(AlertType::Threshold, "x", Severity::Low), base());
        let other = engine.raise(draft(AlertType::System, "x", Severity::Low), base());
        assert!(other.is_created());
        assert_eq!(engine.open_count(), 2);
    }

    #[test]
    fn test_resolve_allows_new_alert() {
        let engine = engine();
        let first = engine.raise(draft(AlertType::Anomaly, ANOMALY_SOURCE_REF, Severity::High), base());
        let resolved = engine.resolve(&first.alert().id, base()).unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolved_at, Some(base()));

        let again = engine.raise(draft(AlertType::Anomaly, ANOMALY_SOURCE_REF, Severity::High), base());
        assert!(again.is_created());
        assert_ne!(again.alert().id, first.alert().id);
        assert_eq!(engine.alerts(&AlertFilter::default()).len(), 1);
        let all = AlertFilter {
            include_resolved: true,
            ..AlertFilter::default()
        };
        assert_eq!(engine.alerts(&all).len(), 2);
    }

    #[test]
    fn test_acknowledge_and_unknown_ids() {
        let engine = engine();
        let alert = engine.raise(draft(AlertType::System, "storage", Severity::Critical), base());
        let acknowledged = engine.acknowledge(&alert.alert().id).unwrap();
        assert!(acknowledged.acknowledged);
        assert!(!acknowledged.resolved);

        assert_eq!(
            engine.acknowledge("missing"),
            Err(AlertError::NotFound("missing".to_string()))
        );
        assert!(matches!(
            engine.resolve("missing", base()),
            Err(AlertError::NotFound(_))
        ));
    }

    #[test]
    fn test_purge_after_grace() {
        let engine = engine();
        let alert = engine.raise(draft(AlertType::System, "storage", Severity::High), base());
        engine.resolve(&alert.alert().id, base()).unwrap();
        assert_eq!(engine.purge_resolved(base() + Duration::minutes(30)), 0);
        assert_eq!(engine.purge_resolved(base() + Duration::minutes(61)), 1);
        assert!(engine.get(&alert.alert().id).is_none());
    }

    #[test]
    fn test_pattern_alerts_only_for_new_or_reactivated() {
        let engine = engine();
        assert!(engine
            .on_pattern(&assignment(AssignmentKind::Matched), base())
            .is_none());
        let created = engine
            .on_pattern(&assignment(AssignmentKind::Created), base())
            .unwrap();
        assert!(created.is_created());
        assert_eq!(created.alert().alert_type, AlertType::Pattern);
        assert_eq!(created.alert().source_ref, "pat_0123456789abcdef");
        assert!(created.alert().title.starts_with("New error pattern"));
    }

    #[test]
    fn test_filter_by_type_and_severity() {
        let engine = engine();
        engine.raise(draft(AlertType::Threshold, "a", Severity::Low), base());
        engine.raise(
            draft(AlertType::Anomaly, "b", Severity::Critical),
            base() + Duration::seconds(1),
        );
        let filter = AlertFilter {
            min_severity: Some(Severity::High),
            ..AlertFilter::default()
        };
        let alerts = engine.alerts(&filter);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::Anomaly);

        let filter = AlertFilter {
            alert_type: Some(AlertType::Threshold),
            ..AlertFilter::default()
        };
        assert_eq!(engine.alerts(&filter)[0].source_ref, "a");
    }

    #[test]
    fn test_subscribers_receive_only_created_alerts() {
        let engine = engine();
        let (tx, rx) = mpsc::channel();
        let _subscription = engine
            .subscribe(move |alert: &Alert| {
                let _ = tx.send(alert.id.clone());
            })
            .unwrap();

        let first = engine.raise(draft(AlertType::Threshold, "rate", Severity::High), base());
        engine.raise(draft(AlertType::Threshold, "rate", Severity::High), base());
        assert_eq!(
            rx.recv_timeout(StdDuration::from_secs(5)).unwrap(),
            first.alert().id
        );
        assert!(rx.recv_timeout(StdDuration::from_millis(100)).is_err());
    }

    #[test]
    fn test_sink_failures_are_counted() {
        let engine = engine();
        let (tx, rx) = mpsc::channel();
        let mut sink = MockAlertSink::new();
        sink.expect_deliver().times(1).returning(move |_| {
            let _ = tx.send(());
            Err(AlertError::DeliveryFailed("gateway down".to_string()))
        });
        engine.attach_sink(Arc::new(sink)).unwrap();

        engine.raise(draft(AlertType::System, "storage", Severity::Critical), base());
        rx.recv_timeout(StdDuration::from_secs(5)).unwrap();
        let deadline = std::time::Instant::now() + StdDuration::from_secs(5);
        while engine.delivery_failures() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(StdDuration::from_millis(5));
        }
        assert_eq!(engine.delivery_failures(), 1);
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("This is a long text", 10), "This is...");
        let text = "Hello 世界 wide";
        let truncated = truncate_text(text, 10);
        assert!(truncated.len() <= 10);
        assert!(truncated.ends_with("..."));
    }
}
