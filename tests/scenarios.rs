//! End-to-end behaviour of the analytics core through its public API

use chrono::{Duration, TimeZone, Utc};
use faultline::alerts::AlertType;
use faultline::config::{ThresholdMetric, ThresholdOperator, ThresholdRuleConfig};
use faultline::{
    Alert, AlertFilter, AnalyticsConfig, AnalyticsCore, AnalyticsStore, ErrorEvent, ErrorPattern,
    InMemoryStore, OverviewFilter, PatternFilter, RawErrorEvent, RecoveryAttempt, RecoveryFilter,
    RecoveryOutcome, Severity, StorageError, TimeRange, TimeSeriesPoint, Timestamp, TrendFilter,
    TrendPeriod,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Instant;

fn base() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap()
}

fn raw(id: String, at: Timestamp, message: &str, component: &str) -> RawErrorEvent {
    RawErrorEvent {
        id: Some(id),
        timestamp: Some(at),
        severity: Some("high".to_string()),
        domain: Some("network".to_string()),
        message: Some(message.to_string()),
        stack: Some("at fetchCart (cart.js:10:5)\nat handler (server.js:88:3)".to_string()),
        component: Some(component.to_string()),
        user_id: Some("user-1".to_string()),
        ..RawErrorEvent::default()
    }
}

fn core_with(config: AnalyticsConfig) -> AnalyticsCore {
    AnalyticsCore::new_at(config, Arc::new(InMemoryStore::default()), base()).unwrap()
}

#[test]
fn identical_events_form_one_pattern() {
    let core = core_with(AnalyticsConfig::default());
    for i in 0..100 {
        let at = base() + Duration::milliseconds(i * 500);
        let receipt = core.ingest_at(
            raw(format!("a-{}", i), at, "Cart service unavailable", "cart"),
            at,
        );
        assert!(receipt.accepted);
    }

    let now = base() + Duration::seconds(59);
    let overview = core
        .query()
        .get_overview_at(
            &OverviewFilter::range(TimeRange::new(base(), base() + Duration::minutes(1))),
            now,
        )
        .unwrap();
    assert_eq!(overview.data.total_errors, 100);
    assert_eq!(overview.data.unique_errors, 1);
    assert_eq!(overview.data.affected_users, 1);

    let patterns = core
        .query()
        .get_patterns_at(&PatternFilter::default(), now)
        .unwrap()
        .data;
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].member_count, 100);
}

#[test]
fn burst_after_steady_rate_is_flagged() {
    let core = core_with(AnalyticsConfig::default());
    let mut id = 0;
    let mut feed_minute = |minute: i64, per_minute: i64| {
        let start = base() + Duration::minutes(minute);
        for n in 0..per_minute {
            let at = start + Duration::milliseconds(n * 60_000 / per_minute);
            id += 1;
            core.ingest_at(
                raw(format!("b-{}", id), at, "Upstream request timed out", "gateway"),
                at,
            );
        }
        core.tick_at(start + Duration::minutes(1) + Duration::seconds(10));
    };

    for minute in 0..120 {
        feed_minute(minute, 5);
    }
    for minute in 120..125 {
        feed_minute(minute, 200);
    }

    let now = base() + Duration::minutes(126);
    let trend = core
        .query()
        .get_trend_at(TrendPeriod::Hour, &TrendFilter::default(), now)
        .unwrap()
        .data;

    let burst_start = base() + Duration::minutes(120);
    let in_burst: Vec<_> = trend
        .anomalies
        .iter()
        .filter(|anomaly| anomaly.timestamp >= burst_start)
        .collect();
    assert!(!in_burst.is_empty());
    assert!(in_burst
        .iter()
        .any(|anomaly| anomaly.severity >= Severity::High));
    assert!(trend
        .anomalies
        .iter()
        .all(|anomaly| anomaly.timestamp >= burst_start));

    let alerts = core
        .query()
        .get_alerts(&AlertFilter {
            alert_type: Some(AlertType::Anomaly),
            ..AlertFilter::default()
        })
        .unwrap()
        .data;
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].severity >= Severity::High);
}

#[test]
fn sustained_threshold_breach_emits_one_alert() {
    let config = AnalyticsConfig {
        thresholds: vec![ThresholdRuleConfig {
            name: "error-rate".to_string(),
            metric: ThresholdMetric::ErrorRate,
            operator: ThresholdOperator::Gt,
            value: 10.0,
            duration_seconds: 60,
            window_seconds: 60,
            severity: Severity::High,
        }],
        ..AnalyticsConfig::default()
    };
    let core = core_with(config);

    let (tx, rx) = mpsc::channel::<Alert>();
    let tx = Mutex::new(tx);
    let subscription = core
        .query()
        .subscribe_alerts(move |alert: &Alert| {
            if alert.alert_type == AlertType::Threshold {
                let _ = tx
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .send(alert.clone());
            }
        })
        .unwrap();

    // 30 errors per minute for 90 seconds, ticking every 10 seconds
    for second in 0..=180 {
        let now = base() + Duration::seconds(second);
        if second <= 90 && second % 2 == 0 {
            core.ingest_at(
                raw(format!("c-{}", second), now, "Payment declined by provider", "billing"),
                now,
            );
        }
        if second > 0 && second % 10 == 0 {
            core.tick_at(now);
        }
    }

    let alerts = core
        .query()
        .get_alerts(&AlertFilter {
            alert_type: Some(AlertType::Threshold),
            ..AlertFilter::default()
        })
        .unwrap()
        .data;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].source_ref, "error-rate");
    assert!(alerts[0].count > 1);

    let delivered = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
    assert_eq!(delivered.id, alerts[0].id);
    subscription.unsubscribe();
    assert!(rx.try_recv().is_err());
}

#[test]
fn recovery_success_rate() {
    let core = core_with(AnalyticsConfig::default());
    for i in 0..20 {
        core.record_recovery_attempt(RecoveryAttempt {
            strategy_id: "retry-with-backoff".to_string(),
            error_id: format!("d-{}", i),
            started_at: base() + Duration::seconds(i),
            outcome: if i < 15 {
                RecoveryOutcome::Success
            } else {
                RecoveryOutcome::Failure
            },
            duration_ms: 100 + i as u64 * 10,
            failure_reason: (i >= 15).then(|| "upstream still unavailable".to_string()),
        });
    }

    let analytics = core
        .query()
        .get_recovery_analytics(&RecoveryFilter {
            strategy_id: Some("retry-with-backoff".to_string()),
            ..RecoveryFilter::default()
        })
        .unwrap()
        .data;
    assert_eq!(analytics.strategies.len(), 1);
    let stats = &analytics.strategies[0];
    assert_eq!(stats.total_attempts, 20);
    assert_eq!(stats.success_rate, 0.75);
    assert!(!stats.low_confidence);
    assert_eq!(stats.failure_reasons[0].count, 5);
}

#[test]
fn blocked_subscriber_never_blocks_ingestion() {
    let config = AnalyticsConfig {
        subscriber_buffer: 1,
        alert_tick_interval_seconds: 1,
        ..AnalyticsConfig::default()
    };
    let core = core_with(config);

    let (release, gate) = mpsc::channel::<()>();
    let gate = Mutex::new(gate);
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let subscription = core
        .query()
        .subscribe_alerts(move |_alert: &Alert| {
            counter.fetch_add(1, Ordering::SeqCst);
            // Blocks well past the tick interval until released
            let _ = gate
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .recv_timeout(std::time::Duration::from_secs(5));
        })
        .unwrap();

    let started = Instant::now();
    for i in 0..20 {
        let at = base() + Duration::seconds(i);
        let receipt = core.ingest_at(
            raw(
                format!("e-{}", i),
                at,
                &format!("Worker {} crashed", i),
                &format!("worker-{}", i),
            ),
            at,
        );
        assert!(receipt.accepted);
    }
    assert!(started.elapsed() < std::time::Duration::from_secs(2));

    assert!(subscription.dropped() >= 1);
    let metrics = core
        .query()
        .get_real_time_at(base() + Duration::seconds(20))
        .data;
    assert!(metrics.subscriber_drops >= 1);
    assert_eq!(metrics.alerts_created, 20);

    drop(release);
    subscription.unsubscribe();
    assert!(received.load(Ordering::SeqCst) <= 2);
}

/// Store whose event log has failed permanently
struct BrokenStore;

impl AnalyticsStore for BrokenStore {
    fn append_event(&self, _event: &ErrorEvent, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Fatal("volume is read-only".to_string()))
    }

    fn upsert_pattern(&self, _pattern: &ErrorPattern) -> Result<(), StorageError> {
        Ok(())
    }

    fn append_bucket(&self, _point: &TimeSeriesPoint) -> Result<(), StorageError> {
        Ok(())
    }

    fn read_buckets_in_range(&self, _range: TimeRange) -> Result<Vec<TimeSeriesPoint>, StorageError> {
        Ok(Vec::new())
    }
}

#[test]
fn fatal_storage_failure_serves_stale_results() {
    let core =
        AnalyticsCore::new_at(AnalyticsConfig::default(), Arc::new(BrokenStore), base()).unwrap();
    for i in 0..3 {
        let at = base() + Duration::seconds(i);
        assert!(
            core.ingest_at(raw(format!("f-{}", i), at, "Disk quota exceeded", "uploads"), at)
                .accepted
        );
    }

    let now = base() + Duration::seconds(5);
    let overview = core
        .query()
        .get_overview_at(&OverviewFilter::default(), now)
        .unwrap();
    assert_eq!(overview.data.total_errors, 3);
    assert!(overview.staleness.degraded);
    assert_eq!(overview.staleness.degraded_since, Some(base()));

    let system = core
        .query()
        .get_alerts(&AlertFilter {
            alert_type: Some(AlertType::System),
            ..AlertFilter::default()
        })
        .unwrap()
        .data;
    assert_eq!(system.len(), 1);
    assert_eq!(system[0].source_ref, faultline::STORAGE_SOURCE_REF);
    assert_eq!(system[0].count, 1);
}
