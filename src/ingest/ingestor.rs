//! Validation and normalisation of inbound error events

use crate::error::IngestError;
use crate::events::{ErrorDomain, ErrorEvent, RawErrorEvent, Severity, Timestamp};
use chrono::{Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Component name used when the host omits one
pub const UNKNOWN_COMPONENT: &str = "unknown";

/// Maximum number of stack frames kept on an event
const MAX_STORED_FRAMES: usize = 64;

/// Counts of events rejected by the ingestor
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DropCounts {
    pub malformed: u64,
    pub out_of_window: u64,
}

impl DropCounts {
    pub fn total(&self) -> u64 {
        self.malformed + self.out_of_window
    }
}

/// Validates raw events and turns them into immutable `ErrorEvent`s
///
/// Rejections never propagate past the caller as faults: they are returned
/// as `IngestError` and counted in `drop_counts()`.
#[derive(Debug)]
pub struct EventIngestor {
    /// Oldest accepted age of an event
    retention_horizon: Duration,
    /// Accepted distance into the future
    clock_skew_tolerance: Duration,
    malformed: AtomicU64,
    out_of_window: AtomicU64,
}

impl EventIngestor {
    pub fn new(retention_horizon: Duration, clock_skew_tolerance: Duration) -> Self {
        Self {
            retention_horizon,
            clock_skew_tolerance,
            malformed: AtomicU64::new(0),
            out_of_window: AtomicU64::new(0),
        }
    }

    /// Validate an event against the current wall clock
    pub fn ingest(&self, raw: RawErrorEvent) -> Result<ErrorEvent, IngestError> {
        self.ingest_at(raw, Utc::now())
    }

    /// Validate an event against an explicit `now`
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Malformed` when id, timestamp, message, severity
    /// or domain are missing or invalid, and `IngestError::OutOfWindow` when
    /// the timestamp is further in the future than the clock-skew tolerance
    /// or older than the retention horizon.
    pub fn ingest_at(&self, raw: RawErrorEvent, now: Timestamp) -> Result<ErrorEvent, IngestError> {
        let result = self.validate(raw, now);
        if let Err(e) = &result {
            match e {
                IngestError::Malformed(_) => self.malformed.fetch_add(1, Ordering::Relaxed),
                IngestError::OutOfWindow { .. } => {
                    self.out_of_window.fetch_add(1, Ordering::Relaxed)
                }
            };
            debug!("Dropped inbound event: {}", e);
        }
        result
    }

    fn validate(&self, raw: RawErrorEvent, now: Timestamp) -> Result<ErrorEvent, IngestError> {
        let id = required_text(raw.id, "id")?;
        let timestamp = raw
            .timestamp
            .ok_or_else(|| IngestError::Malformed("missing timestamp".to_string()))?;
        let message = required_text(raw.message, "message")?;
        let severity_name = required_text(raw.severity, "severity")?;
        let severity = Severity::parse(&severity_name).ok_or_else(|| {
            IngestError::Malformed(format!("unrecognised severity '{}'", severity_name))
        })?;
        let domain = ErrorDomain::parse(&required_text(raw.domain, "domain")?);

        let latest = now.checked_add_signed(self.clock_skew_tolerance);
        if latest.is_some_and(|latest| timestamp > latest) {
            return Err(IngestError::OutOfWindow {
                timestamp,
                reason: "timestamp is in the future beyond clock-skew tolerance".to_string(),
            });
        }
        let oldest = now.checked_sub_signed(self.retention_horizon);
        if oldest.is_some_and(|oldest| timestamp < oldest) {
            return Err(IngestError::OutOfWindow {
                timestamp,
                reason: "timestamp is older than the retention horizon".to_string(),
            });
        }

        let stack_frames = raw
            .stack
            .as_deref()
            .map(|stack| {
                stack
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .take(MAX_STORED_FRAMES)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(ErrorEvent {
            id,
            timestamp,
            severity,
            domain,
            message,
            stack_frames,
            component: optional_text(raw.component)
                .unwrap_or_else(|| UNKNOWN_COMPONENT.to_string()),
            route: optional_text(raw.route),
            user_id: optional_text(raw.user_id),
            session_id: optional_text(raw.session_id),
            recoverable: raw.recoverable.unwrap_or(false),
        })
    }

    /// Number of events dropped so far, by reason
    pub fn drop_counts(&self) -> DropCounts {
        DropCounts {
            malformed: self.malformed.load(Ordering::Relaxed),
            out_of_window: self.out_of_window.load(Ordering::Relaxed),
        }
    }
}

fn required_text(value: Option<String>, field: &str) -> Result<String, IngestError> {
    optional_text(value).ok_or_else(|| IngestError::Malformed(format!("missing {}", field)))
}

fn optional_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn ingestor() -> EventIngestor {
        EventIngestor::new(Duration::hours(24), Duration::seconds(30))
    }

    fn valid_raw() -> RawErrorEvent {
        RawErrorEvent {
            id: Some("evt-1".to_string()),
            timestamp: Some(now() - Duration::seconds(5)),
            severity: Some("High".to_string()),
            domain: Some("network".to_string()),
            message: Some("Request to upstream failed".to_string()),
            stack: Some("at fetch (src/http.ts:10:3)\n\n  at main (src/index.ts:2:1)".to_string()),
            component: Some("gateway".to_string()),
            route: Some("/orders".to_string()),
            user_id: Some("u-1".to_string()),
            session_id: None,
            recoverable: Some(true),
        }
    }

    #[test]
    fn test_valid_event_is_normalised() {
        let event = ingestor().ingest_at(valid_raw(), now()).unwrap();
        assert_eq!(event.severity, Severity::High);
        assert_eq!(event.domain, ErrorDomain::Network);
        assert_eq!(event.stack_frames.len(), 2);
        assert_eq!(event.component, "gateway");
        assert!(event.recoverable);
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let ingestor = ingestor();
        for strip in ["id", "timestamp", "message", "severity", "domain"] {
            let mut raw = valid_raw();
            match strip {
                "id" => raw.id = None,
                "timestamp" => raw.timestamp = None,
                "message" => raw.message = Some("   ".to_string()),
                "severity" => raw.severity = None,
                _ => raw.domain = None,
            }
            let result = ingestor.ingest_at(raw, now());
            assert!(
                matches!(result, Err(IngestError::Malformed(_))),
                "expected malformed when {} missing",
                strip
            );
        }
        assert_eq!(ingestor.drop_counts().malformed, 5);
    }

    #[test]
    fn test_unknown_severity_is_malformed() {
        let mut raw = valid_raw();
        raw.severity = Some("fatal".to_string());
        assert!(matches!(
            ingestor().ingest_at(raw, now()),
            Err(IngestError::Malformed(_))
        ));
    }

    #[test]
    fn test_future_and_stale_timestamps_out_of_window() {
        let ingestor = ingestor();

        let mut future = valid_raw();
        future.timestamp = Some(now() + Duration::minutes(5));
        assert!(matches!(
            ingestor.ingest_at(future, now()),
            Err(IngestError::OutOfWindow { .. })
        ));

        let mut skewed = valid_raw();
        skewed.timestamp = Some(now() + Duration::seconds(20));
        assert!(ingestor.ingest_at(skewed, now()).is_ok());

        let mut stale = valid_raw();
        stale.timestamp = Some(now() - Duration::hours(25));
        assert!(matches!(
            ingestor.ingest_at(stale, now()),
            Err(IngestError::OutOfWindow { .. })
        ));

        let counts = ingestor.drop_counts();
        assert_eq!(counts.out_of_window, 2);
        assert_eq!(counts.malformed, 0);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn test_defaults_for_optional_fields() {
        let mut raw = valid_raw();
        raw.component = None;
        raw.recoverable = None;
        raw.stack = None;
        raw.user_id = Some("".to_string());
        let event = ingestor().ingest_at(raw, now()).unwrap();
        assert_eq!(event.component, UNKNOWN_COMPONENT);
        assert!(!event.recoverable);
        assert!(event.stack_frames.is_empty());
        assert!(event.user_id.is_none());
    }
}
