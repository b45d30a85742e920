//! Fixed-width time bucket and the summary point it closes into

use crate::aggregator::hyperloglog::HyperLogLog;
use crate::events::{ErrorDomain, ErrorEvent, Severity, Timestamp};
use crate::fingerprint::{stable_hash64, Fingerprint};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Lifecycle of a bucket
///
/// `Open` while its window is current, `Closing` after the window ended but
/// within the late-event grace, `Closed` once immutable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BucketState {
    Open,
    Closing,
    Closed,
}

/// Counts per severity level
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeverityBreakdown {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

impl SeverityBreakdown {
    pub fn from_counts(counts: &[u64; 4]) -> Self {
        Self {
            low: counts[Severity::Low.index()],
            medium: counts[Severity::Medium.index()],
            high: counts[Severity::High.index()],
            critical: counts[Severity::Critical.index()],
        }
    }

    pub fn get(&self, severity: Severity) -> u64 {
        match severity {
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }
}

/// Counts per error domain
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainBreakdown {
    pub network: u64,
    pub auth: u64,
    pub validation: u64,
    pub system: u64,
    pub unknown: u64,
}

impl DomainBreakdown {
    pub fn from_counts(counts: &[u64; 5]) -> Self {
        Self {
            network: counts[ErrorDomain::Network.index()],
            auth: counts[ErrorDomain::Auth.index()],
            validation: counts[ErrorDomain::Validation.index()],
            system: counts[ErrorDomain::System.index()],
            unknown: counts[ErrorDomain::Unknown.index()],
        }
    }

    pub fn get(&self, domain: ErrorDomain) -> u64 {
        match domain {
            ErrorDomain::Network => self.network,
            ErrorDomain::Auth => self.auth,
            ErrorDomain::Validation => self.validation,
            ErrorDomain::System => self.system,
            ErrorDomain::Unknown => self.unknown,
        }
    }
}

/// Summary of one closed bucket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPoint {
    /// Start of the bucket
    pub timestamp: Timestamp,
    pub total_errors: u64,
    /// Errors per minute within the bucket
    pub error_rate: f64,
    pub severity_breakdown: SeverityBreakdown,
    pub domain_breakdown: DomainBreakdown,
    /// Approximate count of distinct fingerprints
    pub unique_errors: u64,
}

/// Mutable aggregate for one bucket window
#[derive(Debug, Clone)]
pub struct TimeBucket {
    pub start: Timestamp,
    pub state: BucketState,
    pub total: u64,
    pub severity: [u64; 4],
    pub domain: [u64; 5],
    pub recoverable: u64,
    pub fingerprints: HyperLogLog,
    pub users: HyperLogLog,
}

impl TimeBucket {
    pub fn new(start: Timestamp) -> Self {
        Self {
            start,
            state: BucketState::Open,
            total: 0,
            severity: [0; 4],
            domain: [0; 5],
            recoverable: 0,
            fingerprints: HyperLogLog::default(),
            users: HyperLogLog::default(),
        }
    }

    /// Count an event; callers must not record into a closed bucket
    pub fn record(&mut self, event: &ErrorEvent, fingerprint: &Fingerprint) {
        debug_assert!(self.state != BucketState::Closed);
        self.total += 1;
        self.severity[event.severity.index()] += 1;
        self.domain[event.domain.index()] += 1;
        if event.recoverable {
            self.recoverable += 1;
        }
        self.fingerprints.insert_hash(fingerprint.hash64());
        if let Some(user) = &event.user_id {
            self.users.insert_hash(stable_hash64(user));
        }
    }

    pub fn to_point(&self, width: Duration) -> TimeSeriesPoint {
        let minutes = width.num_milliseconds() as f64 / 60_000.0;
        TimeSeriesPoint {
            timestamp: self.start,
            total_errors: self.total,
            error_rate: if minutes > 0.0 {
                self.total as f64 / minutes
            } else {
                0.0
            },
            severity_breakdown: SeverityBreakdown::from_counts(&self.severity),
            domain_breakdown: DomainBreakdown::from_counts(&self.domain),
            unique_errors: self.fingerprints.count(),
        }
    }
}
