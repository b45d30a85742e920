//! Core event types and enums for the error analytics core
//!
//! This module defines the records flowing through the pipeline: the raw
//! inbound event as received from the host application, the validated
//! `ErrorEvent`, recovery attempts, and the shared time range type.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Severity of an error event, pattern, anomaly or alert
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    /// Position in fixed-size breakdown arrays
    pub fn index(self) -> usize {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }

    /// Weight in [0, 1] used by impact scoring
    pub fn weight(self) -> f64 {
        match self {
            Severity::Low => 0.25,
            Severity::Medium => 0.5,
            Severity::High => 0.75,
            Severity::Critical => 1.0,
        }
    }

    /// Parse a case-insensitive severity name
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Functional domain an error belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ErrorDomain {
    Network,
    Auth,
    Validation,
    System,
    Unknown,
}

impl ErrorDomain {
    pub const ALL: [ErrorDomain; 5] = [
        ErrorDomain::Network,
        ErrorDomain::Auth,
        ErrorDomain::Validation,
        ErrorDomain::System,
        ErrorDomain::Unknown,
    ];

    /// Position in fixed-size breakdown arrays
    pub fn index(self) -> usize {
        match self {
            ErrorDomain::Network => 0,
            ErrorDomain::Auth => 1,
            ErrorDomain::Validation => 2,
            ErrorDomain::System => 3,
            ErrorDomain::Unknown => 4,
        }
    }

    /// Parse a domain name; unrecognised names map to `Unknown`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "network" => ErrorDomain::Network,
            "auth" | "authentication" | "authorization" => ErrorDomain::Auth,
            "validation" => ErrorDomain::Validation,
            "system" => ErrorDomain::System,
            _ => ErrorDomain::Unknown,
        }
    }
}

/// Error event exactly as submitted by the host application
///
/// Every field is optional so that validation happens in the ingestor
/// rather than in the deserializer; missing required fields are reported as
/// `IngestError::Malformed`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawErrorEvent {
    pub id: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub severity: Option<String>,
    pub domain: Option<String>,
    pub message: Option<String>,
    /// Raw stack trace, one frame per line
    pub stack: Option<String>,
    pub component: Option<String>,
    pub route: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub recoverable: Option<bool>,
}

/// Validated, immutable error event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub id: String,
    pub timestamp: Timestamp,
    pub severity: Severity,
    pub domain: ErrorDomain,
    pub message: String,
    /// Stack frames in call order, innermost first
    pub stack_frames: Vec<String>,
    pub component: String,
    pub route: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub recoverable: bool,
}

/// Outcome of an automated recovery attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryOutcome {
    Success,
    Failure,
}

/// Recovery attempt reported by the host application when it retries or falls back
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAttempt {
    pub strategy_id: String,
    pub error_id: String,
    pub started_at: Timestamp,
    pub outcome: RecoveryOutcome,
    pub duration_ms: u64,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Half-open time interval `[start, end)`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Range of the given length ending at `end`
    ///
    /// The start saturates at the earliest representable timestamp.
    pub fn ending_at(end: Timestamp, length: Duration) -> Self {
        Self::checked_ending_at(end, length).unwrap_or(Self {
            start: DateTime::<Utc>::MIN_UTC,
            end,
        })
    }

    /// Range of the given length ending at `end`, or `None` when its start
    /// falls before the earliest representable timestamp
    pub fn checked_ending_at(end: Timestamp, length: Duration) -> Option<Self> {
        end.checked_sub_signed(length)
            .map(|start| Self { start, end })
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }
}
