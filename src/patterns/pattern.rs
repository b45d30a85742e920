//! Error pattern records and their impact score

use crate::aggregator::HyperLogLog;
use crate::events::{ErrorDomain, ErrorEvent, Severity, Timestamp};
use crate::fingerprint::{stable_hash64, Fingerprint};
use serde::{Deserialize, Serialize};

/// How far a pattern reaches across users
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ImpactScope {
    /// At most one affected user
    Isolated,
    /// Up to `WIDESPREAD_USERS` affected users
    Limited,
    Widespread,
}

/// Affected users above which a pattern is considered widespread
pub const WIDESPREAD_USERS: u64 = 10;

/// Impact estimate of a pattern
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatternImpact {
    /// In [0, 1]; severity weighted down by the recoverable share
    pub user_experience: f64,
    /// In [0, 1]; blends user experience, scope and frequency
    pub business_impact: f64,
    /// Events per hour over the pattern's active lifetime
    pub frequency: f64,
    pub scope: ImpactScope,
}

/// A recurring fault: events grouped under one fixed centroid fingerprint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPattern {
    pub id: String,
    /// Fingerprint of the event that created the pattern; never recomputed
    pub centroid_fingerprint: Fingerprint,
    /// Message of the event that created the pattern
    pub sample_message: String,
    pub member_count: u64,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    /// Approximate distinct users
    pub affected_users: u64,
    /// Highest severity among members
    pub severity: Severity,
    /// Domain of the event that created the pattern
    pub domain: ErrorDomain,
    pub impact: PatternImpact,
    /// `last_seen` is older than the retention horizon
    pub dormant: bool,
}

/// Mutable cluster state owned by the clusterer
#[derive(Debug, Clone)]
pub(crate) struct PatternState {
    pub id: String,
    pub centroid: Fingerprint,
    pub tokens: Vec<String>,
    pub sample_message: String,
    pub member_count: u64,
    pub recoverable_count: u64,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub severity: Severity,
    pub domain: ErrorDomain,
    pub users: HyperLogLog,
}

impl PatternState {
    pub fn new(id: String, event: &ErrorEvent, fingerprint: &Fingerprint, tokens: Vec<String>) -> Self {
        let mut state = Self {
            id,
            centroid: fingerprint.clone(),
            tokens,
            sample_message: event.message.clone(),
            member_count: 0,
            recoverable_count: 0,
            first_seen: event.timestamp,
            last_seen: event.timestamp,
            severity: event.severity,
            domain: event.domain,
            users: HyperLogLog::default(),
        };
        state.absorb(event);
        state
    }

    /// Fold one member event into the metadata; the centroid is untouched
    pub fn absorb(&mut self, event: &ErrorEvent) {
        self.member_count += 1;
        if event.recoverable {
            self.recoverable_count += 1;
        }
        self.first_seen = self.first_seen.min(event.timestamp);
        self.last_seen = self.last_seen.max(event.timestamp);
        self.severity = self.severity.max(event.severity);
        if let Some(user) = &event.user_id {
            self.users.insert_hash(stable_hash64(user));
        }
    }

    pub fn is_dormant(&self, now: Timestamp, horizon: chrono::Duration) -> bool {
        now - self.last_seen > horizon
    }

    pub fn impact(&self) -> PatternImpact {
        let users = self.users.count();
        let scope = match users {
            0 | 1 => ImpactScope::Isolated,
            n if n <= WIDESPREAD_USERS => ImpactScope::Limited,
            _ => ImpactScope::Widespread,
        };
        let scope_factor = match scope {
            ImpactScope::Isolated => 0.2,
            ImpactScope::Limited => 0.6,
            ImpactScope::Widespread => 1.0,
        };

        let active_hours = ((self.last_seen - self.first_seen).num_seconds() as f64 / 3600.0).max(1.0);
        let frequency = self.member_count as f64 / active_hours;

        let recoverable_share = self.recoverable_count as f64 / self.member_count.max(1) as f64;
        let user_experience = self.severity.weight() * (1.0 - 0.5 * recoverable_share);
        let business_impact = (0.5 * user_experience
            + 0.3 * scope_factor
            + 0.2 * (frequency / 60.0).min(1.0))
        .clamp(0.0, 1.0);

        PatternImpact {
            user_experience,
            business_impact,
            frequency,
            scope,
        }
    }

    pub fn snapshot(&self, now: Timestamp, horizon: chrono::Duration) -> ErrorPattern {
        ErrorPattern {
            id: self.id.clone(),
            centroid_fingerprint: self.centroid.clone(),
            sample_message: self.sample_message.clone(),
            member_count: self.member_count,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            affected_users: self.users.count(),
            severity: self.severity,
            domain: self.domain,
            impact: self.impact(),
            dormant: self.is_dormant(now, horizon),
        }
    }
}
