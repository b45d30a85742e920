//! Online clustering of fingerprinted events into error patterns
//!
//! Exact fingerprint recurrences resolve through a hash index. Misses are
//! compared against a bounded set of recent clusters of the same component
//! by token edit distance on the normalised message.

use crate::events::{ErrorDomain, ErrorEvent, Severity, Timestamp};
use crate::fingerprint::Fingerprint;
use crate::patterns::pattern::{ErrorPattern, PatternState};
use crate::patterns::similarity::{length_compatible, similarity, tokenize};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Recent clusters per component considered on an exact-index miss
pub const MAX_CANDIDATES_PER_COMPONENT: usize = 256;

/// How an event was placed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentKind {
    /// Joined an active pattern
    Matched,
    /// Started a new pattern
    Created,
    /// Joined a pattern that had gone dormant
    Reactivated,
}

/// Result of assigning an event, with the pattern state after the update
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterAssignment {
    pub kind: AssignmentKind,
    pub pattern: ErrorPattern,
}

/// Selection of patterns for listing
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PatternFilter {
    pub component: Option<String>,
    pub domain: Option<ErrorDomain>,
    pub min_severity: Option<Severity>,
    /// Also list dormant patterns
    pub include_dormant: bool,
    pub limit: Option<usize>,
}

/// Groups events into patterns with stable identity
pub struct PatternClusterer {
    threshold: f64,
    dormancy_horizon: Duration,
    patterns: DashMap<String, PatternState>,
    /// Fingerprint key to pattern id
    exact_index: DashMap<String, String>,
    /// Most recently created pattern ids per component, oldest first
    by_component: DashMap<String, VecDeque<String>>,
    /// Serialises the miss path so two similar events cannot both create
    creation_lock: Mutex<()>,
}

impl PatternClusterer {
    /// # Arguments
    ///
    /// * `threshold` - Minimum similarity for joining an existing pattern
    /// * `dormancy_horizon` - Inactivity after which a pattern is dormant
    pub fn new(threshold: f64, dormancy_horizon: Duration) -> Self {
        Self {
            threshold,
            dormancy_horizon,
            patterns: DashMap::new(),
            exact_index: DashMap::new(),
            by_component: DashMap::new(),
            creation_lock: Mutex::new(()),
        }
    }

    pub fn assign(&self, event: &ErrorEvent, fingerprint: &Fingerprint) -> ClusterAssignment {
        self.assign_at(event, fingerprint, Utc::now())
    }

    /// Place an event into a pattern, creating one when nothing is close enough
    pub fn assign_at(
        &self,
        event: &ErrorEvent,
        fingerprint: &Fingerprint,
        now: Timestamp,
    ) -> ClusterAssignment {
        if let Some(assignment) = self.assign_exact(event, fingerprint, now) {
            return assignment;
        }

        let _guard = self
            .creation_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Another producer may have created it while we waited.
        if let Some(assignment) = self.assign_exact(event, fingerprint, now) {
            return assignment;
        }

        let tokens = tokenize(&fingerprint.normalized_message);
        if let Some(id) = self.nearest(fingerprint, &tokens) {
            self.exact_index.insert(fingerprint.key.clone(), id.clone());
            if let Some(assignment) = self.absorb_into(&id, event, now) {
                return assignment;
            }
        }

        self.create(event, fingerprint, tokens, now)
    }

    fn assign_exact(
        &self,
        event: &ErrorEvent,
        fingerprint: &Fingerprint,
        now: Timestamp,
    ) -> Option<ClusterAssignment> {
        let id = self
            .exact_index
            .get(&fingerprint.key)
            .map(|entry| entry.value().clone())?;
        self.absorb_into(&id, event, now)
    }

    fn absorb_into(&self, id: &str, event: &ErrorEvent, now: Timestamp) -> Option<ClusterAssignment> {
        let mut state = self.patterns.get_mut(id)?;
        let was_dormant = state.is_dormant(now, self.dormancy_horizon);
        state.absorb(event);

        let kind = if was_dormant {
            info!("Dormant pattern {} reactivated by event {}", id, event.id);
            AssignmentKind::Reactivated
        } else {
            AssignmentKind::Matched
        };
        Some(ClusterAssignment {
            kind,
            pattern: state.snapshot(now, self.dormancy_horizon),
        })
    }

    /// Best candidate at or above the threshold
    ///
    /// Ordered by similarity, then most recent `last_seen`, then smallest id.
    fn nearest(&self, fingerprint: &Fingerprint, tokens: &[String]) -> Option<String> {
        let candidates: Vec<String> = self
            .by_component
            .get(&fingerprint.component)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        let mut best: Option<(f64, Timestamp, String)> = None;
        let mut qualifying = 0usize;
        for id in candidates {
            let Some(state) = self.patterns.get(&id) else {
                continue;
            };
            if state.centroid.route != fingerprint.route
                || !length_compatible(state.tokens.len(), tokens.len(), self.threshold)
            {
                continue;
            }
            let score = similarity(&state.tokens, tokens);
            if score < self.threshold {
                continue;
            }
            qualifying += 1;
            let candidate = (score, state.last_seen, id);
            best = match best {
                Some(current) if rank(&current, &candidate) != Ordering::Greater => Some(current),
                _ => Some(candidate),
            };
        }

        if qualifying > 1 {
            debug!(
                "{} patterns above threshold for '{}', tie-break applied",
                qualifying, fingerprint.normalized_message
            );
        }
        best.map(|(_, _, id)| id)
    }

    fn create(
        &self,
        event: &ErrorEvent,
        fingerprint: &Fingerprint,
        tokens: Vec<String>,
        now: Timestamp,
    ) -> ClusterAssignment {
        let short = fingerprint.key.get(..16).unwrap_or(&fingerprint.key);
        let mut id = format!("pat_{}", short);
        if self.patterns.contains_key(&id) {
            id = format!("pat_{}", fingerprint.key);
        }

        let state = PatternState::new(id.clone(), event, fingerprint, tokens);
        let pattern = state.snapshot(now, self.dormancy_horizon);
        self.patterns.insert(id.clone(), state);
        self.exact_index.insert(fingerprint.key.clone(), id.clone());

        let mut recent = self
            .by_component
            .entry(fingerprint.component.clone())
            .or_default();
        recent.push_back(id.clone());
        while recent.len() > MAX_CANDIDATES_PER_COMPONENT {
            recent.pop_front();
        }
        drop(recent);

        info!(
            "New error pattern {} in component '{}': {}",
            id, fingerprint.component, fingerprint.normalized_message
        );
        ClusterAssignment {
            kind: AssignmentKind::Created,
            pattern,
        }
    }

    /// Patterns matching `filter`, by member count descending then id
    pub fn patterns(&self, filter: &PatternFilter, now: Timestamp) -> Vec<ErrorPattern> {
        let mut patterns: Vec<ErrorPattern> = self
            .patterns
            .iter()
            .map(|entry| entry.value().snapshot(now, self.dormancy_horizon))
            .filter(|pattern| filter.include_dormant || !pattern.dormant)
            .filter(|pattern| {
                filter
                    .component
                    .as_ref()
                    .map_or(true, |c| *c == pattern.centroid_fingerprint.component)
            })
            .filter(|pattern| filter.domain.map_or(true, |d| d == pattern.domain))
            .filter(|pattern| filter.min_severity.map_or(true, |s| pattern.severity >= s))
            .collect();

        patterns.sort_by(|a, b| {
            b.member_count
                .cmp(&a.member_count)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = filter.limit {
            patterns.truncate(limit);
        }
        patterns
    }

    /// Look up a pattern by id, dormant or not
    pub fn get(&self, id: &str, now: Timestamp) -> Option<ErrorPattern> {
        self.patterns
            .get(id)
            .map(|state| state.snapshot(now, self.dormancy_horizon))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// `Less` when `a` is the better candidate
fn rank(a: &(f64, Timestamp, String), b: &(f64, Timestamp, String)) -> Ordering {
    b.0.partial_cmp(&a.0)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.1.cmp(&a.1))
        .then_with(|| a.2.cmp(&b.2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprinter;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn base() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn clusterer() -> PatternClusterer {
        PatternClusterer::new(0.85, Duration::hours(24))
    }

    fn event(id: &str, message: &str, component: &str, offset_secs: i64) -> ErrorEvent {
        ErrorEvent {
            id: id.to_string(),
            timestamp: base() + Duration::seconds(offset_secs),
            severity: Severity::Medium,
            domain: ErrorDomain::Network,
            message: message.to_string(),
            stack_frames: vec![],
            component: component.to_string(),
            route: None,
            user_id: Some(format!("user-{}", id)),
            session_id: None,
            recoverable: false,
        }
    }

    fn assign(clusterer: &PatternClusterer, event: &ErrorEvent) -> ClusterAssignment {
        let fp = Fingerprinter::default().fingerprint(event);
        clusterer.assign_at(event, &fp, event.timestamp)
    }

    #[test]
    fn test_identical_events_share_a_pattern() {
        let clusterer = clusterer();
        let first = assign(&clusterer, &event("1", "Order 1234 not found", "orders", 0));
        assert_eq!(first.kind, AssignmentKind::Created);
        assert!(first.pattern.id.starts_with("pat_"));

        for i in 2..=10 {
            let message = format!("Order {} not found", i * 1000);
            let next = assign(&clusterer, &event(&i.to_string(), &message, "orders", i));
            assert_eq!(next.kind, AssignmentKind::Matched);
            assert_eq!(next.pattern.id, first.pattern.id);
            assert_eq!(next.pattern.member_count, i as u64);
        }
        assert_eq!(clusterer.len(), 1);
        let pattern = clusterer.get(&first.pattern.id, base()).unwrap();
        assert!((9..=10).contains(&pattern.affected_users));
    }

    #[test]
    fn test_similar_message_joins_existing_pattern() {
        let clusterer = clusterer();
        let a = assign(
            &clusterer,
            &event("a", "failed to load user profile from cache layer alpha", "profile", 0),
        );
        let b = assign(
            &clusterer,
            &event("b", "failed to load user profile from cache layer beta", "profile", 1),
        );
        assert_eq!(b.kind, AssignmentKind::Matched);
        assert_eq!(a.pattern.id, b.pattern.id);
        // Centroid stays fixed at creation.
        assert_eq!(b.pattern.centroid_fingerprint, a.pattern.centroid_fingerprint);
    }

    #[test]
    fn test_other_component_never_matches() {
        let clusterer = clusterer();
        let a = assign(&clusterer, &event("a", "connection reset by peer", "api", 0));
        let b = assign(&clusterer, &event("b", "connection reset by peer", "worker", 1));
        assert_ne!(a.pattern.id, b.pattern.id);
        assert_eq!(b.kind, AssignmentKind::Created);
    }

    #[test]
    fn test_dissimilar_message_creates_pattern() {
        let clusterer = clusterer();
        assign(&clusterer, &event("a", "connection reset by peer", "api", 0));
        let b = assign(&clusterer, &event("b", "permission denied for resource", "api", 1));
        assert_eq!(b.kind, AssignmentKind::Created);
        assert_eq!(clusterer.len(), 2);
    }

    #[test]
    fn test_tie_break_prefers_most_recent() {
        let clusterer = PatternClusterer::new(0.75, Duration::hours(24));
        let first = assign(
            &clusterer,
            &event("1", "xray yankee charlie delta echo foxtrot golf hotel india juliet", "svc", 0),
        );
        let second = assign(
            &clusterer,
            &event("2", "alpha bravo charlie delta echo foxtrot golf hotel zulu kilo", "svc", 10),
        );
        assert_ne!(first.pattern.id, second.pattern.id);

        // Two substitutions away from each of them.
        let probe = assign(
            &clusterer,
            &event("3", "xray bravo charlie delta echo foxtrot golf hotel india kilo", "svc", 20),
        );
        assert_eq!(probe.kind, AssignmentKind::Matched);
        assert_eq!(probe.pattern.id, second.pattern.id);
    }

    #[test]
    fn test_dormant_pattern_reactivates() {
        let clusterer = PatternClusterer::new(0.85, Duration::hours(1));
        let e1 = event("1", "disk quota exceeded", "storage", 0);
        let fp = Fingerprinter::default().fingerprint(&e1);
        clusterer.assign_at(&e1, &fp, base());

        let later = base() + Duration::hours(3);
        assert!(clusterer.patterns(&PatternFilter::default(), later).is_empty());
        let all = PatternFilter {
            include_dormant: true,
            ..PatternFilter::default()
        };
        assert_eq!(clusterer.patterns(&all, later).len(), 1);

        let mut e2 = event("2", "disk quota exceeded", "storage", 0);
        e2.timestamp = later;
        let outcome = clusterer.assign_at(&e2, &fp, later);
        assert_eq!(outcome.kind, AssignmentKind::Reactivated);
        assert!(!outcome.pattern.dormant);
        assert_eq!(outcome.pattern.member_count, 2);
    }

    #[test]
    fn test_filter_and_ordering() {
        let clusterer = clusterer();
        for i in 0..3 {
            assign(&clusterer, &event(&format!("a{}", i), "socket closed", "api", i));
        }
        let mut critical = event("b", "null pointer dereference", "core", 5);
        critical.severity = Severity::Critical;
        assign(&clusterer, &critical);

        let listed = clusterer.patterns(&PatternFilter::default(), base());
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].member_count, 3);

        let filter = PatternFilter {
            min_severity: Some(Severity::High),
            ..PatternFilter::default()
        };
        let listed = clusterer.patterns(&filter, base());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].severity, Severity::Critical);
    }

    #[test]
    fn test_order_independent_partition() {
        let messages = [
            "failed to load user profile from cache layer alpha",
            "failed to load user profile from cache layer beta",
            "failed to load user profile from cache layer gamma",
            "payment gateway rejected card",
            "payment gateway rejected card",
            "session token expired",
        ];
        let events: Vec<ErrorEvent> = messages
            .iter()
            .enumerate()
            .map(|(i, m)| event(&i.to_string(), m, "web", i as i64))
            .collect();

        let partition = |order: &[usize]| -> Vec<Vec<bool>> {
            let clusterer = clusterer();
            let mut assigned = HashMap::new();
            for &i in order {
                assigned.insert(i, assign(&clusterer, &events[i]).pattern.id);
            }
            (0..events.len())
                .map(|i| (0..events.len()).map(|j| assigned[&i] == assigned[&j]).collect())
                .collect()
        };

        let forward = partition(&[0, 1, 2, 3, 4, 5]);
        assert_eq!(forward, partition(&[5, 4, 3, 2, 1, 0]));
        assert_eq!(forward, partition(&[2, 5, 0, 4, 1, 3]));
    }
}
