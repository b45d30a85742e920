//! Persistence boundary of the analytics core
//!
//! The core only appends events and closed buckets, upserts patterns and
//! reads bucket history back. Storage technology lives behind
//! `AnalyticsStore`; `InMemoryStore` is the bounded reference implementation.

use crate::aggregator::TimeSeriesPoint;
use crate::error::StorageError;
use crate::events::{ErrorEvent, TimeRange, Timestamp};
use crate::patterns::ErrorPattern;
use log::error;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, RwLock};

/// Time-indexed store the core writes through
///
/// Adapters retry transient failures themselves with bounded backoff and
/// report `StorageError::Transient` only once retries are exhausted.
#[cfg_attr(test, mockall::automock)]
pub trait AnalyticsStore: Send + Sync {
    fn append_event(&self, event: &ErrorEvent, fingerprint_key: &str) -> Result<(), StorageError>;

    fn upsert_pattern(&self, pattern: &ErrorPattern) -> Result<(), StorageError>;

    /// Append a closed bucket; buckets arrive in time order
    fn append_bucket(&self, point: &TimeSeriesPoint) -> Result<(), StorageError>;

    fn read_buckets_in_range(&self, range: TimeRange) -> Result<Vec<TimeSeriesPoint>, StorageError>;
}

/// Event as kept by the in-memory store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub event: ErrorEvent,
    pub fingerprint_key: String,
}

/// Bounded in-process store; oldest events and buckets are evicted first
pub struct InMemoryStore {
    events: Mutex<VecDeque<StoredEvent>>,
    patterns: RwLock<HashMap<String, ErrorPattern>>,
    buckets: RwLock<BTreeMap<Timestamp, TimeSeriesPoint>>,
    max_events: usize,
    max_buckets: usize,
}

impl InMemoryStore {
    pub fn new(max_events: usize, max_buckets: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            patterns: RwLock::new(HashMap::new()),
            buckets: RwLock::new(BTreeMap::new()),
            max_events: max_events.max(1),
            max_buckets: max_buckets.max(1),
        }
    }

    fn events(&self) -> MutexGuard<'_, VecDeque<StoredEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn event_count(&self) -> usize {
        self.events().len()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<StoredEvent> {
        let events = self.events();
        events.iter().rev().take(limit).cloned().collect()
    }

    pub fn pattern(&self, id: &str) -> Option<ErrorPattern> {
        self.patterns
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Default for InMemoryStore {
    /// One day of events at a modest rate and four weeks of one-minute buckets
    fn default() -> Self {
        Self::new(100_000, 40_320)
    }
}

impl AnalyticsStore for InMemoryStore {
    fn append_event(&self, event: &ErrorEvent, fingerprint_key: &str) -> Result<(), StorageError> {
        let mut events = self.events();
        events.push_back(StoredEvent {
            event: event.clone(),
            fingerprint_key: fingerprint_key.to_string(),
        });
        while events.len() > self.max_events {
            events.pop_front();
        }
        Ok(())
    }

    fn upsert_pattern(&self, pattern: &ErrorPattern) -> Result<(), StorageError> {
        self.patterns
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(pattern.id.clone(), pattern.clone());
        Ok(())
    }

    fn append_bucket(&self, point: &TimeSeriesPoint) -> Result<(), StorageError> {
        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buckets.insert(point.timestamp, point.clone());
        while buckets.len() > self.max_buckets {
            buckets.pop_first();
        }
        Ok(())
    }

    fn read_buckets_in_range(&self, range: TimeRange) -> Result<Vec<TimeSeriesPoint>, StorageError> {
        if !range.is_valid() {
            return Ok(Vec::new());
        }
        Ok(self
            .buckets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .range(range.start..range.end)
            .map(|(_, point)| point.clone())
            .collect())
    }
}

/// Degraded-mode state of the core
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DegradedState {
    pub degraded: bool,
    pub since: Option<Timestamp>,
    pub reason: Option<String>,
}

/// Tracks whether the store has failed fatally
///
/// Once degraded, the core stops writing to the store and keeps serving
/// from memory.
#[derive(Debug, Default)]
pub struct StorageHealth {
    state: Mutex<DegradedState>,
}

impl StorageHealth {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DegradedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enter degraded mode; returns `true` only on the first fatal failure
    pub fn record_fatal(&self, reason: &str, now: Timestamp) -> bool {
        let mut state = self.lock();
        if state.degraded {
            return false;
        }
        error!("Storage failed fatally, entering degraded mode: {}", reason);
        *state = DegradedState {
            degraded: true,
            since: Some(now),
            reason: Some(reason.to_string()),
        };
        true
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().degraded
    }

    pub fn state(&self) -> DegradedState {
        self.lock().clone()
    }
}
