//! Effectiveness of automated recovery strategies

use crate::events::{RecoveryAttempt, RecoveryOutcome, Timestamp};
use crate::fingerprint::stable_hash64;
use crate::recovery::reservoir::Reservoir;
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Distinct failure reasons tracked per strategy; the rest fold into `OTHER_REASON`
const MAX_TRACKED_REASONS: usize = 256;
/// Failures per strategy that failure reasons are grouped over
pub const RECENT_FAILURES: usize = 1000;
const OTHER_REASON: &str = "other";
const UNSPECIFIED_REASON: &str = "unspecified";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
    /// Exact mean over every attempt
    pub mean_ms: Option<f64>,
    /// Samples held in the reservoir
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailureReasonCount {
    pub reason: String,
    pub count: u64,
}

/// Folded view of one strategy's attempts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStats {
    pub strategy_id: String,
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    /// Fewer attempts than the configured minimum sample count
    pub low_confidence: bool,
    pub latency: LatencySummary,
    /// Most frequent reasons among the last `RECENT_FAILURES` failures, at most top-K
    pub failure_reasons: Vec<FailureReasonCount>,
    pub last_attempt_at: Option<Timestamp>,
}

/// Selection of strategies for analytics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RecoveryFilter {
    pub strategy_id: Option<String>,
    /// Only strategies with at least this many attempts
    pub min_attempts: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAnalytics {
    pub strategies: Vec<StrategyStats>,
    pub total_attempts: u64,
    /// `None` when no attempts match
    pub overall_success_rate: Option<f64>,
}

#[derive(Debug)]
struct StrategyState {
    total: u64,
    successes: u64,
    latency_sum_ms: u128,
    latencies: Reservoir,
    /// Counts over `recent_reasons`
    reasons: HashMap<String, u64>,
    recent_reasons: VecDeque<String>,
    last_attempt_at: Option<Timestamp>,
}

/// Folds recovery attempts into per-strategy statistics
///
/// Recording is not idempotent: every call is one attempt, so replaying a
/// record counts it twice.
pub struct RecoveryTracker {
    min_samples: u64,
    reservoir_size: usize,
    top_k: usize,
    strategies: DashMap<String, StrategyState>,
}

fn forget_reason(reasons: &mut HashMap<String, u64>, reason: &str) {
    if let Some(count) = reasons.get_mut(reason) {
        *count -= 1;
        if *count == 0 {
            reasons.remove(reason);
        }
    }
}

impl RecoveryTracker {
    pub fn new(min_samples: usize, reservoir_size: usize, top_k: usize) -> Self {
        Self {
            min_samples: min_samples as u64,
            reservoir_size,
            top_k,
            strategies: DashMap::new(),
        }
    }

    pub fn record(&self, attempt: &RecoveryAttempt) {
        let mut state = self
            .strategies
            .entry(attempt.strategy_id.clone())
            .or_insert_with(|| StrategyState {
                total: 0,
                successes: 0,
                latency_sum_ms: 0,
                latencies: Reservoir::new(self.reservoir_size, stable_hash64(&attempt.strategy_id)),
                reasons: HashMap::new(),
                recent_reasons: VecDeque::new(),
                last_attempt_at: None,
            });

        state.total += 1;
        state.latency_sum_ms += u128::from(attempt.duration_ms);
        state.latencies.insert(attempt.duration_ms);
        state.last_attempt_at = Some(
            state
                .last_attempt_at
                .map_or(attempt.started_at, |last| last.max(attempt.started_at)),
        );

        match attempt.outcome {
            RecoveryOutcome::Success => state.successes += 1,
            RecoveryOutcome::Failure => {
                let reason = attempt
                    .failure_reason
                    .as_deref()
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .unwrap_or(UNSPECIFIED_REASON);
                let key = if state.reasons.contains_key(reason)
                    || state.reasons.len() < MAX_TRACKED_REASONS
                {
                    reason.to_string()
                } else {
                    OTHER_REASON.to_string()
                };
                *state.reasons.entry(key.clone()).or_default() += 1;
                state.recent_reasons.push_back(key);
                if state.recent_reasons.len() > RECENT_FAILURES {
                    if let Some(expired) = state.recent_reasons.pop_front() {
                        forget_reason(&mut state.reasons, &expired);
                    }
                }
            }
        }
        debug!(
            "Recovery attempt for '{}' ({:?}, {} ms)",
            attempt.strategy_id, attempt.outcome, attempt.duration_ms
        );
    }

    pub fn stats(&self, strategy_id: &str) -> Option<StrategyStats> {
        self.strategies
            .get(strategy_id)
            .map(|state| self.summarise(strategy_id, &state))
    }

    fn summarise(&self, strategy_id: &str, state: &StrategyState) -> StrategyStats {
        let mut reasons: Vec<FailureReasonCount> = state
            .reasons
            .iter()
            .map(|(reason, count)| FailureReasonCount {
                reason: reason.clone(),
                count: *count,
            })
            .collect();
        reasons.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));
        reasons.truncate(self.top_k);

        StrategyStats {
            strategy_id: strategy_id.to_string(),
            total_attempts: state.total,
            successes: state.successes,
            failures: state.total - state.successes,
            success_rate: if state.total == 0 {
                0.0
            } else {
                state.successes as f64 / state.total as f64
            },
            low_confidence: state.total < self.min_samples,
            latency: LatencySummary {
                p50_ms: state.latencies.percentile(50.0),
                p95_ms: state.latencies.percentile(95.0),
                p99_ms: state.latencies.percentile(99.0),
                mean_ms: (state.total > 0)
                    .then(|| state.latency_sum_ms as f64 / state.total as f64),
                samples: state.latencies.len(),
            },
            failure_reasons: reasons,
            last_attempt_at: state.last_attempt_at,
        }
    }

    /// Statistics of every strategy matching `filter`, ordered by id
    pub fn analytics(&self, filter: &RecoveryFilter) -> RecoveryAnalytics {
        let mut strategies: Vec<StrategyStats> = self
            .strategies
            .iter()
            .filter(|entry| {
                filter
                    .strategy_id
                    .as_ref()
                    .map_or(true, |id| id == entry.key())
            })
            .map(|entry| self.summarise(entry.key(), entry.value()))
            .filter(|stats| filter.min_attempts.map_or(true, |min| stats.total_attempts >= min))
            .collect();
        strategies.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));

        let total_attempts: u64 = strategies.iter().map(|s| s.total_attempts).sum();
        let successes: u64 = strategies.iter().map(|s| s.successes).sum();
        RecoveryAnalytics {
            overall_success_rate: (total_attempts > 0)
                .then(|| successes as f64 / total_attempts as f64),
            strategies,
            total_attempts,
        }
    }

    pub fn strategy_count(&self) -> usize {
        self.strategies.len()
    }
}
