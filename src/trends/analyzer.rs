//! Trend analysis over closed time-series points
//!
//! Only closed buckets are observed, so partially filled windows never
//! produce trend signals.

use crate::aggregator::TimeSeriesPoint;
use crate::events::{Severity, TimeRange, Timestamp};
use crate::trends::statistics::{autocorrelation, linear_regression, mean, std_dev};
use chrono::Duration;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Closed points required before anomaly detection starts
pub const MIN_HISTORY_POINTS: usize = 10;
/// Observations a time slot needs before its EWMA is trusted
pub const MIN_SLOT_OBSERVATIONS: u64 = 3;
/// Length of the simple moving average fallback and the rolling deviation
pub const ROLLING_WINDOW: usize = 60;
/// Full periods required before seasonality can be reported
pub const MIN_SEASONAL_PERIODS: usize = 3;
/// Autocorrelation at which a period counts as detected
pub const SEASONALITY_THRESHOLD: f64 = 0.6;

const EWMA_ALPHA: f64 = 0.3;
const MAX_RETAINED_ANOMALIES: usize = 10_000;
const SECONDS_PER_DAY: i64 = 86_400;
const SECONDS_PER_WEEK: i64 = 7 * SECONDS_PER_DAY;

/// A closed bucket whose total deviates from its expected value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub timestamp: Timestamp,
    pub observed: f64,
    pub expected: f64,
    /// `observed - expected`
    pub deviation: f64,
    /// Deviation in rolling standard deviations
    pub z_score: f64,
    pub severity: Severity,
}

/// Period checked for seasonality
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SeasonalPeriod {
    Daily,
    Weekly,
}

impl SeasonalPeriod {
    fn seconds(self) -> i64 {
        match self {
            SeasonalPeriod::Daily => SECONDS_PER_DAY,
            SeasonalPeriod::Weekly => SECONDS_PER_WEEK,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Seasonality {
    pub period: SeasonalPeriod,
    pub lag_buckets: usize,
    pub autocorrelation: f64,
    /// Autocorrelation clamped to [0, 1]
    pub confidence: f64,
    pub detected: bool,
    /// At least three full periods were available
    pub sufficient_history: bool,
}

/// Linear extrapolation of the error count
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    pub horizon_minutes: i64,
    /// Expected errors over the whole horizon
    pub projected_total_errors: f64,
    /// Expected errors per minute at the end of the horizon
    pub projected_error_rate: f64,
    /// `r² · W / (W + h)`: shrinks as the horizon grows relative to the fit window
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotBaseline {
    ewma: f64,
    observations: u64,
}

impl SlotBaseline {
    fn update(&mut self, value: f64) {
        self.ewma = if self.observations == 0 {
            value
        } else {
            EWMA_ALPHA * value + (1.0 - EWMA_ALPHA) * self.ewma
        };
        self.observations += 1;
    }
}

#[derive(Default)]
struct TrendState {
    history: VecDeque<TimeSeriesPoint>,
    day_slots: HashMap<i64, SlotBaseline>,
    week_slots: HashMap<i64, SlotBaseline>,
    anomalies: VecDeque<Anomaly>,
}

/// Growth, seasonality, anomalies and projections of the error series
pub struct TrendAnalyzer {
    k_factor: f64,
    bucket_width: Duration,
    history_capacity: usize,
    state: RwLock<TrendState>,
}

impl TrendAnalyzer {
    /// # Arguments
    ///
    /// * `k_factor` - Standard deviations beyond which a point is anomalous
    /// * `bucket_width` - Width of the observed buckets
    /// * `history_capacity` - Closed points kept for seasonality and trends
    pub fn new(k_factor: f64, bucket_width: Duration, history_capacity: usize) -> Self {
        Self {
            k_factor,
            bucket_width,
            history_capacity: history_capacity.max(1),
            state: RwLock::new(TrendState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TrendState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrendState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn width_seconds(&self) -> i64 {
        self.bucket_width.num_seconds().max(1)
    }

    fn slot(&self, timestamp: Timestamp, period_seconds: i64) -> i64 {
        timestamp.timestamp().rem_euclid(period_seconds) / self.width_seconds()
    }

    /// Feed a closed point and report it if anomalous
    ///
    /// Points not newer than the latest observed one are ignored.
    pub fn observe(&self, point: &TimeSeriesPoint) -> Option<Anomaly> {
        let mut state = self.write();
        if state
            .history
            .back()
            .is_some_and(|last| last.timestamp >= point.timestamp)
        {
            debug!("Ignoring out-of-order point at {}", point.timestamp);
            return None;
        }
        let observed = point.total_errors as f64;
        let day_slot = self.slot(point.timestamp, SECONDS_PER_DAY);
        let week_slot = self.slot(point.timestamp, SECONDS_PER_WEEK);

        let anomaly = if state.history.len() >= MIN_HISTORY_POINTS {
            let expected = expected_value(&state, day_slot, week_slot);
            let recent = recent_totals(&state.history, ROLLING_WINDOW);
            let sigma = std_dev(&recent).max(expected.max(1.0).sqrt());
            let deviation = observed - expected;
            let z_score = deviation.abs() / sigma;

            (z_score > self.k_factor).then(|| Anomaly {
                timestamp: point.timestamp,
                observed,
                expected,
                deviation,
                z_score,
                severity: severity_band(z_score / self.k_factor),
            })
        } else {
            None
        };

        record_point(&mut state, point, day_slot, week_slot, self.history_capacity);
        if let Some(anomaly) = &anomaly {
            info!(
                "Anomaly at {}: observed {} expected {:.1} (z={:.1}, {})",
                anomaly.timestamp, anomaly.observed, anomaly.expected, anomaly.z_score, anomaly.severity
            );
            state.anomalies.push_back(anomaly.clone());
            while state.anomalies.len() > MAX_RETAINED_ANOMALIES {
                state.anomalies.pop_front();
            }
        }
        anomaly
    }

    /// Load historical points without running detection on them
    pub fn seed(&self, points: &[TimeSeriesPoint]) {
        let mut state = self.write();
        for point in points {
            if state
                .history
                .back()
                .is_some_and(|last| last.timestamp >= point.timestamp)
            {
                continue;
            }
            let day_slot = self.slot(point.timestamp, SECONDS_PER_DAY);
            let week_slot = self.slot(point.timestamp, SECONDS_PER_WEEK);
            record_point(&mut state, point, day_slot, week_slot, self.history_capacity);
        }
        debug!("Seeded trend history with {} point(s)", points.len());
    }

    pub fn anomalies_in(&self, range: TimeRange) -> Vec<Anomaly> {
        self.read()
            .anomalies
            .iter()
            .filter(|anomaly| range.contains(anomaly.timestamp))
            .cloned()
            .collect()
    }

    /// Closed points with a start inside `range`
    pub fn history_in(&self, range: TimeRange) -> Vec<TimeSeriesPoint> {
        self.read()
            .history
            .iter()
            .filter(|point| range.contains(point.timestamp))
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.read().history.len()
    }

    /// Percentage change between the last `window` before `now` and the window before it
    ///
    /// `None` when the prior window is empty but the recent one is not.
    pub fn growth_rate(&self, window: Duration, now: Timestamp) -> Option<f64> {
        let state = self.read();
        let recent = TimeRange::ending_at(now, window);
        let prior = TimeRange::ending_at(recent.start, window);

        let sum_in = |range: TimeRange| -> u64 {
            state
                .history
                .iter()
                .filter(|point| range.contains(point.timestamp))
                .map(|point| point.total_errors)
                .sum()
        };
        let (recent_total, prior_total) = (sum_in(recent), sum_in(prior));

        match (prior_total, recent_total) {
            (0, 0) => Some(0.0),
            (0, _) => None,
            (prior, recent) => Some((recent as f64 - prior as f64) / prior as f64 * 100.0),
        }
    }

    /// Autocorrelation of the error-rate series at the daily and weekly lags
    pub fn detect_seasonality(&self) -> Vec<Seasonality> {
        let state = self.read();
        let series: Vec<f64> = state.history.iter().map(|point| point.error_rate).collect();

        [SeasonalPeriod::Daily, SeasonalPeriod::Weekly]
            .into_iter()
            .map(|period| {
                let lag = (period.seconds() / self.width_seconds()).max(1) as usize;
                let sufficient_history = series.len() >= MIN_SEASONAL_PERIODS * lag;
                let correlation = if sufficient_history {
                    autocorrelation(&series, lag)
                } else {
                    0.0
                };
                Seasonality {
                    period,
                    lag_buckets: lag,
                    autocorrelation: correlation,
                    confidence: correlation.clamp(0.0, 1.0),
                    detected: sufficient_history && correlation > SEASONALITY_THRESHOLD,
                    sufficient_history,
                }
            })
            .collect()
    }

    /// Extrapolate the last `ROLLING_WINDOW` points over `horizon`
    pub fn project(&self, horizon: Duration) -> Option<Projection> {
        let state = self.read();
        let values = recent_totals(&state.history, ROLLING_WINDOW);
        let fit = linear_regression(&values)?;

        let window = values.len() as f64;
        let steps = (horizon.num_seconds() / self.width_seconds()).max(1);
        let projected_total_errors: f64 = (0..steps)
            .map(|step| fit.at(window + step as f64).max(0.0))
            .sum();
        let width_minutes = self.width_seconds() as f64 / 60.0;
        let projected_error_rate = fit.at(window + steps as f64 - 1.0).max(0.0) / width_minutes;

        Some(Projection {
            horizon_minutes: horizon.num_minutes(),
            projected_total_errors,
            projected_error_rate,
            confidence: fit.r_squared * window / (window + steps as f64),
        })
    }
}

fn recent_totals(history: &VecDeque<TimeSeriesPoint>, count: usize) -> Vec<f64> {
    let skip = history.len().saturating_sub(count);
    history
        .iter()
        .skip(skip)
        .map(|point| point.total_errors as f64)
        .collect()
}

/// Week-slot EWMA, then day-slot EWMA, then the simple moving average
fn expected_value(state: &TrendState, day_slot: i64, week_slot: i64) -> f64 {
    if let Some(slot) = state
        .week_slots
        .get(&week_slot)
        .filter(|slot| slot.observations >= MIN_SLOT_OBSERVATIONS)
    {
        return slot.ewma;
    }
    if let Some(slot) = state
        .day_slots
        .get(&day_slot)
        .filter(|slot| slot.observations >= MIN_SLOT_OBSERVATIONS)
    {
        return slot.ewma;
    }
    mean(&recent_totals(&state.history, ROLLING_WINDOW))
}

fn record_point(
    state: &mut TrendState,
    point: &TimeSeriesPoint,
    day_slot: i64,
    week_slot: i64,
    capacity: usize,
) {
    let value = point.total_errors as f64;
    state.day_slots.entry(day_slot).or_default().update(value);
    state.week_slots.entry(week_slot).or_default().update(value);
    state.history.push_back(point.clone());
    while state.history.len() > capacity {
        state.history.pop_front();
    }
}

/// Severity of an anomaly from its deviation relative to the threshold
pub fn severity_band(ratio: f64) -> Severity {
    if ratio < 1.5 {
        Severity::Low
    } else if ratio < 2.0 {
        Severity::Medium
    } else if ratio < 3.0 {
        Severity::High
    } else {
        Severity::Critical
    }
}
