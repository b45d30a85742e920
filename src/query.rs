//! Read-only query surface over a running core
//!
//! Every answer is a `Snapshot` carrying the time it was taken and whether
//! the core is serving from memory after a fatal storage failure. Only
//! clearly invalid filters fail.

use crate::aggregator::{ErrorOverviewMetrics, TimeSeriesPoint};
use crate::alerts::{Alert, AlertFilter, Subscription};
use crate::pipeline::{LiveEvent, Pipeline};
use crate::error::{AlertError, CoreError, QueryError};
use crate::events::{TimeRange, Timestamp};
use crate::ingest::DropCounts;
use crate::monitoring::PipelineHealth;
use crate::patterns::{ErrorPattern, PatternFilter};
use crate::recovery::{RecoveryAnalytics, RecoveryFilter};
use crate::trends::{Anomaly, Projection, Seasonality};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How fresh a snapshot is
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Staleness {
    pub as_of: Timestamp,
    /// Storage failed fatally; results come from memory only
    pub degraded: bool,
    pub degraded_since: Option<Timestamp>,
    pub reason: Option<String>,
}

/// Query result with its staleness indicator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot<T> {
    pub data: T,
    pub staleness: Staleness,
}

/// Time range of an overview query; defaults to the last hour
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct OverviewFilter {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl OverviewFilter {
    /// The `length` before now
    pub fn last(length: Duration) -> Self {
        Self::range(TimeRange::ending_at(Utc::now(), length))
    }

    pub fn range(range: TimeRange) -> Self {
        Self {
            start: Some(range.start),
            end: Some(range.end),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrendPeriod {
    Hour,
    Day,
    Week,
}

impl TrendPeriod {
    pub const ALL: [TrendPeriod; 3] = [TrendPeriod::Hour, TrendPeriod::Day, TrendPeriod::Week];

    pub fn duration(self) -> Duration {
        match self {
            TrendPeriod::Hour => Duration::hours(1),
            TrendPeriod::Day => Duration::days(1),
            TrendPeriod::Week => Duration::weeks(1),
        }
    }
}

/// Where a trend window ends; defaults to now
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TrendFilter {
    pub end: Option<Timestamp>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorTrendData {
    pub period: TrendPeriod,
    pub range: TimeRange,
    /// Closed buckets in the range, oldest first
    pub points: Vec<TimeSeriesPoint>,
    pub total_errors: u64,
    /// Percent change against the preceding period; `None` when that period was empty
    pub growth_rate: Option<f64>,
    pub anomalies: Vec<Anomaly>,
    pub seasonality: Vec<Seasonality>,
    /// Extrapolations over the next hour, day and week
    pub projections: Vec<Projection>,
}

/// Live view of the last few minutes and of the pipeline itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealTimeMetrics {
    pub timestamp: Timestamp,
    pub errors_last_minute: u64,
    /// Errors per minute over the buckets touching the last minute
    pub error_rate_last_minute: f64,
    pub errors_last_five_minutes: u64,
    pub unique_errors_last_five_minutes: u64,
    pub known_patterns: usize,
    pub open_alerts: usize,
    pub alerts_created: u64,
    pub alerts_deduplicated: u64,
    pub dropped_events: DropCounts,
    pub late_events: u64,
    /// Alerts and live events dropped for slow subscribers
    pub subscriber_drops: u64,
    pub delivery_failures: u64,
    pub recovery_strategies: usize,
    pub pipeline: PipelineHealth,
}

/// Read access to one core
///
/// Cheap to clone; holds no state of its own.
#[derive(Clone)]
pub struct QueryFacade {
    pipeline: Arc<Pipeline>,
}

impl QueryFacade {
    pub(crate) fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    fn snapshot<T>(&self, data: T, now: Timestamp) -> Snapshot<T> {
        let state = self.pipeline.storage_health.state();
        Snapshot {
            data,
            staleness: Staleness {
                as_of: now,
                degraded: state.degraded,
                degraded_since: state.since,
                reason: state.reason,
            },
        }
    }

    pub fn get_overview(
        &self,
        filter: &OverviewFilter,
    ) -> Result<Snapshot<ErrorOverviewMetrics>, QueryError> {
        self.get_overview_at(filter, Utc::now())
    }

    /// Aggregate the buckets overlapping the filter's range
    ///
    /// # Errors
    ///
    /// Returns `QueryError::InvalidFilter` when the range is empty or
    /// inverted, starts after `now`, or the default start would fall before
    /// the earliest representable timestamp.
    pub fn get_overview_at(
        &self,
        filter: &OverviewFilter,
        now: Timestamp,
    ) -> Result<Snapshot<ErrorOverviewMetrics>, QueryError> {
        let end = filter.end.unwrap_or(now);
        let start = match filter.start {
            Some(start) => start,
            None => end.checked_sub_signed(Duration::hours(1)).ok_or_else(|| {
                QueryError::InvalidFilter(format!("range end {} is out of bounds", end))
            })?,
        };
        let range = TimeRange::new(start, end);
        if !range.is_valid() {
            return Err(QueryError::InvalidFilter(format!(
                "range start {} must be before end {}",
                start, end
            )));
        }
        if start > now {
            return Err(QueryError::InvalidFilter(format!(
                "range start {} is in the future",
                start
            )));
        }

        let metrics = self.pipeline.aggregation.query_overview(range, now);
        Ok(self.snapshot(metrics, now))
    }

    pub fn get_trend(
        &self,
        period: TrendPeriod,
        filter: &TrendFilter,
    ) -> Result<Snapshot<ErrorTrendData>, QueryError> {
        self.get_trend_at(period, filter, Utc::now())
    }

    pub fn get_trend_at(
        &self,
        period: TrendPeriod,
        filter: &TrendFilter,
        now: Timestamp,
    ) -> Result<Snapshot<ErrorTrendData>, QueryError> {
        let end = filter.end.unwrap_or(now);
        let latest = now
            .checked_add_signed(self.pipeline.config.clock_skew_tolerance())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if end > latest {
            return Err(QueryError::InvalidFilter(format!(
                "trend end {} is in the future",
                end
            )));
        }

        let trends = &self.pipeline.trends;
        // Growth compares against the preceding period, which must also exist
        if TimeRange::checked_ending_at(end, period.duration() * 2).is_none() {
            return Err(QueryError::InvalidFilter(format!(
                "trend end {} leaves no room for a {:?} window",
                end, period
            )));
        }
        let range = TimeRange::ending_at(end, period.duration());
        let points = trends.history_in(range);
        let total_errors = points.iter().map(|point| point.total_errors).sum();
        let projections = TrendPeriod::ALL
            .iter()
            .filter_map(|horizon| trends.project(horizon.duration()))
            .collect();

        let data = ErrorTrendData {
            period,
            range,
            total_errors,
            growth_rate: trends.growth_rate(period.duration(), end),
            anomalies: trends.anomalies_in(range),
            seasonality: trends.detect_seasonality(),
            projections,
            points,
        };
        Ok(self.snapshot(data, now))
    }

    pub fn get_patterns(
        &self,
        filter: &PatternFilter,
    ) -> Result<Snapshot<Vec<ErrorPattern>>, QueryError> {
        self.get_patterns_at(filter, Utc::now())
    }

    pub fn get_patterns_at(
        &self,
        filter: &PatternFilter,
        now: Timestamp,
    ) -> Result<Snapshot<Vec<ErrorPattern>>, QueryError> {
        check_limit(filter.limit)?;
        if filter
            .component
            .as_deref()
            .is_some_and(|component| component.trim().is_empty())
        {
            return Err(QueryError::InvalidFilter(
                "component must not be empty".to_string(),
            ));
        }
        let patterns = self.pipeline.clusterer.patterns(filter, now);
        Ok(self.snapshot(patterns, now))
    }

    /// One pattern by id, dormant or not
    pub fn get_pattern(&self, id: &str) -> Option<Snapshot<ErrorPattern>> {
        let now = Utc::now();
        self.pipeline
            .clusterer
            .get(id, now)
            .map(|pattern| self.snapshot(pattern, now))
    }

    pub fn get_recovery_analytics(
        &self,
        filter: &RecoveryFilter,
    ) -> Result<Snapshot<RecoveryAnalytics>, QueryError> {
        if filter
            .strategy_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            return Err(QueryError::InvalidFilter(
                "strategy id must not be empty".to_string(),
            ));
        }
        let analytics = self.pipeline.recovery.analytics(filter);
        Ok(self.snapshot(analytics, Utc::now()))
    }

    pub fn get_real_time(&self) -> Snapshot<RealTimeMetrics> {
        self.get_real_time_at(Utc::now())
    }

    pub fn get_real_time_at(&self, now: Timestamp) -> Snapshot<RealTimeMetrics> {
        let pipeline = &self.pipeline;
        // Ends just past `now` so the bucket holding `now` is included
        let until = now.checked_add_signed(Duration::milliseconds(1)).unwrap_or(now);
        let since = |length| TimeRange::new(TimeRange::ending_at(now, length).start, until);
        let last_minute = pipeline
            .aggregation
            .query_overview(since(Duration::minutes(1)), now);
        let last_five = pipeline
            .aggregation
            .query_overview(since(Duration::minutes(5)), now);

        let metrics = RealTimeMetrics {
            timestamp: now,
            errors_last_minute: last_minute.total_errors,
            error_rate_last_minute: last_minute.error_rate,
            errors_last_five_minutes: last_five.total_errors,
            unique_errors_last_five_minutes: last_five.unique_errors,
            known_patterns: pipeline.clusterer.len(),
            open_alerts: pipeline.alerts.open_count(),
            alerts_created: pipeline.alerts.alerts_created(),
            alerts_deduplicated: pipeline.alerts.alerts_deduplicated(),
            dropped_events: pipeline.ingestor.drop_counts(),
            late_events: pipeline.aggregation.late_events(),
            subscriber_drops: pipeline.alerts.subscriber_drops()
                + pipeline.live_events.dropped_total(),
            delivery_failures: pipeline.alerts.delivery_failures(),
            recovery_strategies: pipeline.recovery.strategy_count(),
            pipeline: pipeline.monitor.collect_metrics(now),
        };
        self.snapshot(metrics, now)
    }

    pub fn get_alerts(&self, filter: &AlertFilter) -> Result<Snapshot<Vec<Alert>>, QueryError> {
        check_limit(filter.limit)?;
        let alerts = self.pipeline.alerts.alerts(filter);
        Ok(self.snapshot(alerts, Utc::now()))
    }

    pub fn acknowledge_alert(&self, id: &str) -> Result<Alert, AlertError> {
        self.pipeline.alerts.acknowledge(id)
    }

    pub fn resolve_alert(&self, id: &str) -> Result<Alert, AlertError> {
        self.resolve_alert_at(id, Utc::now())
    }

    pub fn resolve_alert_at(&self, id: &str, now: Timestamp) -> Result<Alert, AlertError> {
        self.pipeline.alerts.resolve(id, now)
    }

    /// Receive every newly created alert until the handle is dropped
    ///
    /// Delivery is at-most-once on a dedicated thread; a slow callback
    /// loses its oldest undelivered alerts instead of slowing the core.
    pub fn subscribe_alerts<F>(&self, callback: F) -> Result<Subscription<Alert>, CoreError>
    where
        F: Fn(&Alert) + Send + 'static,
    {
        Ok(self.pipeline.alerts.subscribe(callback)?)
    }

    /// Receive every accepted event, with the same guarantees as alerts
    pub fn subscribe_events<F>(&self, callback: F) -> Result<Subscription<LiveEvent>, CoreError>
    where
        F: Fn(&LiveEvent) + Send + 'static,
    {
        Ok(self.pipeline.live_events.subscribe(callback)?)
    }
}

fn check_limit(limit: Option<usize>) -> Result<(), QueryError> {
    if limit == Some(0) {
        return Err(QueryError::InvalidFilter(
            "limit must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
