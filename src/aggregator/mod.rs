/// Rolling bucketed aggregation
pub mod aggregation_engine;
pub mod bucket;
pub mod hyperloglog;

pub use aggregation_engine::{AggregationEngine, ErrorOverviewMetrics, RecordOutcome};
pub use bucket::{BucketState, DomainBreakdown, SeverityBreakdown, TimeBucket, TimeSeriesPoint};
pub use hyperloglog::HyperLogLog;
