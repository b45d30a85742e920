/// Error types for the analytics core
pub mod error;

/// Event, severity and time range types
pub mod events;

/// Validation of inbound events
pub mod ingest;

/// Fingerprint derivation
pub mod fingerprint;

/// Bucketed time-series aggregation
pub mod aggregator;

/// Pattern clustering
pub mod patterns;

/// Growth, seasonality, anomaly and projection analysis
pub mod trends;

/// Recovery strategy statistics
pub mod recovery;

/// Threshold rules evaluated on the tick
pub mod triggers;

/// Alert engine and subscriber fan-out
pub mod alerts;

/// Persistence boundary
pub mod store;

/// Pipeline self-monitoring
pub mod monitoring;

/// Configuration management
pub mod config;

/// Read-only query surface
pub mod query;

/// Core lifecycle and ingestion pipeline
pub mod pipeline;

// Re-export commonly used types
pub use pipeline::{AnalyticsCore, IngestReceipt, LiveEvent, TickReport, STORAGE_SOURCE_REF};
pub use aggregator::{ErrorOverviewMetrics, TimeSeriesPoint};
pub use alerts::{Alert, AlertFilter, AlertSink, AlertType, LogAlertSink, Subscription};
pub use config::AnalyticsConfig;
pub use error::{AlertError, ConfigError, CoreError, IngestError, QueryError, StorageError};
pub use events::{
    ErrorDomain, ErrorEvent, RawErrorEvent, RecoveryAttempt, RecoveryOutcome, Severity,
    TimeRange, Timestamp,
};
pub use patterns::{ErrorPattern, PatternFilter};
pub use query::{
    ErrorTrendData, OverviewFilter, QueryFacade, RealTimeMetrics, Snapshot, Staleness,
    TrendFilter, TrendPeriod,
};
pub use recovery::{RecoveryAnalytics, RecoveryFilter, StrategyStats};
pub use store::{AnalyticsStore, InMemoryStore};
