/// Recovery strategy tracking
pub mod reservoir;
pub mod tracker;

pub use reservoir::Reservoir;
pub use tracker::{
    FailureReasonCount, LatencySummary, RecoveryAnalytics, RecoveryFilter, RecoveryTracker,
    StrategyStats,
};
