/// Analytics configuration loading and validation
#[allow(clippy::module_inception)]
pub mod config;

pub use config::{
    AnalyticsConfig, ThresholdMetric, ThresholdOperator, ThresholdRuleConfig, MAX_SPAN_DAYS,
};
