/// Trend, seasonality and anomaly analysis
pub mod analyzer;
pub mod statistics;

pub use analyzer::{Anomaly, Projection, SeasonalPeriod, Seasonality, TrendAnalyzer};
