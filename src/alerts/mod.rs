/// Alert engine, fan-out delivery and sinks
pub mod alert_engine;
pub mod broadcast;
pub mod sink;

pub use alert_engine::{
    truncate_text, Alert, AlertDraft, AlertEngine, AlertFilter, AlertType, RaiseOutcome,
    ANOMALY_SOURCE_REF,
};
pub use broadcast::{Broadcaster, Subscription};
pub use sink::{AlertSink, LogAlertSink};
