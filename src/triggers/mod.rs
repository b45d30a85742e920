/// Trigger engine and rule implementations
pub mod trigger_engine;
pub mod rules;

pub use rules::ThresholdRule;
pub use trigger_engine::{RuleEvaluation, TriggerContext, TriggerEngine, TriggerRule};
