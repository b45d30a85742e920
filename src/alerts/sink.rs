use crate::alerts::Alert;
use crate::error::AlertError;
use crate::events::Severity;
use log::{info, warn};

/// Destination for newly created alerts (pager, chat, email gateway)
///
/// Called from a dedicated delivery thread, never from the ingestion path.
#[cfg_attr(test, mockall::automock)]
pub trait AlertSink: Send + Sync {
    fn deliver(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Writes alerts to the application log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        match alert.severity {
            Severity::High | Severity::Critical => warn!(
                "[{}] {:?} alert {}: {} ({})",
                alert.severity, alert.alert_type, alert.id, alert.title, alert.source_ref
            ),
            Severity::Low | Severity::Medium => info!(
                "[{}] {:?} alert {}: {} ({})",
                alert.severity, alert.alert_type, alert.id, alert.title, alert.source_ref
            ),
        }
        Ok(())
    }
}
