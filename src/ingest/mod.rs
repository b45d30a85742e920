/// Inbound event validation
pub mod ingestor;

pub use ingestor::{DropCounts, EventIngestor, UNKNOWN_COMPONENT};
