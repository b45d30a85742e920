use crate::events::Timestamp;
use thiserror::Error;

/// Errors raised while validating an inbound error event
///
/// Both variants are recovered locally: the event is dropped and counted,
/// never surfaced to the monitored application as a fault.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("Malformed event: {0}")]
    Malformed(String),

    #[error("Event timestamp {timestamp} outside accepted window: {reason}")]
    OutOfWindow { timestamp: Timestamp, reason: String },
}

/// Errors reported by the persistence boundary
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Retried by the store adapter; the core only counts it
    #[error("Transient storage failure: {0}")]
    Transient(String),

    /// Switches the core into degraded mode
    #[error("Fatal storage failure: {0}")]
    Fatal(String),
}

/// Errors returned by the read-only query surface
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
}

/// Errors raised by alert lifecycle operations and delivery sinks
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlertError {
    #[error("Alert not found: {0}")]
    NotFound(String),

    #[error("Failed to deliver alert: {0}")]
    DeliveryFailed(String),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Errors raised by the analytics core lifecycle
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Analytics core is already running")]
    AlreadyRunning,

    #[error("Analytics core is not running")]
    NotRunning,

    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
