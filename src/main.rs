use anyhow::{Context, Result};
use clap::Parser;
use faultline::config::AnalyticsConfig;
use faultline::error::ConfigError;
use faultline::{
    AnalyticsCore, InMemoryStore, LogAlertSink, OverviewFilter, RawErrorEvent, RecoveryAttempt,
};
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

/// Events kept by the in-memory store of the daemon
const STORED_EVENTS: usize = 100_000;

/// Command-line arguments for the faultline daemon
#[derive(Parser)]
#[command(
    name = "faultline",
    about = "Error analytics daemon - fingerprints, clusters and alerts on application errors",
    long_about = "Reads JSON-lines error events and recovery attempts from a file or stdin, \
                  aggregates them into time buckets, groups them into patterns, detects \
                  anomalies and raises deduplicated alerts."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// JSON-lines input; stdin when omitted
    #[arg(short, long, value_name = "FILE", help = "Read records from FILE instead of stdin")]
    input: Option<PathBuf>,

    /// Seconds between real-time metric reports
    #[arg(
        short,
        long,
        value_name = "SECONDS",
        default_value_t = 60,
        help = "Interval between real-time metrics reports"
    )]
    report_interval: u64,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// # Returns
    ///
    /// `Ok(())` if all arguments are valid, `Err(String)` with error message otherwise
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            // Missing files fall back to defaults in load_config
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            }
        }

        if let Some(ref input) = self.input {
            if !input.is_file() {
                return Err(format!("Input is not a readable file: {}", input.display()));
            }
        }

        if self.report_interval == 0 {
            return Err("Report interval must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Convert config path to string safely, handling non-UTF-8 paths
    fn config_path_str(&self) -> Result<Option<&str>, String> {
        match &self.config {
            Some(path) => match path.to_str() {
                Some(path_str) => Ok(Some(path_str)),
                None => Err(format!(
                    "Configuration file path contains invalid UTF-8 characters: {}",
                    path.display()
                )),
            },
            None => Ok(None),
        }
    }
}

/// One line of input
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum InputRecord {
    Event(RawErrorEvent),
    Recovery(RecoveryAttempt),
}

#[derive(Debug, Default)]
struct InputStats {
    lines: u64,
    events: u64,
    rejected: u64,
    recoveries: u64,
    unparseable: u64,
}

/// Load configuration from file or use defaults
///
/// A missing or unreadable file falls back to defaults; a file that exists
/// but does not parse or validate is an error.
fn load_config(config_path: Option<&str>) -> Result<AnalyticsConfig, ConfigError> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            match AnalyticsConfig::from_file(std::path::Path::new(path)) {
                Ok(config) => Ok(config),
                Err(ConfigError::ReadError(e)) => {
                    warn!("Configuration file not readable ({}), using defaults", e);
                    Ok(AnalyticsConfig::default())
                }
                Err(e) => Err(e),
            }
        }
        None => {
            info!("Using default configuration");
            Ok(AnalyticsConfig::default())
        }
    }
}

fn parse_record(line: &str) -> Result<InputRecord, serde_json::Error> {
    serde_json::from_str(line)
}

fn handle_line(core: &AnalyticsCore, line: &str, stats: &mut InputStats) {
    stats.lines += 1;
    if line.trim().is_empty() {
        return;
    }

    match parse_record(line) {
        Ok(InputRecord::Event(raw)) => {
            let receipt = core.ingest(raw);
            if receipt.accepted {
                stats.events += 1;
            } else {
                stats.rejected += 1;
                debug!(
                    "Line {} rejected: {}",
                    stats.lines,
                    receipt.reason.unwrap_or_default()
                );
            }
        }
        Ok(InputRecord::Recovery(attempt)) => {
            stats.recoveries += 1;
            core.record_recovery_attempt(attempt);
        }
        Err(e) => {
            stats.unparseable += 1;
            warn!("Skipping line {}: {}", stats.lines, e);
        }
    }
}

fn report_real_time(core: &AnalyticsCore) {
    let snapshot = core.query().get_real_time();
    let metrics = &snapshot.data;
    info!(
        "errors/min={} last5m={} patterns={} open_alerts={} dropped={} late={} subscriber_drops={}{}",
        metrics.errors_last_minute,
        metrics.errors_last_five_minutes,
        metrics.known_patterns,
        metrics.open_alerts,
        metrics.dropped_events.total(),
        metrics.late_events,
        metrics.subscriber_drops,
        if snapshot.staleness.degraded {
            " (degraded)"
        } else {
            ""
        }
    );
}

async fn open_input(input: Option<&PathBuf>) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    match input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input {}", path.display()))?;
            info!("Reading records from {}", path.display());
            Ok(Box::new(BufReader::new(file)))
        }
        None => {
            info!("Reading records from stdin");
            Ok(Box::new(BufReader::new(tokio::io::stdin())))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting faultline");

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let config_path = match cli.config_path_str() {
        Ok(path) => path,
        Err(e) => {
            error!("Invalid configuration path: {}", e);
            std::process::exit(1);
        }
    };
    let config = load_config(config_path).context("Failed to load configuration")?;

    let store = Arc::new(InMemoryStore::new(
        STORED_EVENTS,
        config.history_retention_buckets,
    ));
    let core = AnalyticsCore::with_sink(config, store, Arc::new(LogAlertSink))
        .context("Failed to initialise analytics core")?;
    core.start().context("Failed to start tick worker")?;

    let mut lines = open_input(cli.input.as_ref()).await?.lines();
    let mut report = tokio::time::interval(Duration::from_secs(cli.report_interval));
    // The first tick completes immediately
    report.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut stats = InputStats::default();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&core, &line, &mut stats),
                Ok(None) => {
                    info!("Input exhausted after {} lines", stats.lines);
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = report.tick() => report_real_time(&core),
            _ = &mut shutdown => {
                info!("Received interrupt signal (SIGINT), shutting down gracefully...");
                break;
            }
        }
    }

    info!(
        "Processed {} events ({} rejected, {} unparseable) and {} recovery attempts",
        stats.events, stats.rejected, stats.unparseable, stats.recoveries
    );

    if let Err(e) = core.stop() {
        error!("Error during shutdown: {}", e);
    }
    core.tick();
    report_real_time(&core);

    let overview = core
        .query()
        .get_overview(&OverviewFilter::default())
        .context("Failed to query final overview")?;
    println!("{}", serde_json::to_string_pretty(&overview)?);

    info!("faultline shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn cli(config: Option<PathBuf>) -> Cli {
        Cli {
            config,
            input: None,
            report_interval: 60,
            verbose: false,
        }
    }

    #[test]
    fn test_cli_validation_with_existing_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "bucket_width_seconds = 30").unwrap();

        assert!(cli(Some(file.path().to_path_buf())).validate().is_ok());
    }

    #[test]
    fn test_cli_validation_with_missing_file() {
        // Missing files are handled gracefully by load_config
        assert!(cli(Some(PathBuf::from("/nonexistent/config.toml")))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_cli_validation_with_directory() {
        assert!(cli(Some(std::env::temp_dir())).validate().is_err());
    }

    #[test]
    fn test_cli_validation_rejects_missing_input() {
        let mut args = cli(None);
        args.input = Some(PathBuf::from("/nonexistent/events.jsonl"));
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_cli_validation_rejects_zero_interval() {
        let mut args = cli(None);
        args.report_interval = 0;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_config_path_str() {
        let args = cli(Some(PathBuf::from("faultline.toml")));
        assert_eq!(args.config_path_str().unwrap(), Some("faultline.toml"));
        assert_eq!(cli(None).config_path_str().unwrap(), None);
    }

    #[test]
    fn test_load_config_falls_back_when_missing() {
        let config = load_config(Some("/nonexistent/faultline.toml")).unwrap();
        assert_eq!(config, AnalyticsConfig::default());
    }

    #[test]
    fn test_load_config_rejects_invalid_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "cluster_similarity_threshold = 1.5").unwrap();

        let result = load_config(file.path().to_str());
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_parse_records() {
        let event = parse_record(
            r#"{"kind":"event","id":"e1","timestamp":"2024-05-01T12:00:00Z","severity":"high","message":"boom"}"#,
        )
        .unwrap();
        assert!(matches!(event, InputRecord::Event(raw) if raw.id.as_deref() == Some("e1")));

        let recovery = parse_record(
            r#"{"kind":"recovery","strategyId":"retry","errorId":"e1","startedAt":"2024-05-01T12:00:00Z","outcome":"success","durationMs":12}"#,
        )
        .unwrap();
        assert!(matches!(recovery, InputRecord::Recovery(a) if a.strategy_id == "retry"));

        assert!(parse_record(r#"{"kind":"metric"}"#).is_err());
    }

    #[test]
    fn test_handle_line_counts() {
        let core =
            AnalyticsCore::new(AnalyticsConfig::default(), Arc::new(InMemoryStore::default()))
                .unwrap();
        let mut stats = InputStats::default();

        let now = chrono::Utc::now().to_rfc3339();
        handle_line(
            &core,
            &format!(
                r#"{{"kind":"event","id":"e1","timestamp":"{}","severity":"low","message":"boom"}}"#,
                now
            ),
            &mut stats,
        );
        handle_line(&core, r#"{"kind":"event"}"#, &mut stats);
        handle_line(&core, "not json", &mut stats);
        handle_line(&core, "", &mut stats);

        assert_eq!(stats.lines, 4);
        assert_eq!(stats.events, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.unparseable, 1);
    }
}
