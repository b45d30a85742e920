//! Analytics core lifecycle
//!
//! `AnalyticsCore` owns one instance of every component, runs the ingestion
//! pipeline on the caller's thread and the periodic tick on a dedicated
//! worker thread between `start()` and `stop()`.

use crate::aggregator::{AggregationEngine, RecordOutcome};
use crate::alerts::{AlertEngine, AlertSink, Broadcaster};
use crate::config::AnalyticsConfig;
use crate::error::{CoreError, StorageError};
use crate::events::{ErrorEvent, RawErrorEvent, RecoveryAttempt, Severity, TimeRange, Timestamp};
use crate::fingerprint::Fingerprinter;
use crate::ingest::EventIngestor;
use crate::monitoring::{IngestTimer, PipelineMonitor};
use crate::patterns::PatternClusterer;
use crate::query::QueryFacade;
use crate::recovery::RecoveryTracker;
use crate::store::{AnalyticsStore, StorageHealth};
use crate::trends::TrendAnalyzer;
use crate::triggers::{ThresholdRule, TriggerEngine, TriggerRule};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Source reference of the alert raised when storage fails fatally
pub const STORAGE_SOURCE_REF: &str = "storage";

/// Answer to an ingest call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
}

impl IngestReceipt {
    fn accepted(pattern_id: String) -> Self {
        Self {
            accepted: true,
            reason: None,
            pattern_id: Some(pattern_id),
        }
    }

    fn rejected(reason: String) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
            pattern_id: None,
        }
    }
}

/// Accepted event as pushed to event subscribers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveEvent {
    pub event: ErrorEvent,
    pub fingerprint_key: String,
    pub pattern_id: String,
    /// The event's bucket had already closed
    pub late: bool,
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub closed_buckets: usize,
    pub anomalies: usize,
    /// Threshold alerts newly created (deduplicated ones excluded)
    pub threshold_alerts: usize,
    pub purged_alerts: usize,
}

/// Every component of one core instance, shared with the tick worker
pub(crate) struct Pipeline {
    pub(crate) config: AnalyticsConfig,
    pub(crate) ingestor: EventIngestor,
    pub(crate) fingerprinter: Fingerprinter,
    pub(crate) aggregation: AggregationEngine,
    pub(crate) clusterer: PatternClusterer,
    pub(crate) trends: TrendAnalyzer,
    pub(crate) recovery: RecoveryTracker,
    pub(crate) alerts: AlertEngine,
    pub(crate) triggers: Mutex<TriggerEngine>,
    pub(crate) live_events: Broadcaster<LiveEvent>,
    pub(crate) store: Arc<dyn AnalyticsStore>,
    pub(crate) storage_health: StorageHealth,
    pub(crate) monitor: Arc<PipelineMonitor>,
}

impl Pipeline {
    fn new(config: AnalyticsConfig, store: Arc<dyn AnalyticsStore>) -> Self {
        let mut triggers = TriggerEngine::new();
        for rule in &config.thresholds {
            triggers.add_rule(Box::new(ThresholdRule::from_config(rule)));
        }

        Self {
            ingestor: EventIngestor::new(config.retention_horizon(), config.clock_skew_tolerance()),
            fingerprinter: Fingerprinter::new(config.fingerprint_max_frames),
            aggregation: AggregationEngine::new(
                config.bucket_width(),
                config.retention_buckets,
                config.late_event_grace(),
            ),
            clusterer: PatternClusterer::new(
                config.cluster_similarity_threshold,
                config.retention_horizon(),
            ),
            trends: TrendAnalyzer::new(
                config.anomaly_k_factor,
                config.bucket_width(),
                config.history_retention_buckets,
            ),
            recovery: RecoveryTracker::new(
                config.min_recovery_samples,
                config.latency_reservoir_size,
                config.failure_reason_top_k,
            ),
            alerts: AlertEngine::new(config.subscriber_buffer, config.resolved_alert_grace()),
            triggers: Mutex::new(triggers),
            live_events: Broadcaster::new("events", config.subscriber_buffer),
            store,
            storage_health: StorageHealth::new(),
            monitor: Arc::new(PipelineMonitor::new()),
            config,
        }
    }

    fn triggers(&self) -> MutexGuard<'_, TriggerEngine> {
        self.triggers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load stored bucket history into the trend analyzer
    fn warm_up(&self, now: Timestamp) {
        let range = TimeRange::ending_at(now, self.config.history_horizon());
        match self.store.read_buckets_in_range(range) {
            Ok(points) => {
                if !points.is_empty() {
                    info!("Seeding trend history with {} stored buckets", points.len());
                }
                self.trends.seed(&points);
            }
            Err(e) => {
                self.on_storage_error(e, now);
            }
        }
    }

    fn process(&self, raw: RawErrorEvent, now: Timestamp) -> IngestReceipt {
        let event = match self.ingestor.ingest_at(raw, now) {
            Ok(event) => event,
            Err(e) => return IngestReceipt::rejected(e.to_string()),
        };

        let fingerprint = self.fingerprinter.fingerprint(&event);
        let late = self.aggregation.record(&event, &fingerprint) == RecordOutcome::Late;
        let assignment = self.clusterer.assign_at(&event, &fingerprint, now);
        self.alerts.on_pattern(&assignment, now);

        self.persist(now, |store| store.append_event(&event, &fingerprint.key));
        self.persist(now, |store| store.upsert_pattern(&assignment.pattern));

        self.monitor.record_accepted(now);
        let pattern_id = assignment.pattern.id;
        self.live_events.publish(&LiveEvent {
            event,
            fingerprint_key: fingerprint.key,
            pattern_id: pattern_id.clone(),
            late,
        });

        IngestReceipt::accepted(pattern_id)
    }

    /// Run a store write unless the store has already failed fatally
    fn persist<F>(&self, now: Timestamp, write: F)
    where
        F: FnOnce(&dyn AnalyticsStore) -> Result<(), StorageError>,
    {
        if self.storage_health.is_degraded() {
            return;
        }
        if let Err(e) = write(self.store.as_ref()) {
            self.on_storage_error(e, now);
        }
    }

    fn on_storage_error(&self, e: StorageError, now: Timestamp) {
        self.monitor.record_storage_error(&e);
        match e {
            StorageError::Transient(reason) => {
                warn!("Storage write failed after retries: {}", reason);
            }
            StorageError::Fatal(reason) => {
                if self.storage_health.record_fatal(&reason, now) {
                    self.alerts.raise_system(
                        STORAGE_SOURCE_REF,
                        Severity::Critical,
                        "Analytics storage unavailable",
                        &format!("Serving in-memory results only: {}", reason),
                        now,
                    );
                }
            }
        }
    }

    fn tick(&self, now: Timestamp) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();

        for point in self.aggregation.close_due(now) {
            report.closed_buckets += 1;
            self.persist(now, |store| store.append_bucket(&point));
            if let Some(anomaly) = self.trends.observe(&point) {
                report.anomalies += 1;
                self.alerts.on_anomaly(&anomaly, now);
            }
        }

        let contexts = self.triggers().evaluate(now, |window| {
            self.aggregation
                .query_overview(TimeRange::ending_at(now, window), now)
        });
        for context in &contexts {
            if self.alerts.on_trigger(context, now).is_created() {
                report.threshold_alerts += 1;
            }
        }

        report.purged_alerts = self.alerts.purge_resolved(now);
        self.monitor.record_tick(started.elapsed());

        if report.closed_buckets > 0 || !contexts.is_empty() {
            debug!(
                "Tick closed {} buckets, {} anomalies, {} breaching rules",
                report.closed_buckets,
                report.anomalies,
                contexts.len()
            );
        }
        report
    }
}

/// Handle of the running tick worker
struct TickWorker {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// One error analytics instance
///
/// Instances are independent; several can live in the same process.
///
/// # Examples
///
/// ```
/// use faultline::{AnalyticsConfig, AnalyticsCore, InMemoryStore, RawErrorEvent};
/// use std::sync::Arc;
///
/// let core = AnalyticsCore::new(AnalyticsConfig::default(), Arc::new(InMemoryStore::default()))
///     .unwrap();
/// let receipt = core.ingest(RawErrorEvent {
///     id: Some("evt-1".to_string()),
///     timestamp: Some(chrono::Utc::now()),
///     severity: Some("high".to_string()),
///     message: Some("Request failed with status 503".to_string()),
///     ..RawErrorEvent::default()
/// });
/// assert!(receipt.accepted);
/// ```
pub struct AnalyticsCore {
    pipeline: Arc<Pipeline>,
    worker: Mutex<Option<TickWorker>>,
}

impl AnalyticsCore {
    /// Build a core over `store`
    ///
    /// Registers the configured threshold rules and seeds trend history from
    /// the buckets the store already holds.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` if the configuration does not validate.
    pub fn new(config: AnalyticsConfig, store: Arc<dyn AnalyticsStore>) -> Result<Self, CoreError> {
        Self::new_at(config, store, Utc::now())
    }

    pub fn new_at(
        config: AnalyticsConfig,
        store: Arc<dyn AnalyticsStore>,
        now: Timestamp,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let pipeline = Pipeline::new(config, store);
        pipeline.warm_up(now);
        info!(
            "Analytics core ready: {}s buckets, {} threshold rules",
            pipeline.config.bucket_width_seconds,
            pipeline.config.thresholds.len()
        );
        Ok(Self {
            pipeline: Arc::new(pipeline),
            worker: Mutex::new(None),
        })
    }

    /// Build a core and deliver every new alert to `sink`
    pub fn with_sink(
        config: AnalyticsConfig,
        store: Arc<dyn AnalyticsStore>,
        sink: Arc<dyn AlertSink>,
    ) -> Result<Self, CoreError> {
        let core = Self::new(config, store)?;
        core.pipeline.alerts.attach_sink(sink)?;
        Ok(core)
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.pipeline.config
    }

    fn worker(&self) -> MutexGuard<'_, Option<TickWorker>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the periodic tick on its own thread
    ///
    /// # Errors
    ///
    /// Returns `CoreError::AlreadyRunning` if started twice and
    /// `CoreError::WorkerSpawn` if the thread cannot be created.
    pub fn start(&self) -> Result<(), CoreError> {
        let mut worker = self.worker();
        if worker.is_some() {
            return Err(CoreError::AlreadyRunning);
        }

        let (shutdown, shutdown_rx) = mpsc::channel::<()>();
        let pipeline = Arc::clone(&self.pipeline);
        let interval = pipeline.config.alert_tick_interval();

        let handle = thread::Builder::new()
            .name("faultline-tick".to_string())
            .spawn(move || {
                info!("Tick worker started ({:?} interval)", interval);
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            pipeline.tick(Utc::now());
                        }
                    }
                }
                info!("Tick worker stopped");
            })?;

        *worker = Some(TickWorker { shutdown, handle });
        Ok(())
    }

    /// Stop the tick worker and wait for it to exit
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotRunning` if the worker is not running.
    pub fn stop(&self) -> Result<(), CoreError> {
        let worker = self.worker().take().ok_or(CoreError::NotRunning)?;
        // The worker may already have exited, so a closed channel is fine
        let _ = worker.shutdown.send(());
        if worker.handle.join().is_err() {
            error!("Tick worker panicked");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker().is_some()
    }

    /// Validate and process one event; never fails the caller
    pub fn ingest(&self, raw: RawErrorEvent) -> IngestReceipt {
        self.ingest_at(raw, Utc::now())
    }

    pub fn ingest_at(&self, raw: RawErrorEvent, now: Timestamp) -> IngestReceipt {
        let timer = IngestTimer::start(Arc::clone(&self.pipeline.monitor));
        let receipt = self.pipeline.process(raw, now);
        timer.finish();
        receipt
    }

    /// Fold a recovery attempt into its strategy's statistics
    ///
    /// Not idempotent: recording the same attempt twice counts it twice.
    pub fn record_recovery_attempt(&self, attempt: RecoveryAttempt) {
        self.pipeline.recovery.record(&attempt);
    }

    /// Register a rule evaluated on every tick, replacing one with the same name
    pub fn add_trigger_rule(&self, rule: Box<dyn TriggerRule>) {
        self.pipeline.triggers().add_rule(rule);
    }

    /// Run one tick now: close due buckets, detect anomalies, evaluate
    /// trigger rules and purge expired resolved alerts
    pub fn tick(&self) -> TickReport {
        self.tick_at(Utc::now())
    }

    pub fn tick_at(&self, now: Timestamp) -> TickReport {
        self.pipeline.tick(now)
    }

    pub fn query(&self) -> QueryFacade {
        QueryFacade::new(Arc::clone(&self.pipeline))
    }
}

impl Drop for AnalyticsCore {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                warn!("Failed to stop tick worker: {}", e);
            }
        }
    }
}
