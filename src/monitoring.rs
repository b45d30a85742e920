//! Self-monitoring of the analytics pipeline
//!
//! Tracks throughput and latency of the ingestion path and the periodic
//! tick, plus storage failures, so hosts can see whether the analytics core
//! itself is healthy.

use crate::error::StorageError;
use crate::events::Timestamp;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Seconds of accepted counts kept, enough to cover the last minute
const ACCEPTED_SLOTS: usize = 64;
/// Low bits of a slot hold the count, high bits the second it belongs to
const COUNT_BITS: u32 = 30;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const SECOND_SPAN: i64 = 1 << (64 - COUNT_BITS);

/// Health snapshot of the pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineHealth {
    pub accepted_total: u64,
    /// Events accepted in the minute before the snapshot
    pub accepted_last_minute: u64,
    /// Average over every ingest call since start
    pub avg_ingest_latency_us: f64,
    pub max_ingest_latency_us: u64,
    pub storage_transient_errors: u64,
    pub storage_fatal_errors: u64,
    pub ticks: u64,
    pub avg_tick_ms: f64,
    /// Resident memory where the platform reports it, otherwise 0
    pub memory_usage_bytes: u64,
    pub timestamp: Option<Timestamp>,
}

/// Collects pipeline metrics; shared by the ingestion path and the tick worker
///
/// Writers and readers only touch atomics, so producers never contend on a
/// lock and a health snapshot never stalls ingestion.
#[derive(Debug)]
pub struct PipelineMonitor {
    ingest_calls: AtomicU64,
    ingest_latency_total_us: AtomicU64,
    ingest_latency_max_us: AtomicU64,
    tick_total_us: AtomicU64,
    ticks: AtomicU64,
    /// Accepted events per wall-clock second, packed as `second << COUNT_BITS | count`
    accepted_slots: [AtomicU64; ACCEPTED_SLOTS],
    accepted_total: AtomicU64,
    storage_transient: AtomicU64,
    storage_fatal: AtomicU64,
}

impl Default for PipelineMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Second of `timestamp`, wrapped into the bits a slot has for it
fn second_stamp(timestamp: Timestamp) -> u64 {
    u64::try_from(timestamp.timestamp().rem_euclid(SECOND_SPAN)).unwrap_or(0)
}

fn slot_index(stamp: u64) -> usize {
    usize::try_from(stamp % ACCEPTED_SLOTS as u64).unwrap_or(0)
}

impl PipelineMonitor {
    pub fn new() -> Self {
        Self {
            ingest_calls: AtomicU64::new(0),
            ingest_latency_total_us: AtomicU64::new(0),
            ingest_latency_max_us: AtomicU64::new(0),
            tick_total_us: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            accepted_slots: std::array::from_fn(|_| AtomicU64::new(0)),
            accepted_total: AtomicU64::new(0),
            storage_transient: AtomicU64::new(0),
            storage_fatal: AtomicU64::new(0),
        }
    }

    pub fn record_ingest_latency(&self, duration: Duration) {
        let us = micros(duration);
        self.ingest_calls.fetch_add(1, Ordering::Relaxed);
        self.ingest_latency_total_us.fetch_add(us, Ordering::Relaxed);
        self.ingest_latency_max_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Count an accepted event at processing time `now`
    ///
    /// A slot still holding a newer second is left alone, so a producer
    /// running behind never erases a fresher count.
    pub fn record_accepted(&self, now: Timestamp) {
        self.accepted_total.fetch_add(1, Ordering::Relaxed);

        let stamp = second_stamp(now);
        let slot = &self.accepted_slots[slot_index(stamp)];
        let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
            let held = packed >> COUNT_BITS;
            if packed != 0 && held == stamp {
                let count = packed & COUNT_MASK;
                Some(if count < COUNT_MASK { packed + 1 } else { packed })
            } else if packed != 0 && held > stamp {
                None
            } else {
                Some((stamp << COUNT_BITS) | 1)
            }
        });
    }

    pub fn record_storage_error(&self, error: &StorageError) {
        match error {
            StorageError::Transient(_) => {
                self.storage_transient.fetch_add(1, Ordering::Relaxed);
            }
            StorageError::Fatal(_) => {
                self.storage_fatal.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_tick(&self, duration: Duration) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.tick_total_us.fetch_add(micros(duration), Ordering::Relaxed);
    }

    pub fn accepted_total(&self) -> u64 {
        self.accepted_total.load(Ordering::Relaxed)
    }

    /// Events accepted in the 61 whole seconds ending at `now`
    fn accepted_last_minute(&self, now: Timestamp) -> u64 {
        let newest = second_stamp(now);
        let oldest = newest.saturating_sub(60);
        self.accepted_slots
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|&packed| {
                let second = packed >> COUNT_BITS;
                packed != 0 && (oldest..=newest).contains(&second)
            })
            .map(|packed| packed & COUNT_MASK)
            .sum()
    }

    /// Collect a health snapshot as of `now`
    pub fn collect_metrics(&self, now: Timestamp) -> PipelineHealth {
        let calls = self.ingest_calls.load(Ordering::Relaxed);
        let avg_ingest_latency_us = if calls == 0 {
            0.0
        } else {
            self.ingest_latency_total_us.load(Ordering::Relaxed) as f64 / calls as f64
        };

        let ticks = self.ticks.load(Ordering::Relaxed);
        let avg_tick_ms = if ticks == 0 {
            0.0
        } else {
            self.tick_total_us.load(Ordering::Relaxed) as f64 / 1000.0 / ticks as f64
        };

        let health = PipelineHealth {
            accepted_total: self.accepted_total(),
            accepted_last_minute: self.accepted_last_minute(now),
            avg_ingest_latency_us,
            max_ingest_latency_us: self.ingest_latency_max_us.load(Ordering::Relaxed),
            storage_transient_errors: self.storage_transient.load(Ordering::Relaxed),
            storage_fatal_errors: self.storage_fatal.load(Ordering::Relaxed),
            ticks,
            avg_tick_ms,
            memory_usage_bytes: memory_usage(),
            timestamp: Some(now),
        };

        debug!(
            "Pipeline health: accepted/min={}, ingest_latency={:.1}us, tick={:.1}ms",
            health.accepted_last_minute, health.avg_ingest_latency_us, health.avg_tick_ms
        );
        if health.avg_ingest_latency_us > 1000.0 {
            warn!(
                "High ingest latency detected: {:.1}us",
                health.avg_ingest_latency_us
            );
        }
        health
    }
}

/// Resident set size of the current process
fn memory_usage() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb) = line
                        .split_whitespace()
                        .nth(1)
                        .and_then(|kb| kb.parse::<u64>().ok())
                    {
                        return kb * 1024;
                    }
                }
            }
        }
    }
    0
}

/// Measures one ingest call and records it on finish
pub struct IngestTimer {
    start_time: Instant,
    monitor: Arc<PipelineMonitor>,
}

impl IngestTimer {
    pub fn start(monitor: Arc<PipelineMonitor>) -> Self {
        Self {
            start_time: Instant::now(),
            monitor,
        }
    }

    pub fn finish(self) {
        self.monitor.record_ingest_latency(self.start_time.elapsed());
    }
}
