use crate::processors::ProcessorTimings;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters shared by every component of one ingestion system.
#[derive(Default, Debug)]
pub struct Telemetry {
    ledgers_ingested: AtomicU64,
    transactions_processed: AtomicU64,
    transactions_filtered: AtomicU64,
    reingested_ledgers: AtomicU64,
    reingest_job_retries: AtomicU64,
    verification_runs: AtomicU64,
    verification_failures: AtomicU64,
    processor_timings: Mutex<ProcessorTimings>,
}

impl Telemetry {
    pub fn record_ledger(&self, transactions: u64, filtered: u64) {
        self.ledgers_ingested.fetch_add(1, Ordering::Relaxed);
        self.record_transactions(transactions, filtered);
    }

    pub fn record_reingested(&self, ledgers: u64, transactions: u64, filtered: u64) {
        if ledgers > 0 {
            self.reingested_ledgers.fetch_add(ledgers, Ordering::Relaxed);
        }
        self.record_transactions(transactions, filtered);
    }

    fn record_transactions(&self, transactions: u64, filtered: u64) {
        if transactions > 0 {
            self.transactions_processed
                .fetch_add(transactions, Ordering::Relaxed);
        }
        if filtered > 0 {
            self.transactions_filtered
                .fetch_add(filtered, Ordering::Relaxed);
        }
    }

    pub fn record_reingest_retry(&self) {
        self.reingest_job_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_verification(&self, succeeded: bool) {
        self.verification_runs.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.verification_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Replaces the most recent per-processor timings.
    pub fn record_processor_timings(&self, timings: ProcessorTimings) {
        *self.processor_timings.lock().unwrap() = timings;
    }

    pub fn processor_timings(&self) -> ProcessorTimings {
        self.processor_timings.lock().unwrap().clone()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            ledgers_ingested: self.ledgers_ingested.load(Ordering::Relaxed),
            transactions_processed: self.transactions_processed.load(Ordering::Relaxed),
            transactions_filtered: self.transactions_filtered.load(Ordering::Relaxed),
            reingested_ledgers: self.reingested_ledgers.load(Ordering::Relaxed),
            reingest_job_retries: self.reingest_job_retries.load(Ordering::Relaxed),
            verification_runs: self.verification_runs.load(Ordering::Relaxed),
            verification_failures: self.verification_failures.load(Ordering::Relaxed),
        }
    }

    pub fn ledgers_ingested(&self) -> u64 {
        self.ledgers_ingested.load(Ordering::Relaxed)
    }

    pub fn reingested_ledgers(&self) -> u64 {
        self.reingested_ledgers.load(Ordering::Relaxed)
    }

    pub fn verification_runs(&self) -> u64 {
        self.verification_runs.load(Ordering::Relaxed)
    }

    pub fn verification_failures(&self) -> u64 {
        self.verification_failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub ledgers_ingested: u64,
    pub transactions_processed: u64,
    pub transactions_filtered: u64,
    pub reingested_ledgers: u64,
    pub reingest_job_retries: u64,
    pub verification_runs: u64,
    pub verification_failures: u64,
}

/// Spawns a background task that periodically logs ingestion throughput and
/// verification outcomes.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "ledger_ingest::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let ingested_delta = current_snapshot
                        .ledgers_ingested
                        .saturating_sub(last_snapshot.ledgers_ingested);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        ingested_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "ledger_ingest::metrics",
                        throughput = format!("{throughput:.2}"),
                        ledgers = current_snapshot.ledgers_ingested,
                        transactions = current_snapshot.transactions_processed,
                        filtered = current_snapshot.transactions_filtered,
                        reingested = current_snapshot.reingested_ledgers,
                        verifications = current_snapshot.verification_runs,
                        verification_failures = current_snapshot.verification_failures,
                        "ingestion metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
