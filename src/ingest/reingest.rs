//! Parallel reingestion: jobs pulled from a shared queue by independent
//! workers, each with its own session and state machine.

use super::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition};
use super::system::System;
use super::{ingest_error, is_cancelled, IngestError};
use crate::ledger::LedgerRange;
use crate::runtime::config::IngestConfig;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::Telemetry;
use anyhow::{anyhow, bail, Result};
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Builds the worker-local [`System`] for `worker_id`. Called once per
/// attempt so a failed attempt never reuses a session.
pub type SystemFactory = Arc<dyn Fn(usize) -> Result<System> + Send + Sync>;

/// Splits every range into consecutive jobs of at most `job_size` ledgers.
pub fn split_ranges(ranges: &[LedgerRange], job_size: u32) -> Vec<LedgerRange> {
    ranges
        .iter()
        .flat_map(|range| range.chunks(job_size.max(1)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobReport {
    pub range: LedgerRange,
    pub attempts: usize,
    pub worker: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReingestReport {
    /// Sorted by range start.
    pub jobs: Vec<JobReport>,
}

impl ReingestReport {
    pub fn completed_ranges(&self) -> Vec<LedgerRange> {
        self.jobs.iter().map(|job| job.range).collect()
    }

    pub fn ledgers(&self) -> u64 {
        self.jobs.iter().map(|job| job.range.len() as u64).sum()
    }
}

struct Shared {
    queue: Mutex<VecDeque<LedgerRange>>,
    completed: Mutex<Vec<JobReport>>,
}

pub struct ParallelReingest {
    config: Arc<IngestConfig>,
    factory: SystemFactory,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl ParallelReingest {
    pub fn new(config: IngestConfig, factory: SystemFactory) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            telemetry: Arc::new(Telemetry::default()),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Counters shared by every worker instance.
    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Reingests `ranges` in jobs of `job_size` ledgers (capped by
    /// `max_ledgers_per_flush`) across `reingest_workers` workers.
    ///
    /// Ranges reaching the live cursor are rejected before any job starts.
    /// On failure the error is [`IngestError::ReingestFailed`] naming the
    /// failed job and the range to restart with, with the job's error as
    /// its source.
    pub async fn reingest_range(
        &self,
        ranges: &[LedgerRange],
        job_size: u32,
    ) -> Result<ReingestReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(IngestError::AlreadyRunning.into());
        }
        let result = self.reingest(ranges, job_size).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn reingest(&self, ranges: &[LedgerRange], job_size: u32) -> Result<ReingestReport> {
        if ranges.is_empty() {
            return Ok(ReingestReport::default());
        }

        let mut checker = (self.factory)(0)?;
        checker.ensure_no_live_overlap(ranges).await?;
        drop(checker);

        let job_size = job_size.clamp(1, self.config.max_ledgers_per_flush());
        let jobs = split_ranges(ranges, job_size);
        let end = ranges.iter().map(|range| range.end()).max().unwrap_or(0);
        let workers = self.config.reingest_workers().min(jobs.len()).max(1);

        tracing::info!(
            jobs = jobs.len(),
            job_size,
            workers,
            "starting parallel reingestion"
        );

        let shared = Arc::new(Shared {
            queue: Mutex::new(jobs.iter().copied().collect()),
            completed: Mutex::new(Vec::with_capacity(jobs.len())),
        });
        // A failed job stops this call only; the orchestrator stays usable.
        let run_token = self.shutdown.child_token();
        let fatal_handler = FatalErrorHandler::new(run_token.clone(), run_token.clone());

        let handles = (0..workers).map(|worker_id| {
            let worker = Worker {
                id: worker_id,
                config: self.config.clone(),
                factory: self.factory.clone(),
                telemetry: self.telemetry.clone(),
                token: run_token.clone(),
                fatal_handler: fatal_handler.clone(),
                shared: shared.clone(),
            };
            let fatal_handler = fatal_handler.clone();
            tokio::spawn(async move {
                let result = std::panic::AssertUnwindSafe(worker.run())
                    .catch_unwind()
                    .await;
                if let Err(panic_payload) = result {
                    let panic_msg = panic_message(panic_payload.as_ref());
                    tracing::error!(worker = worker_id, panic = %panic_msg, "reingestion worker panicked");
                    let context = format!("worker {worker_id} panicked");
                    fatal_handler.trigger_external(
                        context.as_str(),
                        anyhow!("worker {worker_id} panicked: {panic_msg}"),
                    );
                }
            })
        });

        for joined in join_all(handles).await {
            if let Err(err) = joined {
                fatal_handler.trigger_external("reingestion worker", anyhow!(err));
            }
        }

        let mut completed = std::mem::take(&mut *shared.completed.lock().unwrap());
        completed.sort_by_key(|job| job.range.start());

        if let Some(err) = fatal_handler.error() {
            let restart_from = jobs
                .iter()
                .filter(|job| !completed.iter().any(|done| done.range == **job))
                .map(|job| job.start())
                .min()
                .unwrap_or(end);
            let failed = fatal_handler.failed_job().unwrap_or(jobs[0]);
            let restart = LedgerRange::new(restart_from, end)?;
            tracing::error!(
                job = %failed,
                restart = %restart,
                completed = completed.len(),
                "parallel reingestion failed"
            );
            return Err(err.context(IngestError::ReingestFailed {
                job: failed,
                restart,
            }));
        }

        if self.shutdown.is_cancelled() {
            return Err(IngestError::Cancelled.into());
        }

        let report = ReingestReport { jobs: completed };
        if report.jobs.len() != jobs.len() {
            bail!(
                "reingestion finished {} of {} jobs",
                report.jobs.len(),
                jobs.len()
            );
        }

        tracing::info!(
            jobs = report.jobs.len(),
            ledgers = report.ledgers(),
            "parallel reingestion finished"
        );
        Ok(report)
    }
}

struct Worker {
    id: usize,
    config: Arc<IngestConfig>,
    factory: SystemFactory,
    telemetry: Arc<Telemetry>,
    token: CancellationToken,
    fatal_handler: FatalErrorHandler,
    shared: Arc<Shared>,
}

impl Worker {
    async fn run(self) {
        loop {
            if self.token.is_cancelled() {
                break;
            }
            let Some(job) = self.shared.queue.lock().unwrap().pop_front() else {
                break;
            };

            match self.run_job(job).await {
                Ok(attempts) => {
                    tracing::debug!(worker = self.id, job = %job, attempts, "reingestion job finished");
                    self.shared.completed.lock().unwrap().push(JobReport {
                        range: job,
                        attempts,
                        worker: self.id,
                    });
                }
                Err(err) if is_cancelled(&err) => break,
                Err(err) => {
                    self.fatal_handler.trigger_job(job, err);
                    break;
                }
            }
        }
    }

    /// Returns the number of attempts the job took.
    async fn run_job(&self, job: LedgerRange) -> Result<usize> {
        let backoff = RetryBackoff::fixed(self.config.reingest_retry_backoff())
            .with_max_attempts(self.config.reingest_job_retries())
            .with_cancellation(&self.token);

        retry_with_backoff(
            backoff,
            |attempt| {
                let factory = self.factory.clone();
                let telemetry = self.telemetry.clone();
                let token = self.token.child_token();
                let worker_id = self.id;
                async move {
                    let mut system = factory(worker_id)?
                        .with_cancellation_token(token)
                        .with_telemetry(telemetry);
                    system.reingest_range(&[job], false, false).await?;
                    Ok(attempt)
                }
            },
            |attempt, delay, err, will_retry| {
                if will_retry {
                    self.telemetry.record_reingest_retry();
                    tracing::warn!(
                        worker = self.id,
                        job = %job,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %format!("{err:#}"),
                        "reingestion job failed; retrying"
                    );
                }
            },
            |_, err| classify(err),
        )
        .await
    }
}

fn classify(err: &anyhow::Error) -> RetryDisposition {
    if is_cancelled(err) {
        return RetryDisposition::Abort;
    }
    match ingest_error(err) {
        Some(IngestError::RangeConflict { .. })
        | Some(IngestError::InvalidRange { .. })
        | Some(IngestError::DatabaseNotEmpty { .. }) => RetryDisposition::Abort,
        _ => RetryDisposition::Retry,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
