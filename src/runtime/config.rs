use crate::runtime::telemetry;
use anyhow::{bail, Result};
use std::time::Duration;

/// Ingest version written with every ledger. A persisted version that does
/// not match forces a full state rebuild.
pub const CURRENT_INGEST_VERSION: u32 = 19;

/// Upper bound for `max_ledgers_per_flush`.
pub const MAX_LEDGERS_PER_FLUSH_CAP: u32 = 10_000;

const DEFAULT_CHECKPOINT_FREQUENCY: u32 = 64;
const DEFAULT_STATE_VERIFICATION_CHECKPOINT_FREQUENCY: u32 = 1;
const DEFAULT_LEDGER_WAIT_INITIAL_BACKOFF_SECS: u64 = 6;
const DEFAULT_LEDGER_WAIT_BACKOFF_STEP_SECS: u64 = 2;
const DEFAULT_LEDGER_WAIT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_LEDGERS_PER_FLUSH: u32 = 100;
const DEFAULT_MAX_BUFFERED_ROWS: usize = 100_000;
const DEFAULT_REINGEST_WORKERS: usize = 1;
const DEFAULT_REINGEST_JOB_RETRIES: usize = 3;
const DEFAULT_REINGEST_RETRY_BACKOFF_SECS: u64 = 5;

/// Runtime configuration for the ingestion pipeline.
///
/// All instances must be constructed via [`IngestConfig::builder`] or
/// [`IngestConfig::new`] so invariants are validated before any consumer
/// observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    checkpoint_frequency: u32,
    state_verification_checkpoint_frequency: u32,
    disable_state_verification: bool,
    state_verification_timeout: Option<Duration>,
    ledger_wait_initial_backoff: Duration,
    ledger_wait_backoff_step: Duration,
    ledger_wait_timeout: Duration,
    max_ledgers_per_flush: u32,
    max_buffered_rows: usize,
    reingest_workers: usize,
    reingest_job_retries: usize,
    reingest_retry_backoff: Duration,
    metrics_interval: Duration,
    enable_filtering: bool,
}

pub struct IngestConfigParams {
    pub checkpoint_frequency: u32,
    pub state_verification_checkpoint_frequency: u32,
    pub disable_state_verification: bool,
    pub state_verification_timeout: Option<Duration>,
    pub ledger_wait_initial_backoff: Duration,
    pub ledger_wait_backoff_step: Duration,
    pub ledger_wait_timeout: Duration,
    pub max_ledgers_per_flush: u32,
    pub max_buffered_rows: usize,
    pub reingest_workers: usize,
    pub reingest_job_retries: usize,
    pub reingest_retry_backoff: Duration,
    pub metrics_interval: Duration,
    pub enable_filtering: bool,
}

impl IngestConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`IngestConfig::builder`] when most values use defaults.
    pub fn new(params: IngestConfigParams) -> Result<Self> {
        let IngestConfigParams {
            checkpoint_frequency,
            state_verification_checkpoint_frequency,
            disable_state_verification,
            state_verification_timeout,
            ledger_wait_initial_backoff,
            ledger_wait_backoff_step,
            ledger_wait_timeout,
            max_ledgers_per_flush,
            max_buffered_rows,
            reingest_workers,
            reingest_job_retries,
            reingest_retry_backoff,
            metrics_interval,
            enable_filtering,
        } = params;

        let config = Self {
            checkpoint_frequency,
            state_verification_checkpoint_frequency,
            disable_state_verification,
            state_verification_timeout,
            ledger_wait_initial_backoff,
            ledger_wait_backoff_step,
            ledger_wait_timeout,
            max_ledgers_per_flush,
            max_buffered_rows,
            reingest_workers,
            reingest_job_retries,
            reingest_retry_backoff,
            metrics_interval,
            enable_filtering,
        };

        config.validate()?;
        Ok(config)
    }

    /// Ledgers between checkpoints. Checkpoint ledgers satisfy
    /// `(sequence + 1) % checkpoint_frequency == 0`.
    pub fn checkpoint_frequency(&self) -> u32 {
        self.checkpoint_frequency
    }

    /// State is verified on every n-th checkpoint.
    pub fn state_verification_checkpoint_frequency(&self) -> u32 {
        self.state_verification_checkpoint_frequency
    }

    pub fn disable_state_verification(&self) -> bool {
        self.disable_state_verification
    }

    pub fn state_verification_timeout(&self) -> Option<Duration> {
        self.state_verification_timeout
    }

    /// First sleep when the next ledger is not yet available.
    pub fn ledger_wait_initial_backoff(&self) -> Duration {
        self.ledger_wait_initial_backoff
    }

    /// Added to the sleep after every further miss.
    pub fn ledger_wait_backoff_step(&self) -> Duration {
        self.ledger_wait_backoff_step
    }

    /// Overall bound on waiting for one ledger.
    pub fn ledger_wait_timeout(&self) -> Duration {
        self.ledger_wait_timeout
    }

    /// Ledgers per reingestion flush and per parallel reingestion job.
    pub fn max_ledgers_per_flush(&self) -> u32 {
        self.max_ledgers_per_flush
    }

    /// Buffered rows that force an early flush.
    pub fn max_buffered_rows(&self) -> usize {
        self.max_buffered_rows
    }

    pub fn reingest_workers(&self) -> usize {
        self.reingest_workers
    }

    /// Attempts per reingestion job before the run fails.
    pub fn reingest_job_retries(&self) -> usize {
        self.reingest_job_retries
    }

    pub fn reingest_retry_backoff(&self) -> Duration {
        self.reingest_retry_backoff
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn enable_filtering(&self) -> bool {
        self.enable_filtering
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_frequency == 0 {
            bail!("checkpoint_frequency must be greater than 0");
        }

        if self.state_verification_checkpoint_frequency == 0 {
            bail!("state_verification_checkpoint_frequency must be greater than 0");
        }

        if matches!(self.state_verification_timeout, Some(timeout) if timeout.is_zero()) {
            bail!("state_verification_timeout must be greater than 0 when set");
        }

        if self.ledger_wait_initial_backoff.is_zero() {
            bail!("ledger_wait_initial_backoff must be greater than 0");
        }

        if self.ledger_wait_timeout < self.ledger_wait_initial_backoff {
            bail!(
                "ledger_wait_timeout ({:?}) must be at least ledger_wait_initial_backoff ({:?})",
                self.ledger_wait_timeout,
                self.ledger_wait_initial_backoff,
            );
        }

        if self.max_ledgers_per_flush == 0 {
            bail!("max_ledgers_per_flush must be greater than 0");
        }

        if self.max_ledgers_per_flush > MAX_LEDGERS_PER_FLUSH_CAP {
            bail!(
                "max_ledgers_per_flush ({}) must not exceed {}",
                self.max_ledgers_per_flush,
                MAX_LEDGERS_PER_FLUSH_CAP,
            );
        }

        if self.max_buffered_rows == 0 {
            bail!("max_buffered_rows must be greater than 0");
        }

        if self.reingest_workers == 0 {
            bail!("reingest_workers must be greater than 0");
        }

        if self.reingest_job_retries == 0 {
            bail!("reingest_job_retries must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct IngestConfigBuilder {
    checkpoint_frequency: Option<u32>,
    state_verification_checkpoint_frequency: Option<u32>,
    disable_state_verification: Option<bool>,
    state_verification_timeout: Option<Duration>,
    ledger_wait_initial_backoff: Option<Duration>,
    ledger_wait_backoff_step: Option<Duration>,
    ledger_wait_timeout: Option<Duration>,
    max_ledgers_per_flush: Option<u32>,
    max_buffered_rows: Option<usize>,
    reingest_workers: Option<usize>,
    reingest_job_retries: Option<usize>,
    reingest_retry_backoff: Option<Duration>,
    metrics_interval: Option<Duration>,
    enable_filtering: Option<bool>,
}

impl IngestConfigBuilder {
    pub fn checkpoint_frequency(mut self, frequency: u32) -> Self {
        self.checkpoint_frequency = Some(frequency);
        self
    }

    pub fn state_verification_checkpoint_frequency(mut self, every: u32) -> Self {
        self.state_verification_checkpoint_frequency = Some(every);
        self
    }

    pub fn disable_state_verification(mut self, disabled: bool) -> Self {
        self.disable_state_verification = Some(disabled);
        self
    }

    pub fn state_verification_timeout(mut self, timeout: Duration) -> Self {
        self.state_verification_timeout = Some(timeout);
        self
    }

    pub fn ledger_wait_initial_backoff(mut self, backoff: Duration) -> Self {
        self.ledger_wait_initial_backoff = Some(backoff);
        self
    }

    pub fn ledger_wait_backoff_step(mut self, step: Duration) -> Self {
        self.ledger_wait_backoff_step = Some(step);
        self
    }

    pub fn ledger_wait_timeout(mut self, timeout: Duration) -> Self {
        self.ledger_wait_timeout = Some(timeout);
        self
    }

    pub fn max_ledgers_per_flush(mut self, ledgers: u32) -> Self {
        self.max_ledgers_per_flush = Some(ledgers);
        self
    }

    pub fn max_buffered_rows(mut self, rows: usize) -> Self {
        self.max_buffered_rows = Some(rows);
        self
    }

    pub fn reingest_workers(mut self, workers: usize) -> Self {
        self.reingest_workers = Some(workers);
        self
    }

    pub fn reingest_job_retries(mut self, attempts: usize) -> Self {
        self.reingest_job_retries = Some(attempts);
        self
    }

    pub fn reingest_retry_backoff(mut self, backoff: Duration) -> Self {
        self.reingest_retry_backoff = Some(backoff);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn enable_filtering(mut self, enabled: bool) -> Self {
        self.enable_filtering = Some(enabled);
        self
    }

    pub fn build(self) -> Result<IngestConfig> {
        let params = IngestConfigParams {
            checkpoint_frequency: self
                .checkpoint_frequency
                .unwrap_or(DEFAULT_CHECKPOINT_FREQUENCY),
            state_verification_checkpoint_frequency: self
                .state_verification_checkpoint_frequency
                .unwrap_or(DEFAULT_STATE_VERIFICATION_CHECKPOINT_FREQUENCY),
            disable_state_verification: self.disable_state_verification.unwrap_or(false),
            state_verification_timeout: self.state_verification_timeout,
            ledger_wait_initial_backoff: self
                .ledger_wait_initial_backoff
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_LEDGER_WAIT_INITIAL_BACKOFF_SECS)),
            ledger_wait_backoff_step: self
                .ledger_wait_backoff_step
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_LEDGER_WAIT_BACKOFF_STEP_SECS)),
            ledger_wait_timeout: self
                .ledger_wait_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_LEDGER_WAIT_TIMEOUT_SECS)),
            max_ledgers_per_flush: self
                .max_ledgers_per_flush
                .unwrap_or(DEFAULT_MAX_LEDGERS_PER_FLUSH),
            max_buffered_rows: self.max_buffered_rows.unwrap_or(DEFAULT_MAX_BUFFERED_ROWS),
            reingest_workers: self.reingest_workers.unwrap_or(DEFAULT_REINGEST_WORKERS),
            reingest_job_retries: self
                .reingest_job_retries
                .unwrap_or(DEFAULT_REINGEST_JOB_RETRIES),
            reingest_retry_backoff: self
                .reingest_retry_backoff
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_REINGEST_RETRY_BACKOFF_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            enable_filtering: self.enable_filtering.unwrap_or(false),
        };

        IngestConfig::new(params)
    }
}
