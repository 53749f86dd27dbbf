//! The ingestion state machine: `start`, `build`, `resume`, `verify_range`,
//! `reingest_history_range` and `stop`. One state is active at a time; every
//! ledger is applied and the cursor advanced inside a single transaction.

use super::aggregates::DerivedAggregates;
use super::lifecycle::{join_verification, LifecycleHandles};
use super::runner::{ProcessorRunner, RunStats};
use super::verify::{
    ledger_eligible_for_state_verification, ArchiveStateVerifier, StateVerifier, Verification,
    VerificationTask,
};
use super::watch::{ledger_fetch_error, wait_for_ledger, WaitPolicy};
use super::{is_cancelled, IngestError};
use crate::ledger::{HistoryArchive, LedgerCloseMeta, LedgerRange, LedgerSource};
use crate::processors::ProcessorSet;
use crate::runtime::config::{IngestConfig, CURRENT_INGEST_VERSION};
use crate::runtime::progress::{ProgressTracker, StateName, StateSnapshot};
use crate::runtime::telemetry::Telemetry;
use crate::storage::Session;
use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// True when `sequence` closes a checkpoint period.
pub fn is_checkpoint(sequence: u32, checkpoint_frequency: u32) -> bool {
    checkpoint_frequency > 0 && (sequence as u64 + 1) % checkpoint_frequency as u64 == 0
}

/// Latest checkpoint ledger not after `sequence`.
pub fn checkpoint_at_or_before(sequence: u32, checkpoint_frequency: u32) -> Option<u32> {
    if checkpoint_frequency == 0 {
        return None;
    }
    let periods = (sequence as u64 + 1) / checkpoint_frequency as u64;
    if periods == 0 {
        return None;
    }
    u32::try_from(periods * checkpoint_frequency as u64 - 1).ok()
}

/// Non-forced reingestion must end before the live cursor.
pub fn check_range_conflict(range: LedgerRange, cursor: u32) -> Result<()> {
    if cursor > 0 && range.end() >= cursor {
        return Err(IngestError::RangeConflict { range, cursor }.into());
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Start {
        skip_checks: bool,
    },
    /// `history_through`: ledgers up to this sequence already have history
    /// rows, so resuming over them replays state only.
    Build {
        checkpoint: u32,
        skip_checks: bool,
        stop: bool,
        history_through: u32,
    },
    Resume {
        latest: u32,
        history_through: u32,
    },
    VerifyRange {
        from: u32,
        to: u32,
        verify_state: bool,
    },
    ReingestHistoryRange {
        range: LedgerRange,
        force: bool,
        rebuild_aggregates: bool,
    },
    Stop,
}

impl State {
    pub fn name(&self) -> StateName {
        match self {
            State::Start { .. } => StateName::Start,
            State::Build { .. } => StateName::Build,
            State::Resume { .. } => StateName::Resume,
            State::VerifyRange { .. } => StateName::VerifyRange,
            State::ReingestHistoryRange { .. } => StateName::ReingestHistoryRange,
            State::Stop => StateName::Stop,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Start { skip_checks } => write!(f, "start(skip_checks={skip_checks})"),
            State::Build {
                checkpoint,
                skip_checks,
                ..
            } => write!(f, "build(checkpoint={checkpoint}, skip_checks={skip_checks})"),
            State::Resume { latest, .. } => write!(f, "resume(latest={latest})"),
            State::VerifyRange {
                from,
                to,
                verify_state,
            } => write!(f, "verify_range(from={from}, to={to}, verify_state={verify_state})"),
            State::ReingestHistoryRange { range, force, .. } => {
                write!(f, "reingest_history_range(range={range}, force={force})")
            }
            State::Stop => f.write_str("stop"),
        }
    }
}

enum Tick {
    Applied(RunStats),
    /// Another instance moved the cursor past the expected ledger.
    Advanced { cursor: u32 },
    Restart,
}

pub struct SystemParams {
    pub config: IngestConfig,
    pub source: Arc<dyn LedgerSource>,
    pub archive: Arc<dyn HistoryArchive>,
    pub session: Box<dyn Session>,
    pub processors: Arc<dyn ProcessorSet>,
}

/// One ingestion instance: one session, one state machine.
pub struct System {
    config: Arc<IngestConfig>,
    session: Box<dyn Session>,
    source: Arc<dyn LedgerSource>,
    archive: Arc<dyn HistoryArchive>,
    processors: Arc<dyn ProcessorSet>,
    runner: ProcessorRunner,
    verifier: Arc<dyn StateVerifier>,
    aggregates: Option<Arc<dyn DerivedAggregates>>,
    telemetry: Arc<Telemetry>,
    progress: Arc<ProgressTracker>,
    shutdown: CancellationToken,
    verification: Option<JoinHandle<()>>,
    verification_running: Arc<AtomicBool>,
}

impl System {
    pub fn new(params: SystemParams) -> Self {
        let SystemParams {
            config,
            source,
            archive,
            session,
            processors,
        } = params;

        let config = Arc::new(config);
        let telemetry = Arc::new(Telemetry::default());
        let runner = ProcessorRunner::new(
            config.clone(),
            source.clone(),
            archive.clone(),
            processors.clone(),
            telemetry.clone(),
        );
        let verifier = Arc::new(ArchiveStateVerifier::new(archive.clone()));

        Self {
            config,
            session,
            source,
            archive,
            processors,
            runner,
            verifier,
            aggregates: None,
            telemetry,
            progress: Arc::new(ProgressTracker::new()),
            shutdown: CancellationToken::new(),
            verification: None,
            verification_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Shares counters with other instances, e.g. reingestion workers.
    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.runner = ProcessorRunner::new(
            self.config.clone(),
            self.source.clone(),
            self.archive.clone(),
            self.processors.clone(),
            telemetry.clone(),
        );
        self.telemetry = telemetry;
        self
    }

    pub fn with_state_verifier(mut self, verifier: Arc<dyn StateVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_derived_aggregates(mut self, aggregates: Arc<dyn DerivedAggregates>) -> Self {
        self.aggregates = Some(aggregates);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Lock-free; safe to call from other tasks while `run` executes.
    pub fn current_state(&self) -> Arc<StateSnapshot> {
        self.progress.current()
    }

    /// Handle for reading the state from another task while `run` holds
    /// the system.
    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    /// Drives live ingestion until cancelled (returns `Ok`) or a fatal error.
    /// Either way the system is shut down when this returns.
    pub async fn run(&mut self) -> Result<()> {
        let lifecycle = LifecycleHandles::spawn(
            &self.shutdown,
            self.telemetry.clone(),
            self.config.metrics_interval(),
        );

        let result = self
            .run_state_machine(State::Start { skip_checks: false })
            .await;
        lifecycle.shutdown().await;
        // Background verification must not outlive the run, whatever ended it.
        self.shutdown().await;

        match result {
            Err(err) if is_cancelled(&err) => {
                tracing::info!("ingestion cancelled; shut down");
                Ok(())
            }
            other => other,
        }
    }

    /// Rebuilds state at `checkpoint` and stops.
    pub async fn build_state(&mut self, checkpoint: u32, skip_checks: bool) -> Result<()> {
        self.run_state_machine(State::Build {
            checkpoint,
            skip_checks,
            stop: true,
            history_through: 0,
        })
        .await
    }

    /// Replays `[from, to]` into an empty database, optionally verifying the
    /// resulting state at `to`.
    pub async fn verify_range(&mut self, from: u32, to: u32, verify_state: bool) -> Result<()> {
        self.run_state_machine(State::VerifyRange {
            from,
            to,
            verify_state,
        })
        .await
    }

    /// Regenerates history rows for `ranges` one range at a time. Without
    /// `force` every range must end before the live cursor; with `force` each
    /// range holds the cursor lock for its whole transaction.
    pub async fn reingest_range(
        &mut self,
        ranges: &[LedgerRange],
        force: bool,
        rebuild_derived_aggregates: bool,
    ) -> Result<()> {
        if !force {
            self.ensure_no_live_overlap(ranges).await?;
        }

        for range in ranges {
            self.run_state_machine(State::ReingestHistoryRange {
                range: *range,
                force,
                rebuild_aggregates: rebuild_derived_aggregates,
            })
            .await?;
        }
        Ok(())
    }

    /// Fails with [`IngestError::RangeConflict`] when any range reaches the
    /// live cursor.
    pub async fn ensure_no_live_overlap(&mut self, ranges: &[LedgerRange]) -> Result<()> {
        let cursor = self.session.get_last_ledger_ingest_non_blocking().await?;
        ranges
            .iter()
            .try_for_each(|range| check_range_conflict(*range, cursor))
    }

    /// Cancels every task of this instance and waits, bounded, for a running
    /// verification.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.verification.take() {
            join_verification(handle).await;
        }
    }

    async fn run_state_machine(&mut self, initial: State) -> Result<()> {
        let mut state = initial;
        let mut previous: Option<StateName> = None;

        loop {
            let name = state.name();
            self.progress.enter(name);
            if previous != Some(name) {
                tracing::info!(state = %state, "entering state");
                previous = Some(name);
            }

            if let State::Stop = state {
                return Ok(());
            }

            match self.step(state).await {
                Ok(next) => state = next,
                Err(err) => {
                    self.progress.enter(StateName::Stop);
                    if !is_cancelled(&err) {
                        tracing::error!(
                            state = %name,
                            error = %format!("{err:#}"),
                            "ingestion stopped with error"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn step(&mut self, state: State) -> Result<State> {
        match state {
            State::Start { skip_checks } => self.start(skip_checks).await,
            State::Build {
                checkpoint,
                skip_checks,
                stop,
                history_through,
            } => {
                self.build(checkpoint, skip_checks, stop, history_through)
                    .await
            }
            State::Resume {
                latest,
                history_through,
            } => self.resume(latest, history_through).await,
            State::VerifyRange {
                from,
                to,
                verify_state,
            } => self.verify_range_state(from, to, verify_state).await,
            State::ReingestHistoryRange {
                range,
                force,
                rebuild_aggregates,
            } => {
                self.reingest_history_range(range, force, rebuild_aggregates)
                    .await
            }
            State::Stop => Ok(State::Stop),
        }
    }

    async fn rollback_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() && self.session.in_transaction() {
            if let Err(err) = self.session.rollback().await {
                tracing::warn!(error = %err, "rollback failed");
            }
        }
        result
    }

    async fn start(&mut self, skip_checks: bool) -> Result<State> {
        self.session.begin().await?;
        let read = self.read_ingest_state().await;
        // Read-only: end the transaction to release the cursor lock.
        self.session.rollback().await?;
        let (last, version, invalid) = read?;

        self.progress.mark_ingested(last, version, 0);

        if last == 0 {
            let checkpoint = self
                .archive
                .get_latest_checkpoint()
                .await
                .context("error getting the latest checkpoint from the archive")?;
            tracing::info!(checkpoint, "database is empty; building state");
            return Ok(State::Build {
                checkpoint,
                skip_checks,
                stop: false,
                history_through: 0,
            });
        }

        if version != CURRENT_INGEST_VERSION || invalid {
            let checkpoint = checkpoint_at_or_before(last, self.config.checkpoint_frequency())
                .ok_or_else(|| {
                    anyhow!("no checkpoint at or before ledger {last} to rebuild state from")
                })?;
            tracing::info!(
                last_ingested = last,
                checkpoint,
                ingest_version = version,
                expected_version = CURRENT_INGEST_VERSION,
                state_invalid = invalid,
                "clearing and rebuilding state"
            );
            return Ok(State::Build {
                checkpoint,
                skip_checks: true,
                stop: false,
                history_through: last,
            });
        }

        Ok(State::Resume {
            latest: last,
            history_through: 0,
        })
    }

    async fn read_ingest_state(&mut self) -> Result<(u32, u32, bool)> {
        let last = self.session.get_last_ledger_ingest().await?;
        let version = self.session.get_ingest_version().await?;
        let invalid = self.session.get_state_invalid().await?;
        Ok((last, version, invalid))
    }

    async fn build(
        &mut self,
        checkpoint: u32,
        skip_checks: bool,
        stop: bool,
        history_through: u32,
    ) -> Result<State> {
        if !is_checkpoint(checkpoint, self.config.checkpoint_frequency()) {
            bail!(
                "ledger {checkpoint} is not a checkpoint (frequency {})",
                self.config.checkpoint_frequency()
            );
        }

        let started = Instant::now();
        self.session.begin().await?;
        let result = self.build_in_tx(checkpoint, skip_checks).await;
        let built = self.rollback_on_error(result).await?;

        if !built {
            tracing::info!(checkpoint, "state is already built; skipping");
            return Ok(if stop {
                State::Stop
            } else {
                State::Start { skip_checks: false }
            });
        }

        self.progress
            .mark_ingested(checkpoint, CURRENT_INGEST_VERSION, 0);
        tracing::info!(
            checkpoint,
            duration_ms = started.elapsed().as_millis() as u64,
            "state built"
        );

        Ok(if stop {
            State::Stop
        } else {
            State::Resume {
                latest: checkpoint,
                history_through,
            }
        })
    }

    /// Returns false when another instance built the state first.
    async fn build_in_tx(&mut self, checkpoint: u32, skip_checks: bool) -> Result<bool> {
        let (last, version, invalid) = self.read_ingest_state().await?;
        if !skip_checks && last != 0 && version == CURRENT_INGEST_VERSION && !invalid {
            self.session.rollback().await?;
            return Ok(false);
        }

        self.session.truncate_state().await?;
        self.runner
            .run_history_archive_ingestion(self.session.as_mut(), checkpoint)
            .await?;
        self.session.update_last_ledger_ingest(checkpoint).await?;
        self.session
            .update_ingest_version(CURRENT_INGEST_VERSION)
            .await?;
        self.session.update_state_invalid(false).await?;
        self.session
            .commit()
            .await
            .context("error committing state build")?;
        Ok(true)
    }

    async fn resume(&mut self, latest: u32, history_through: u32) -> Result<State> {
        if latest == 0 {
            bail!("unexpected last ingested ledger 0 in resume");
        }

        let sequence = latest + 1;
        let ledger = wait_for_ledger(
            self.source.as_ref(),
            sequence,
            WaitPolicy::from_config(&self.config),
            &self.shutdown,
        )
        .await?;

        let started = Instant::now();
        self.session.begin().await?;
        let result = self.apply_ledger(&ledger, latest, history_through).await;

        match self.rollback_on_error(result).await? {
            Tick::Applied(stats) => {
                self.telemetry
                    .record_ledger(stats.transactions, stats.filtered);
                self.progress
                    .mark_ingested(sequence, CURRENT_INGEST_VERSION, 1);
                tracing::info!(
                    ledger = sequence,
                    transactions = stats.transactions,
                    filtered = stats.filtered,
                    changes = stats.changes,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "processed ledger"
                );
                self.maybe_verify_state(sequence).await;
                Ok(State::Resume {
                    latest: sequence,
                    history_through,
                })
            }
            Tick::Advanced { cursor } => {
                tracing::info!(
                    expected = latest,
                    cursor,
                    "another instance advanced the cursor; resuming from it"
                );
                self.progress
                    .mark_ingested(cursor, CURRENT_INGEST_VERSION, 0);
                Ok(State::Resume {
                    latest: cursor,
                    history_through,
                })
            }
            Tick::Restart => Ok(State::Start { skip_checks: false }),
        }
    }

    async fn apply_ledger(
        &mut self,
        ledger: &LedgerCloseMeta,
        latest: u32,
        history_through: u32,
    ) -> Result<Tick> {
        let cursor = self.session.get_last_ledger_ingest().await?;
        let version = self.session.get_ingest_version().await?;

        if version != CURRENT_INGEST_VERSION {
            self.session.rollback().await?;
            tracing::info!(
                ingest_version = version,
                expected_version = CURRENT_INGEST_VERSION,
                "ingest version changed; restarting"
            );
            return Ok(Tick::Restart);
        }
        if cursor > latest {
            self.session.rollback().await?;
            return Ok(Tick::Advanced { cursor });
        }
        if cursor < latest {
            self.session.rollback().await?;
            tracing::warn!(
                expected = latest,
                cursor,
                "cursor moved backwards; restarting"
            );
            return Ok(Tick::Restart);
        }

        let session = self.session.as_mut();
        let stats = if ledger.sequence() <= history_through {
            self.runner
                .run_change_processors_on_ledger(session, ledger)
                .await?
        } else {
            self.runner
                .run_all_processors_on_ledger(session, ledger)
                .await?
        };
        self.session
            .update_last_ledger_ingest(ledger.sequence())
            .await?;
        self.session
            .commit()
            .await
            .with_context(|| format!("error committing ledger {}", ledger.sequence()))?;
        Ok(Tick::Applied(stats))
    }

    /// Verification reads a snapshot taken here, right after the checkpoint
    /// commit, so ingestion may keep advancing while it runs.
    async fn maybe_verify_state(&mut self, sequence: u32) {
        if self.config.disable_state_verification() {
            return;
        }
        if !ledger_eligible_for_state_verification(
            self.config.checkpoint_frequency(),
            self.config.state_verification_checkpoint_frequency(),
            sequence,
        ) {
            return;
        }
        if self.verification_running.swap(true, Ordering::SeqCst) {
            tracing::debug!(ledger = sequence, "state verification already running; skipping");
            return;
        }

        let mut session = self.session.clone_session();
        if let Err(err) = session.begin_snapshot().await {
            tracing::warn!(ledger = sequence, error = %err, "could not snapshot state for verification");
            self.verification_running.store(false, Ordering::SeqCst);
            return;
        }

        let task = VerificationTask {
            session,
            verifier: self.verifier.clone(),
            telemetry: self.telemetry.clone(),
            checkpoint: sequence,
            timeout: self.config.state_verification_timeout(),
            token: self.shutdown.child_token(),
            running: self.verification_running.clone(),
        };
        self.verification = Some(task.spawn());
    }

    async fn verify_range_state(
        &mut self,
        from: u32,
        to: u32,
        verify_state: bool,
    ) -> Result<State> {
        let range = LedgerRange::new(from, to)?;

        self.session.begin().await?;
        let result = self.build_for_verification(from).await;
        self.rollback_on_error(result).await?;
        self.progress.mark_ingested(from, CURRENT_INGEST_VERSION, 0);

        if to > from {
            let replay = LedgerRange::new(from + 1, to)?;
            self.source
                .prepare_range(replay)
                .await
                .map_err(|err| ledger_fetch_error(replay.start(), err))?;

            let policy = WaitPolicy::from_config(&self.config);
            for sequence in replay.iter() {
                let ledger =
                    wait_for_ledger(self.source.as_ref(), sequence, policy, &self.shutdown).await?;

                self.session.begin().await?;
                let result = self.apply_ledger(&ledger, sequence - 1, 0).await;
                match self.rollback_on_error(result).await? {
                    Tick::Applied(stats) => {
                        self.telemetry
                            .record_ledger(stats.transactions, stats.filtered);
                        self.progress
                            .mark_ingested(sequence, CURRENT_INGEST_VERSION, 1);
                    }
                    Tick::Advanced { .. } | Tick::Restart => {
                        bail!("cursor changed concurrently while verifying range {range}")
                    }
                }
            }
        }

        tracing::info!(range = %range, "range replayed");

        if verify_state {
            self.verify_state_now(to).await?;
        }
        Ok(State::Stop)
    }

    async fn build_for_verification(&mut self, from: u32) -> Result<()> {
        let cursor = self.session.get_last_ledger_ingest().await?;
        if cursor != 0 {
            return Err(IngestError::DatabaseNotEmpty { cursor }.into());
        }

        self.session.truncate_state().await?;
        self.runner
            .run_history_archive_ingestion(self.session.as_mut(), from)
            .await?;
        self.session.update_last_ledger_ingest(from).await?;
        self.session
            .update_ingest_version(CURRENT_INGEST_VERSION)
            .await?;
        self.session.commit().await
    }

    /// Synchronous verification; a mismatch is an error here.
    async fn verify_state_now(&mut self, checkpoint: u32) -> Result<()> {
        if !is_checkpoint(checkpoint, self.config.checkpoint_frequency()) {
            tracing::warn!(
                ledger = checkpoint,
                "ledger is not a checkpoint; skipping state verification"
            );
            return Ok(());
        }

        self.session.begin().await?;
        let result = self.verify_in_tx(checkpoint).await;
        let verification = self.rollback_on_error(result).await?;
        self.session.rollback().await?;

        match verification {
            Verification::Matched { entries } => {
                self.telemetry.record_verification(true);
                tracing::info!(ledger = checkpoint, entries, "state verification succeeded");
                Ok(())
            }
            Verification::Mismatch { reason } => {
                self.telemetry.record_verification(false);
                self.session.update_state_invalid(true).await?;
                bail!("state verification failed at ledger {checkpoint}: {reason}")
            }
        }
    }

    async fn verify_in_tx(&mut self, checkpoint: u32) -> Result<Verification> {
        if !self.session.try_state_verification_lock().await? {
            return Err(IngestError::AlreadyRunning)
                .context("another instance is verifying state");
        }
        self.verifier.verify(self.session.as_mut(), checkpoint).await
    }

    async fn reingest_history_range(
        &mut self,
        range: LedgerRange,
        force: bool,
        rebuild_aggregates: bool,
    ) -> Result<State> {
        if !force {
            let cursor = self.session.get_last_ledger_ingest_non_blocking().await?;
            check_range_conflict(range, cursor)?;
        }

        let started = Instant::now();
        self.session.begin().await?;
        let result = self.reingest_in_tx(range, force, rebuild_aggregates).await;
        let stats = self.rollback_on_error(result).await?;

        self.telemetry
            .record_reingested(stats.ledgers, stats.transactions, stats.filtered);
        tracing::info!(
            range = %range,
            ledgers = stats.ledgers,
            transactions = stats.transactions,
            filtered = stats.filtered,
            flushes = stats.flushes,
            forced = force,
            duration_ms = started.elapsed().as_millis() as u64,
            "reingested range"
        );
        Ok(State::Stop)
    }

    async fn reingest_in_tx(
        &mut self,
        range: LedgerRange,
        force: bool,
        rebuild_aggregates: bool,
    ) -> Result<RunStats> {
        if force {
            // Held until commit; live ingestion waits on the same row.
            let cursor = self.session.get_last_ledger_ingest().await?;
            tracing::debug!(range = %range, cursor, "holding cursor lock for forced reingestion");
        }

        self.session.delete_history_range(range).await?;
        let stats = self
            .runner
            .run_transaction_processors_on_ledgers(self.session.as_mut(), range, &self.shutdown)
            .await?;

        if rebuild_aggregates {
            match &self.aggregates {
                Some(aggregates) => aggregates
                    .rebuild(self.session.as_mut(), range)
                    .await
                    .with_context(|| format!("error rebuilding {}", aggregates.name()))?,
                None => tracing::debug!("no derived aggregates registered; skipping rebuild"),
            }
        }

        self.session
            .commit()
            .await
            .with_context(|| format!("error committing reingested range {range}"))?;
        Ok(stats)
    }
}
