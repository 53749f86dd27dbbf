//! Drives a [`ProcessorSet`] over checkpoint state, single ledgers and
//! ledger ranges.

use super::watch::ledger_fetch_error;
use super::IngestError;
use crate::ledger::{Change, HistoryArchive, LedgerCloseMeta, LedgerRange, LedgerSource};
use crate::processors::{
    ChangeProcessor, GroupChangeProcessor, ProcessorSet, ProcessorTimings, TransactionPipeline,
};
use crate::runtime::config::IngestConfig;
use crate::runtime::telemetry::Telemetry;
use crate::storage::Session;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Counts produced by one runner call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub ledgers: u64,
    pub transactions: u64,
    pub filtered: u64,
    pub changes: u64,
    pub flushes: u64,
}

pub struct ProcessorRunner {
    config: Arc<IngestConfig>,
    source: Arc<dyn LedgerSource>,
    archive: Arc<dyn HistoryArchive>,
    processors: Arc<dyn ProcessorSet>,
    telemetry: Arc<Telemetry>,
}

impl ProcessorRunner {
    pub fn new(
        config: Arc<IngestConfig>,
        source: Arc<dyn LedgerSource>,
        archive: Arc<dyn HistoryArchive>,
        processors: Arc<dyn ProcessorSet>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            config,
            source,
            archive,
            processors,
            telemetry,
        }
    }

    /// Streams the full entry state at `checkpoint` through the change
    /// processors. The caller owns the transaction.
    pub async fn run_history_archive_ingestion(
        &self,
        session: &mut dyn Session,
        checkpoint: u32,
    ) -> Result<RunStats> {
        let started = Instant::now();
        let changes = self
            .archive
            .get_checkpoint_state(checkpoint)
            .await
            .with_context(|| format!("error reading checkpoint {checkpoint} from the archive"))?;

        let mut group = self.processors.change_processors();
        apply_changes(&mut group, session, &changes).await?;

        self.telemetry
            .record_processor_timings(ProcessorTimings::default().with_change_durations(&group));

        tracing::info!(
            checkpoint,
            entries = changes.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "processed checkpoint state"
        );

        Ok(RunStats {
            changes: changes.len() as u64,
            ..RunStats::default()
        })
    }

    /// Applies one ledger: transactions through the pipeline, then its entry
    /// changes. The caller owns the transaction.
    pub async fn run_all_processors_on_ledger(
        &self,
        session: &mut dyn Session,
        ledger: &LedgerCloseMeta,
    ) -> Result<RunStats> {
        let mut pipeline = self.processors.transaction_pipeline();
        // Shared counters describe the ledger being applied.
        pipeline.reset_stats();
        let tally = pipeline.process_ledger(ledger)?;
        pipeline.flush(session).await?;

        let mut group = self.processors.change_processors();
        apply_changes(&mut group, session, ledger.changes()).await?;

        self.telemetry
            .record_processor_timings(pipeline.timings().with_change_durations(&group));

        Ok(RunStats {
            ledgers: 1,
            transactions: tally.included,
            filtered: tally.filtered,
            changes: ledger.changes().len() as u64,
            flushes: 1,
        })
    }

    /// State-only replay, for ledgers whose history rows are already present.
    pub async fn run_change_processors_on_ledger(
        &self,
        session: &mut dyn Session,
        ledger: &LedgerCloseMeta,
    ) -> Result<RunStats> {
        let mut group = self.processors.change_processors();
        apply_changes(&mut group, session, ledger.changes()).await?;

        self.telemetry
            .record_processor_timings(ProcessorTimings::default().with_change_durations(&group));

        Ok(RunStats {
            ledgers: 1,
            changes: ledger.changes().len() as u64,
            ..RunStats::default()
        })
    }

    /// History-only pass over `range`, flushing every `max_ledgers_per_flush`
    /// ledgers or once buffered rows reach `max_buffered_rows`. The caller
    /// owns the transaction.
    pub async fn run_transaction_processors_on_ledgers(
        &self,
        session: &mut dyn Session,
        range: LedgerRange,
        token: &CancellationToken,
    ) -> Result<RunStats> {
        self.source
            .prepare_range(range)
            .await
            .map_err(|err| ledger_fetch_error(range.start(), err))
            .with_context(|| format!("error preparing range {range}"))?;

        let max_ledgers = self.config.max_ledgers_per_flush();
        let max_rows = self.config.max_buffered_rows();

        let mut stats = RunStats::default();
        let mut pipeline = self.processors.transaction_pipeline();
        // Shared counters accumulate across this range's flushes only.
        pipeline.reset_stats();
        let mut pending = 0u32;

        for sequence in range.iter() {
            if token.is_cancelled() {
                return Err(IngestError::Cancelled.into());
            }

            let ledger = self
                .source
                .get_ledger(sequence)
                .await
                .map_err(|err| ledger_fetch_error(sequence, err))?;

            let tally = pipeline.process_ledger(&ledger)?;
            stats.ledgers += 1;
            stats.transactions += tally.included;
            stats.filtered += tally.filtered;
            pending += 1;

            if pending >= max_ledgers || pipeline.buffered_rows() >= max_rows {
                tracing::debug!(
                    range = %range,
                    through = sequence,
                    ledgers = pending,
                    rows = pipeline.buffered_rows(),
                    "flushing transaction processors"
                );
                self.flush(session, &mut pipeline).await?;
                stats.flushes += 1;
                pipeline = self.processors.transaction_pipeline();
                pending = 0;
            }
        }

        if pending > 0 {
            self.flush(session, &mut pipeline).await?;
            stats.flushes += 1;
        }

        Ok(stats)
    }

    async fn flush(
        &self,
        session: &mut dyn Session,
        pipeline: &mut TransactionPipeline,
    ) -> Result<()> {
        pipeline.flush(session).await?;
        self.telemetry.record_processor_timings(pipeline.timings());
        Ok(())
    }
}

async fn apply_changes(
    group: &mut GroupChangeProcessor,
    session: &mut dyn Session,
    changes: &[Change],
) -> Result<()> {
    for change in changes {
        group.process_change(session, change).await?;
    }
    group.commit(session).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{
        EntryType, LedgerEntry, LedgerHeader, LedgerTransaction, MemoryHistoryArchive,
        MemoryLedgerSource, Operation,
    };
    use crate::processors::{DefaultProcessorSet, LEDGERS_TABLE, TRANSACTIONS_TABLE};
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn entry(key: &str, balance: i64, ledger: u32) -> LedgerEntry {
        LedgerEntry::new(EntryType::Account, key, ledger, json!({ "balance": balance }))
    }

    fn ledger(sequence: u32, transactions: u32) -> LedgerCloseMeta {
        let transactions = (1..=transactions)
            .map(|index| LedgerTransaction {
                index,
                hash: format!("tx-{sequence}-{index}"),
                source_account: format!("G{index}"),
                fee_charged: 100,
                successful: true,
                operations: vec![Operation::new("payment").with_participant("GDEST")],
            })
            .collect();
        let changes = vec![Change::created(entry(&format!("acct-{sequence}"), 1, sequence))];
        LedgerCloseMeta::new(LedgerHeader::new(sequence, 0), transactions, changes)
            .expect("test transactions have unique indexes")
    }

    fn runner(
        config: IngestConfig,
        source: MemoryLedgerSource,
        archive: MemoryHistoryArchive,
    ) -> (ProcessorRunner, Arc<Telemetry>) {
        let telemetry = Arc::new(Telemetry::default());
        let processors = Arc::new(DefaultProcessorSet::new(&config));
        let runner = ProcessorRunner::new(
            Arc::new(config),
            Arc::new(source),
            Arc::new(archive),
            processors,
            telemetry.clone(),
        );
        (runner, telemetry)
    }

    #[tokio::test]
    async fn archive_ingestion_loads_checkpoint_state() -> Result<()> {
        let archive = MemoryHistoryArchive::new();
        archive.set_checkpoint_state(63, vec![entry("a", 1, 60), entry("b", 2, 61)]);
        let (runner, telemetry) = runner(
            IngestConfig::builder().build()?,
            MemoryLedgerSource::new(),
            archive,
        );

        let store = MemoryStore::new();
        let mut session = store.session();
        session.begin().await?;
        let stats = runner.run_history_archive_ingestion(&mut session, 63).await?;
        session.commit().await?;

        assert_eq!(stats.changes, 2);
        assert_eq!(store.state_entries().len(), 2);
        assert!(telemetry
            .processor_timings()
            .change_processors
            .contains_key("EntriesChangeProcessor"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_checkpoint_is_reported() -> Result<()> {
        let (runner, _) = runner(
            IngestConfig::builder().build()?,
            MemoryLedgerSource::new(),
            MemoryHistoryArchive::new(),
        );
        let store = MemoryStore::new();
        let mut session = store.session();
        let err = runner
            .run_history_archive_ingestion(&mut session, 127)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "error reading checkpoint 127 from the archive");
        Ok(())
    }

    #[tokio::test]
    async fn single_ledger_writes_history_and_state() -> Result<()> {
        let (runner, _) = runner(
            IngestConfig::builder().build()?,
            MemoryLedgerSource::new(),
            MemoryHistoryArchive::new(),
        );
        let store = MemoryStore::new();
        let mut session = store.session();
        session.begin().await?;
        let stats = runner
            .run_all_processors_on_ledger(&mut session, &ledger(5, 2))
            .await?;
        session.commit().await?;

        assert_eq!(stats.ledgers, 1);
        assert_eq!(stats.transactions, 2);
        assert_eq!(stats.changes, 1);
        assert_eq!(store.history_rows(LEDGERS_TABLE).len(), 1);
        assert_eq!(store.history_rows(TRANSACTIONS_TABLE).len(), 2);
        assert_eq!(store.state_entries().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn range_flushes_every_max_ledgers() -> Result<()> {
        let source = MemoryLedgerSource::with_ledgers((1..=7).map(|seq| ledger(seq, 1)));
        let (runner, _) = runner(
            IngestConfig::builder().max_ledgers_per_flush(3).build()?,
            source,
            MemoryHistoryArchive::new(),
        );
        let store = MemoryStore::new();
        let mut session = store.session();
        session.begin().await?;
        let stats = runner
            .run_transaction_processors_on_ledgers(
                &mut session,
                LedgerRange::new(1, 7)?,
                &CancellationToken::new(),
            )
            .await?;
        session.commit().await?;

        assert_eq!(stats.ledgers, 7);
        assert_eq!(stats.transactions, 7);
        assert_eq!(stats.flushes, 3);
        assert_eq!(store.history_rows(LEDGERS_TABLE).len(), 7);
        // History-only pass leaves state untouched.
        assert!(store.state_entries().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn transaction_counters_restart_with_each_range() -> Result<()> {
        let config = IngestConfig::builder().max_ledgers_per_flush(2).build()?;
        let processors = DefaultProcessorSet::new(&config);
        let counters = processors.transaction_stats();
        let runner = ProcessorRunner::new(
            Arc::new(config),
            Arc::new(MemoryLedgerSource::with_ledgers(
                (1..=6).map(|seq| ledger(seq, 2)),
            )),
            Arc::new(MemoryHistoryArchive::new()),
            Arc::new(processors),
            Arc::new(Telemetry::default()),
        );
        let store = MemoryStore::new();
        let mut session = store.session();
        let token = CancellationToken::new();

        session.begin().await?;
        runner
            .run_transaction_processors_on_ledgers(&mut session, LedgerRange::new(1, 5)?, &token)
            .await?;
        assert_eq!(counters.snapshot().transactions, 10);

        runner
            .run_transaction_processors_on_ledgers(&mut session, LedgerRange::new(6, 6)?, &token)
            .await?;
        assert_eq!(counters.snapshot().transactions, 2);
        session.rollback().await?;

        session.begin().await?;
        runner
            .run_all_processors_on_ledger(&mut session, &ledger(7, 3))
            .await?;
        session.commit().await?;
        assert_eq!(counters.snapshot().transactions, 3);
        Ok(())
    }

    #[tokio::test]
    async fn buffered_rows_trigger_an_early_flush() -> Result<()> {
        let source = MemoryLedgerSource::with_ledgers((1..=4).map(|seq| ledger(seq, 3)));
        let (runner, _) = runner(
            IngestConfig::builder()
                .max_ledgers_per_flush(100)
                .max_buffered_rows(1)
                .build()?,
            source,
            MemoryHistoryArchive::new(),
        );
        let store = MemoryStore::new();
        let mut session = store.session();
        session.begin().await?;
        let stats = runner
            .run_transaction_processors_on_ledgers(
                &mut session,
                LedgerRange::new(1, 4)?,
                &CancellationToken::new(),
            )
            .await?;
        session.commit().await?;

        assert_eq!(stats.flushes, 4);
        assert_eq!(store.history_rows(TRANSACTIONS_TABLE).len(), 12);
        Ok(())
    }

    #[tokio::test]
    async fn unpublished_ledger_in_range_fails() -> Result<()> {
        let source = MemoryLedgerSource::with_ledgers((1..=2).map(|seq| ledger(seq, 1)));
        let (runner, _) = runner(
            IngestConfig::builder().build()?,
            source,
            MemoryHistoryArchive::new(),
        );
        let store = MemoryStore::new();
        let mut session = store.session();
        session.begin().await?;
        let err = runner
            .run_transaction_processors_on_ledgers(
                &mut session,
                LedgerRange::new(1, 3)?,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        session.rollback().await?;

        assert_eq!(
            err.downcast_ref::<IngestError>(),
            Some(&IngestError::LedgerNotAvailable { sequence: 3 })
        );
        assert!(store.history_rows(LEDGERS_TABLE).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_range() -> Result<()> {
        let source = MemoryLedgerSource::with_ledgers((1..=3).map(|seq| ledger(seq, 1)));
        let (runner, _) = runner(
            IngestConfig::builder().build()?,
            source,
            MemoryHistoryArchive::new(),
        );
        let token = CancellationToken::new();
        token.cancel();

        let store = MemoryStore::new();
        let mut session = store.session();
        let err = runner
            .run_transaction_processors_on_ledgers(&mut session, LedgerRange::new(1, 3)?, &token)
            .await
            .unwrap_err();
        assert!(crate::ingest::is_cancelled(&err));
        Ok(())
    }
}
