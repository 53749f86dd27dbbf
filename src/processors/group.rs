//! Composite processors. Members run in registration order; the first
//! member error aborts the call and is wrapped with the member's name.
//!
//! Durations are keyed by member name, so two members sharing a name share
//! one accumulator.

use super::{
    ChangeProcessor, ProcessorFuture, StatsReset, TransactionFilterer, TransactionProcessor,
};
use crate::ledger::{Change, LedgerCloseMeta, LedgerTransaction};
use crate::loader::{Loader, LoaderStats};
use crate::storage::Session;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Most recent per-member durations and loader statistics of one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorTimings {
    pub change_processors: BTreeMap<String, Duration>,
    pub processors: BTreeMap<String, Duration>,
    pub loaders: BTreeMap<String, Duration>,
    pub loader_stats: BTreeMap<String, LoaderStats>,
    pub filterers: BTreeMap<String, Duration>,
    pub transactions_dropped: u64,
}

fn add_duration(durations: &mut HashMap<String, Duration>, name: String, elapsed: Duration) {
    *durations.entry(name).or_default() += elapsed;
}

fn merge_durations(target: &mut BTreeMap<String, Duration>, source: &HashMap<String, Duration>) {
    for (name, elapsed) in source {
        *target.entry(name.clone()).or_default() += *elapsed;
    }
}

pub struct GroupChangeProcessor {
    processors: Vec<Box<dyn ChangeProcessor>>,
    durations: HashMap<String, Duration>,
}

impl GroupChangeProcessor {
    pub fn new(processors: Vec<Box<dyn ChangeProcessor>>) -> Self {
        Self {
            processors,
            durations: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn durations(&self) -> &HashMap<String, Duration> {
        &self.durations
    }

    pub fn reset_stats(&mut self) {
        self.durations.clear();
    }
}

impl ChangeProcessor for GroupChangeProcessor {
    fn name(&self) -> &str {
        "GroupChangeProcessor"
    }

    fn process_change<'a>(
        &'a mut self,
        session: &'a mut dyn Session,
        change: &'a Change,
    ) -> ProcessorFuture<'a> {
        Box::pin(async move {
            for processor in self.processors.iter_mut() {
                let name = processor.name().to_string();
                let started = Instant::now();
                processor
                    .process_change(session, change)
                    .await
                    .with_context(|| format!("error in {name}.process_change"))?;
                add_duration(&mut self.durations, name, started.elapsed());
            }
            Ok(())
        })
    }

    fn commit<'a>(&'a mut self, session: &'a mut dyn Session) -> ProcessorFuture<'a> {
        Box::pin(async move {
            for processor in self.processors.iter_mut() {
                let name = processor.name().to_string();
                let started = Instant::now();
                processor
                    .commit(session)
                    .await
                    .with_context(|| format!("error in {name}.commit"))?;
                add_duration(&mut self.durations, name, started.elapsed());
            }
            Ok(())
        })
    }
}

/// Transaction processors plus the loaders they register keys with.
///
/// `flush` is two-phase: every loader resolves its keys first, then every
/// processor writes its buffer. Processors may therefore call
/// [`Loader::get_now`] or [`crate::loader::FutureId::value`] while flushing.
pub struct GroupTransactionProcessor {
    processors: Vec<Box<dyn TransactionProcessor>>,
    loaders: Vec<Loader>,
    stats_handles: Vec<Arc<dyn StatsReset>>,
    processor_durations: HashMap<String, Duration>,
    loader_durations: HashMap<String, Duration>,
    loader_stats: HashMap<String, LoaderStats>,
}

impl GroupTransactionProcessor {
    pub fn new(processors: Vec<Box<dyn TransactionProcessor>>, loaders: Vec<Loader>) -> Self {
        Self {
            processors,
            loaders,
            stats_handles: Vec::new(),
            processor_durations: HashMap::new(),
            loader_durations: HashMap::new(),
            loader_stats: HashMap::new(),
        }
    }

    /// Registers a handle that [`GroupTransactionProcessor::reset_stats`]
    /// forwards to.
    pub fn with_stats_handle(mut self, handle: Arc<dyn StatsReset>) -> Self {
        self.stats_handles.push(handle);
        self
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn processor_durations(&self) -> &HashMap<String, Duration> {
        &self.processor_durations
    }

    pub fn loader_durations(&self) -> &HashMap<String, Duration> {
        &self.loader_durations
    }

    pub fn loader_stats(&self) -> &HashMap<String, LoaderStats> {
        &self.loader_stats
    }

    pub fn reset_stats(&mut self) {
        self.processor_durations.clear();
        self.loader_durations.clear();
        self.loader_stats.clear();
        for handle in &self.stats_handles {
            handle.reset_stats();
        }
    }
}

impl TransactionProcessor for GroupTransactionProcessor {
    fn name(&self) -> &str {
        "GroupTransactionProcessor"
    }

    fn process_ledger(&mut self, ledger: &LedgerCloseMeta) -> Result<()> {
        for processor in self.processors.iter_mut() {
            let name = processor.name().to_string();
            let started = Instant::now();
            processor
                .process_ledger(ledger)
                .with_context(|| format!("error in {name}.process_ledger"))?;
            add_duration(&mut self.processor_durations, name, started.elapsed());
        }
        Ok(())
    }

    fn process_transaction(
        &mut self,
        ledger: &LedgerCloseMeta,
        transaction: &LedgerTransaction,
    ) -> Result<()> {
        for processor in self.processors.iter_mut() {
            let name = processor.name().to_string();
            let started = Instant::now();
            processor
                .process_transaction(ledger, transaction)
                .with_context(|| format!("error in {name}.process_transaction"))?;
            add_duration(&mut self.processor_durations, name, started.elapsed());
        }
        Ok(())
    }

    fn flush<'a>(&'a mut self, session: &'a mut dyn Session) -> ProcessorFuture<'a> {
        Box::pin(async move {
            for loader in &self.loaders {
                let name = loader.name();
                let started = Instant::now();
                let stats = loader
                    .exec(session)
                    .await
                    .with_context(|| format!("error during lazy loader resolution, {name}.exec"))?;
                add_duration(&mut self.loader_durations, name.to_string(), started.elapsed());
                let total = self.loader_stats.entry(name.to_string()).or_default();
                total.total += stats.total;
                total.inserted += stats.inserted;
            }

            for processor in self.processors.iter_mut() {
                let name = processor.name().to_string();
                let started = Instant::now();
                processor
                    .flush(session)
                    .await
                    .with_context(|| format!("error in {name}.flush"))?;
                add_duration(&mut self.processor_durations, name, started.elapsed());
            }
            Ok(())
        })
    }

    fn buffered_rows(&self) -> usize {
        self.processors
            .iter()
            .map(|processor| processor.buffered_rows())
            .sum()
    }
}

/// AND over the member filterers, short-circuiting on the first rejection.
pub struct GroupTransactionFilterer {
    filterers: Vec<Box<dyn TransactionFilterer>>,
    durations: HashMap<String, Duration>,
    dropped: u64,
}

impl GroupTransactionFilterer {
    pub fn new(filterers: Vec<Box<dyn TransactionFilterer>>) -> Self {
        Self {
            filterers,
            durations: HashMap::new(),
            dropped: 0,
        }
    }

    /// Includes everything.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn filter_transaction(
        &mut self,
        ledger: &LedgerCloseMeta,
        transaction: &LedgerTransaction,
    ) -> Result<bool> {
        for filterer in &self.filterers {
            let name = filterer.name();
            let started = Instant::now();
            let include = filterer
                .filter_transaction(ledger, transaction)
                .with_context(|| format!("error in {name}.filter_transaction"))?;
            add_duration(&mut self.durations, name.to_string(), started.elapsed());
            if !include {
                self.dropped += 1;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Transactions rejected since the last reset.
    pub fn dropped_transactions(&self) -> u64 {
        self.dropped
    }

    pub fn durations(&self) -> &HashMap<String, Duration> {
        &self.durations
    }

    pub fn reset_stats(&mut self) {
        self.durations.clear();
        self.dropped = 0;
    }
}

/// Per-ledger outcome of routing transactions through a pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerTally {
    pub included: u64,
    pub filtered: u64,
}

impl LedgerTally {
    pub fn add(&mut self, other: LedgerTally) {
        self.included += other.included;
        self.filtered += other.filtered;
    }
}

/// Filterers routing each transaction into either the full processor lane
/// or the lightweight lane for rejected transactions.
pub struct TransactionPipeline {
    filterers: GroupTransactionFilterer,
    included: GroupTransactionProcessor,
    filtered: GroupTransactionProcessor,
}

impl TransactionPipeline {
    pub fn new(
        filterers: GroupTransactionFilterer,
        included: GroupTransactionProcessor,
        filtered: GroupTransactionProcessor,
    ) -> Self {
        Self {
            filterers,
            included,
            filtered,
        }
    }

    pub fn process_ledger(&mut self, ledger: &LedgerCloseMeta) -> Result<LedgerTally> {
        self.included.process_ledger(ledger)?;
        self.filtered.process_ledger(ledger)?;

        let mut tally = LedgerTally::default();
        for transaction in ledger.transactions() {
            if self.filterers.filter_transaction(ledger, transaction)? {
                self.included.process_transaction(ledger, transaction)?;
                tally.included += 1;
            } else {
                tracing::debug!(
                    ledger = ledger.sequence(),
                    transaction = %transaction.hash,
                    "transaction filtered out"
                );
                self.filtered.process_transaction(ledger, transaction)?;
                tally.filtered += 1;
            }
        }
        Ok(tally)
    }

    pub async fn flush(&mut self, session: &mut dyn Session) -> Result<()> {
        self.included.flush(session).await?;
        self.filtered
            .flush(session)
            .await
            .context("error flushing filtered transaction lane")
    }

    pub fn buffered_rows(&self) -> usize {
        self.included.buffered_rows() + self.filtered.buffered_rows()
    }

    pub fn timings(&self) -> ProcessorTimings {
        let mut timings = ProcessorTimings::default();
        for group in [&self.included, &self.filtered] {
            merge_durations(&mut timings.processors, group.processor_durations());
            merge_durations(&mut timings.loaders, group.loader_durations());
            for (name, stats) in group.loader_stats() {
                let total = timings.loader_stats.entry(name.clone()).or_default();
                total.total += stats.total;
                total.inserted += stats.inserted;
            }
        }
        merge_durations(&mut timings.filterers, self.filterers.durations());
        timings.transactions_dropped = self.filterers.dropped_transactions();
        timings
    }

    pub fn reset_stats(&mut self) {
        self.filterers.reset_stats();
        self.included.reset_stats();
        self.filtered.reset_stats();
    }
}

impl ProcessorTimings {
    pub fn with_change_durations(mut self, group: &GroupChangeProcessor) -> Self {
        merge_durations(&mut self.change_processors, group.durations());
        self
    }
}
