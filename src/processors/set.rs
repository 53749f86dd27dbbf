use super::{
    AccountFilterer, ChangeProcessor, ChangeStats, EntriesChangeProcessor,
    FilteredTransactionsProcessor, GroupChangeProcessor, GroupTransactionFilterer,
    GroupTransactionProcessor, LedgersProcessor, ParticipantsProcessor,
    StatsChangeProcessor, StatsLedgerTransactionProcessor, TransactionFilterer,
    TransactionPipeline, TransactionProcessor, TransactionStats, TransactionsProcessor,
};
use crate::loader::{Loader, LoaderTable};
use crate::runtime::config::{IngestConfig, CURRENT_INGEST_VERSION};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Registration point for the processors driven by the pipeline.
///
/// Both methods must return fresh instances: loaders are single-use, so a
/// new pipeline is built for every flush cycle.
pub trait ProcessorSet: Send + Sync {
    fn change_processors(&self) -> GroupChangeProcessor;

    fn transaction_pipeline(&self) -> TransactionPipeline;
}

/// Wires the bundled processors.
#[derive(Clone)]
pub struct DefaultProcessorSet {
    ingest_version: u32,
    max_buffered_rows: usize,
    enable_filtering: bool,
    allowed_accounts: BTreeSet<String>,
    transaction_stats: Arc<TransactionStats>,
    change_stats: Arc<ChangeStats>,
}

impl DefaultProcessorSet {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            ingest_version: CURRENT_INGEST_VERSION,
            max_buffered_rows: config.max_buffered_rows(),
            enable_filtering: config.enable_filtering(),
            allowed_accounts: BTreeSet::new(),
            transaction_stats: Arc::default(),
            change_stats: Arc::default(),
        }
    }

    /// Accounts kept by the account filterer when filtering is enabled.
    pub fn with_allowed_accounts(
        mut self,
        accounts: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.allowed_accounts = accounts.into_iter().map(Into::into).collect();
        self
    }

    /// Counters shared by every pipeline this set builds.
    pub fn transaction_stats(&self) -> Arc<TransactionStats> {
        self.transaction_stats.clone()
    }

    pub fn change_stats(&self) -> Arc<ChangeStats> {
        self.change_stats.clone()
    }
}

impl ProcessorSet for DefaultProcessorSet {
    fn change_processors(&self) -> GroupChangeProcessor {
        let processors: Vec<Box<dyn ChangeProcessor>> = vec![
            Box::new(EntriesChangeProcessor::new(self.max_buffered_rows)),
            Box::new(StatsChangeProcessor::with_stats(self.change_stats.clone())),
        ];
        GroupChangeProcessor::new(processors)
    }

    fn transaction_pipeline(&self) -> TransactionPipeline {
        let accounts = Loader::new(LoaderTable::Accounts);
        let included: Vec<Box<dyn TransactionProcessor>> = vec![
            Box::new(LedgersProcessor::new(self.ingest_version)),
            Box::new(TransactionsProcessor::new()),
            Box::new(ParticipantsProcessor::new(accounts.clone())),
            Box::new(StatsLedgerTransactionProcessor::with_stats(
                self.transaction_stats.clone(),
            )),
        ];
        let included = GroupTransactionProcessor::new(included, vec![accounts])
            .with_stats_handle(self.transaction_stats.clone());

        let filtered = GroupTransactionProcessor::new(
            vec![Box::new(FilteredTransactionsProcessor::new())],
            vec![],
        );

        let filterers: Vec<Box<dyn TransactionFilterer>> = if self.enable_filtering {
            vec![Box::new(AccountFilterer::new(self.allowed_accounts.iter().cloned()))]
        } else {
            Vec::new()
        };

        TransactionPipeline::new(GroupTransactionFilterer::new(filterers), included, filtered)
    }
}
