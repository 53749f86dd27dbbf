//! Processor contracts, their group composites, and the processors bundled
//! with the default pipeline.

pub mod filters;
pub mod group;
pub mod history;
pub mod set;
pub mod state;

use crate::ledger::{Change, LedgerCloseMeta, LedgerTransaction};
use crate::storage::Session;
use anyhow::Result;
use futures::future::BoxFuture;

pub use filters::AccountFilterer;
pub use group::{
    GroupChangeProcessor, GroupTransactionFilterer, GroupTransactionProcessor, LedgerTally,
    ProcessorTimings, TransactionPipeline,
};
pub use history::{
    toid, FilteredTransactionsProcessor, LedgersProcessor, ParticipantsProcessor,
    StatsLedgerTransactionProcessor, TransactionStats, TransactionStatsSnapshot,
    TransactionsProcessor, FILTERED_TRANSACTIONS_TABLE, LEDGERS_TABLE, PARTICIPANTS_TABLE,
    TRANSACTIONS_TABLE,
};
pub use set::{DefaultProcessorSet, ProcessorSet};
pub use state::{ChangeStats, EntriesChangeProcessor, StatsChangeProcessor};

pub type ProcessorFuture<'a> = BoxFuture<'a, Result<()>>;

/// Consumes entry-level changes in ledger order.
pub trait ChangeProcessor: Send {
    fn name(&self) -> &str;

    fn process_change<'a>(
        &'a mut self,
        session: &'a mut dyn Session,
        change: &'a Change,
    ) -> ProcessorFuture<'a>;

    /// Finalises one logical unit: a ledger, or a whole checkpoint during a
    /// state build.
    fn commit<'a>(&'a mut self, session: &'a mut dyn Session) -> ProcessorFuture<'a>;
}

/// Buffers rows derived from transactions and bulk-writes them on flush.
pub trait TransactionProcessor: Send {
    fn name(&self) -> &str;

    /// Called once per ledger before its transactions, whether or not any of
    /// them survive filtering.
    fn process_ledger(&mut self, _ledger: &LedgerCloseMeta) -> Result<()> {
        Ok(())
    }

    /// Buffers only; must not perform I/O.
    fn process_transaction(
        &mut self,
        ledger: &LedgerCloseMeta,
        transaction: &LedgerTransaction,
    ) -> Result<()>;

    /// Writes and clears the buffer. Loaders registered with the owning
    /// group are resolved before this is called.
    fn flush<'a>(&'a mut self, session: &'a mut dyn Session) -> ProcessorFuture<'a>;

    fn buffered_rows(&self) -> usize {
        0
    }
}

/// Pure inclusion predicate over transactions.
pub trait TransactionFilterer: Send {
    fn name(&self) -> &str;

    fn filter_transaction(
        &self,
        ledger: &LedgerCloseMeta,
        transaction: &LedgerTransaction,
    ) -> Result<bool>;
}

/// Handle to processor statistics that outlive a single flush.
pub trait StatsReset: Send + Sync {
    fn reset_stats(&self);
}
