//! Transaction processors writing the append-only history tables.

use super::{ProcessorFuture, StatsReset, TransactionProcessor};
use crate::ledger::{LedgerCloseMeta, LedgerTransaction};
use crate::loader::{FutureId, Loader};
use crate::storage::{HistoryRow, Session};
use anyhow::{bail, Result};
use serde_json::json;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const LEDGERS_TABLE: &str = "history_ledgers";
pub const TRANSACTIONS_TABLE: &str = "history_transactions";
pub const PARTICIPANTS_TABLE: &str = "history_transaction_participants";
pub const FILTERED_TRANSACTIONS_TABLE: &str = "history_transactions_filtered_tmp";

const TOID_TRANSACTION_MASK: u32 = 0xF_FFFF;
const TOID_OPERATION_MASK: u32 = 0xFFF;

/// Total order ID: ledger in the high 32 bits, transaction index in the next
/// 20, operation index in the low 12. Fails when a part does not fit, since
/// the ID must stay positive and unique.
pub fn toid(ledger: u32, transaction: u32, operation: u32) -> Result<i64> {
    if ledger > i32::MAX as u32 {
        bail!("ledger {ledger} is out of range for a total order ID");
    }
    if transaction > TOID_TRANSACTION_MASK {
        bail!("transaction index {transaction} in ledger {ledger} is out of range for a total order ID");
    }
    if operation > TOID_OPERATION_MASK {
        bail!("operation index {operation} in ledger {ledger} is out of range for a total order ID");
    }
    Ok(((ledger as i64) << 32) | ((transaction as i64) << 12) | operation as i64)
}

fn row_key(id: i64) -> String {
    format!("{id:020}")
}

fn transaction_row(ledger: &LedgerCloseMeta, transaction: &LedgerTransaction) -> Result<HistoryRow> {
    let id = toid(ledger.sequence(), transaction.index, 0)?;
    Ok(HistoryRow::new(
        ledger.sequence(),
        row_key(id),
        json!({
            "id": id,
            "ledger_sequence": ledger.sequence(),
            "application_order": transaction.index,
            "transaction_hash": transaction.hash,
            "account": transaction.source_account,
            "fee_charged": transaction.fee_charged,
            "successful": transaction.successful,
            "operation_count": transaction.operation_count(),
        }),
    ))
}

async fn write_rows(session: &mut dyn Session, table: &str, rows: &mut Vec<HistoryRow>) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    session.insert_history_rows(table, mem::take(rows)).await
}

/// One `history_ledgers` row per ledger. Counts cover every transaction in
/// the ledger, including the ones rejected by filterers.
pub struct LedgersProcessor {
    ingest_version: u32,
    rows: Vec<HistoryRow>,
}

impl LedgersProcessor {
    pub fn new(ingest_version: u32) -> Self {
        Self {
            ingest_version,
            rows: Vec::new(),
        }
    }
}

impl TransactionProcessor for LedgersProcessor {
    fn name(&self) -> &str {
        "LedgersProcessor"
    }

    fn process_ledger(&mut self, ledger: &LedgerCloseMeta) -> Result<()> {
        let mut successful = 0u64;
        let mut failed = 0u64;
        let mut operations = 0u64;
        let mut tx_set_operations = 0u64;
        for transaction in ledger.transactions() {
            let count = transaction.operation_count() as u64;
            tx_set_operations += count;
            if transaction.successful {
                successful += 1;
                operations += count;
            } else {
                failed += 1;
            }
        }

        let header = ledger.header();
        let id = toid(header.sequence, 0, 0)?;
        self.rows.push(HistoryRow::new(
            header.sequence,
            row_key(id),
            json!({
                "sequence": header.sequence,
                "ledger_hash": header.hash,
                "previous_ledger_hash": header.previous_hash,
                "closed_at": header.close_time,
                "protocol_version": header.protocol_version,
                "successful_transaction_count": successful,
                "failed_transaction_count": failed,
                "operation_count": operations,
                "tx_set_operation_count": tx_set_operations,
                "importer_version": self.ingest_version,
            }),
        ));
        Ok(())
    }

    fn process_transaction(
        &mut self,
        _ledger: &LedgerCloseMeta,
        _transaction: &LedgerTransaction,
    ) -> Result<()> {
        Ok(())
    }

    fn flush<'a>(&'a mut self, session: &'a mut dyn Session) -> ProcessorFuture<'a> {
        Box::pin(async move { write_rows(session, LEDGERS_TABLE, &mut self.rows).await })
    }

    fn buffered_rows(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Default)]
pub struct TransactionsProcessor {
    rows: Vec<HistoryRow>,
}

impl TransactionsProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionProcessor for TransactionsProcessor {
    fn name(&self) -> &str {
        "TransactionsProcessor"
    }

    fn process_transaction(
        &mut self,
        ledger: &LedgerCloseMeta,
        transaction: &LedgerTransaction,
    ) -> Result<()> {
        self.rows.push(transaction_row(ledger, transaction)?);
        Ok(())
    }

    fn flush<'a>(&'a mut self, session: &'a mut dyn Session) -> ProcessorFuture<'a> {
        Box::pin(async move { write_rows(session, TRANSACTIONS_TABLE, &mut self.rows).await })
    }

    fn buffered_rows(&self) -> usize {
        self.rows.len()
    }
}

/// Lane for transactions rejected by filterers.
#[derive(Default)]
pub struct FilteredTransactionsProcessor {
    rows: Vec<HistoryRow>,
}

impl FilteredTransactionsProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionProcessor for FilteredTransactionsProcessor {
    fn name(&self) -> &str {
        "FilteredTransactionsProcessor"
    }

    fn process_transaction(
        &mut self,
        ledger: &LedgerCloseMeta,
        transaction: &LedgerTransaction,
    ) -> Result<()> {
        self.rows.push(transaction_row(ledger, transaction)?);
        Ok(())
    }

    fn flush<'a>(&'a mut self, session: &'a mut dyn Session) -> ProcessorFuture<'a> {
        Box::pin(async move {
            write_rows(session, FILTERED_TRANSACTIONS_TABLE, &mut self.rows).await
        })
    }

    fn buffered_rows(&self) -> usize {
        self.rows.len()
    }
}

struct PendingParticipant {
    ledger: u32,
    transaction_id: i64,
    account: FutureId,
}

/// Links transactions to the accounts they touch through surrogate account
/// IDs resolved by the account loader.
pub struct ParticipantsProcessor {
    accounts: Loader,
    pending: Vec<PendingParticipant>,
}

impl ParticipantsProcessor {
    pub fn new(accounts: Loader) -> Self {
        Self {
            accounts,
            pending: Vec::new(),
        }
    }
}

impl TransactionProcessor for ParticipantsProcessor {
    fn name(&self) -> &str {
        "ParticipantsProcessor"
    }

    fn process_transaction(
        &mut self,
        ledger: &LedgerCloseMeta,
        transaction: &LedgerTransaction,
    ) -> Result<()> {
        let transaction_id = toid(ledger.sequence(), transaction.index, 0)?;
        for account in transaction.participants() {
            self.pending.push(PendingParticipant {
                ledger: ledger.sequence(),
                transaction_id,
                account: self.accounts.get_future(&account),
            });
        }
        Ok(())
    }

    fn flush<'a>(&'a mut self, session: &'a mut dyn Session) -> ProcessorFuture<'a> {
        Box::pin(async move {
            let mut rows = Vec::with_capacity(self.pending.len());
            for participant in self.pending.drain(..) {
                let account_id = participant.account.value()?;
                rows.push(HistoryRow::new(
                    participant.ledger,
                    format!(
                        "{}-{}",
                        row_key(participant.transaction_id),
                        participant.account.key()
                    ),
                    json!({
                        "history_transaction_id": participant.transaction_id,
                        "history_account_id": account_id,
                    }),
                ));
            }
            write_rows(session, PARTICIPANTS_TABLE, &mut rows).await
        })
    }

    fn buffered_rows(&self) -> usize {
        self.pending.len()
    }
}

/// Counters accumulated across flushes until reset.
#[derive(Debug, Default)]
pub struct TransactionStats {
    transactions: AtomicU64,
    operations: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStatsSnapshot {
    pub transactions: u64,
    pub operations: u64,
    pub successful: u64,
    pub failed: u64,
}

impl TransactionStats {
    pub fn snapshot(&self) -> TransactionStatsSnapshot {
        TransactionStatsSnapshot {
            transactions: self.transactions.load(Ordering::Relaxed),
            operations: self.operations.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl StatsReset for TransactionStats {
    fn reset_stats(&self) {
        self.transactions.store(0, Ordering::Relaxed);
        self.operations.store(0, Ordering::Relaxed);
        self.successful.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct StatsLedgerTransactionProcessor {
    stats: Arc<TransactionStats>,
}

impl StatsLedgerTransactionProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stats(stats: Arc<TransactionStats>) -> Self {
        Self { stats }
    }

    pub fn stats_handle(&self) -> Arc<TransactionStats> {
        self.stats.clone()
    }
}

impl TransactionProcessor for StatsLedgerTransactionProcessor {
    fn name(&self) -> &str {
        "StatsLedgerTransactionProcessor"
    }

    fn process_transaction(
        &mut self,
        _ledger: &LedgerCloseMeta,
        transaction: &LedgerTransaction,
    ) -> Result<()> {
        self.stats.transactions.fetch_add(1, Ordering::Relaxed);
        self.stats
            .operations
            .fetch_add(transaction.operation_count() as u64, Ordering::Relaxed);
        if transaction.successful {
            self.stats.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn flush<'a>(&'a mut self, _session: &'a mut dyn Session) -> ProcessorFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}
