use std::sync::Arc;

use ledger_ingest::ledger::{
    EntryType, LedgerEntry, LedgerHeader, LedgerTransaction, Operation,
};
use ledger_ingest::processors::{
    LEDGERS_TABLE, PARTICIPANTS_TABLE, TRANSACTIONS_TABLE,
};
use ledger_ingest::storage::HistoryRow;
use ledger_ingest::{
    Change, DefaultProcessorSet, IngestConfig, LedgerCloseMeta, MemoryHistoryArchive,
    MemoryLedgerSource, MemoryStore, System, SystemParams,
};
use serde_json::json;

/// Checkpoints are 2, 5, 8, 11, ...
pub const CHECKPOINT_FREQUENCY: u32 = 3;

/// Transactions in every fixture ledger.
pub const TRANSACTIONS_PER_LEDGER: usize = 2;

pub const HISTORY_TABLES: [&str; 3] = [LEDGERS_TABLE, TRANSACTIONS_TABLE, PARTICIPANTS_TABLE];

pub fn account(n: u32) -> String {
    format!("GACCOUNT{n:04}")
}

/// Ledger `n` creates account `n`; nothing else touches state.
pub fn account_entry(n: u32) -> LedgerEntry {
    LedgerEntry::new(
        EntryType::Account,
        account(n),
        n,
        json!({ "balance": n as i64 * 100 }),
    )
}

/// Two transactions per ledger: a successful payment between neighbouring
/// accounts and a failed fee bump from account 1.
pub fn ledger(sequence: u32) -> LedgerCloseMeta {
    let payment = LedgerTransaction {
        index: 1,
        hash: format!("tx-{sequence}-1"),
        source_account: account(sequence),
        fee_charged: 100,
        successful: true,
        operations: vec![Operation::new("payment").with_participant(account(sequence + 1))],
    };
    let bump = LedgerTransaction {
        index: 2,
        hash: format!("tx-{sequence}-2"),
        source_account: account(1),
        fee_charged: 200,
        successful: false,
        operations: vec![
            Operation::new("bump_sequence"),
            Operation::new("manage_data").with_source(account(2)),
        ],
    };
    LedgerCloseMeta::new(
        LedgerHeader::new(sequence, 1_700_000_000 + sequence as u64 * 5),
        vec![payment, bump],
        vec![Change::created(account_entry(sequence))],
    )
    .expect("fixture transactions have unique indexes")
}

/// Shared database, source and archive for any number of [`System`]s.
#[derive(Clone)]
pub struct Chain {
    pub store: MemoryStore,
    pub source: MemoryLedgerSource,
    pub archive: MemoryHistoryArchive,
}

impl Chain {
    /// Publishes ledgers `1..=published` and archive snapshots for every
    /// checkpoint among them.
    pub fn new(published: u32) -> Self {
        let chain = Self {
            store: MemoryStore::new(),
            source: MemoryLedgerSource::with_ledgers((1..=published).map(ledger)),
            archive: MemoryHistoryArchive::new(),
        };
        for sequence in 1..=published {
            if (sequence + 1) % CHECKPOINT_FREQUENCY == 0 {
                chain
                    .archive
                    .set_checkpoint_state(sequence, expected_state(sequence));
            }
        }
        chain
    }

    pub fn system(&self, config: IngestConfig) -> System {
        let processors = Arc::new(DefaultProcessorSet::new(&config));
        System::new(SystemParams {
            config,
            source: Arc::new(self.source.clone()),
            archive: Arc::new(self.archive.clone()),
            session: Box::new(self.store.session()),
            processors,
        })
    }

    pub fn history(&self) -> Vec<Vec<HistoryRow>> {
        HISTORY_TABLES
            .iter()
            .map(|table| self.store.history_rows(table))
            .collect()
    }
}

/// Entry state after applying ledgers `1..=through`.
pub fn expected_state(through: u32) -> Vec<LedgerEntry> {
    (1..=through).map(account_entry).collect()
}
