use crate::ledger::{EntryType, LedgerEntry, LedgerRange};
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub type StorageFuture<'a, T> = BoxFuture<'a, Result<T>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Connectivity or contention problem; the operation may succeed if retried.
    Transient(String),
    Cancelled,
    NoTransaction,
    TransactionInProgress,
    DuplicateRow { table: String, key: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Transient(reason) => write!(f, "transient storage error: {reason}"),
            StorageError::Cancelled => write!(f, "storage operation cancelled"),
            StorageError::NoTransaction => write!(f, "no transaction in progress"),
            StorageError::TransactionInProgress => write!(f, "transaction already in progress"),
            StorageError::DuplicateRow { table, key } => {
                write!(f, "duplicate key {key} in {table}")
            }
        }
    }
}

impl std::error::Error for StorageError {}

/// Returns true when any error in the chain is a transient storage failure.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<StorageError>(),
            Some(StorageError::Transient(_))
        )
    })
}

/// Row in an append-only history table. `key` is unique per table and derived
/// from ledger data only, so reprocessing a ledger yields the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub ledger: u32,
    pub key: String,
    pub data: serde_json::Value,
}

impl HistoryRow {
    pub fn new(ledger: u32, key: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            ledger,
            key: key.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateWrite {
    Upsert(LedgerEntry),
    Remove { entry_type: EntryType, key: String },
}

/// One database session. A session runs at most one transaction at a time;
/// every write except lookup-table inserts is invisible to other sessions
/// until [`Session::commit`].
pub trait Session: Send {
    fn begin(&mut self) -> StorageFuture<'_, ()>;

    /// Read-only transaction whose reads all observe the database as it was
    /// committed when this call returned, whatever other sessions commit
    /// afterwards.
    fn begin_snapshot(&mut self) -> StorageFuture<'_, ()>;

    fn commit(&mut self) -> StorageFuture<'_, ()>;

    /// Discards staged writes. Rolling back without a transaction is a no-op.
    fn rollback(&mut self) -> StorageFuture<'_, ()>;

    fn in_transaction(&self) -> bool;

    /// Independent session on the same database.
    fn clone_session(&self) -> Box<dyn Session>;

    /// Reads the cursor. Inside a transaction this also takes the cursor row
    /// lock until commit/rollback, serialising with other writers.
    fn get_last_ledger_ingest(&mut self) -> StorageFuture<'_, u32>;

    fn get_last_ledger_ingest_non_blocking(&mut self) -> StorageFuture<'_, u32>;

    fn update_last_ledger_ingest(&mut self, sequence: u32) -> StorageFuture<'_, ()>;

    fn get_ingest_version(&mut self) -> StorageFuture<'_, u32>;

    fn update_ingest_version(&mut self, version: u32) -> StorageFuture<'_, ()>;

    fn get_state_invalid(&mut self) -> StorageFuture<'_, bool>;

    fn update_state_invalid(&mut self, invalid: bool) -> StorageFuture<'_, ()>;

    /// Advisory lock held until the current transaction ends. Returns false
    /// when another session holds it.
    fn try_state_verification_lock(&mut self) -> StorageFuture<'_, bool>;

    /// Insert-or-ignore; returns how many keys were new.
    fn insert_lookup_keys<'a>(
        &'a mut self,
        table: &'a str,
        keys: &'a [String],
    ) -> StorageFuture<'a, u64>;

    fn lookup_ids<'a>(
        &'a mut self,
        table: &'a str,
        keys: &'a [String],
    ) -> StorageFuture<'a, HashMap<String, i64>>;

    /// Fails with [`StorageError::DuplicateRow`] on a repeated key.
    fn insert_history_rows<'a>(
        &'a mut self,
        table: &'a str,
        rows: Vec<HistoryRow>,
    ) -> StorageFuture<'a, ()>;

    fn upsert_history_rows<'a>(
        &'a mut self,
        table: &'a str,
        rows: Vec<HistoryRow>,
    ) -> StorageFuture<'a, ()>;

    /// Rows whose ledger falls in `range`, ordered by key.
    fn history_rows<'a>(
        &'a mut self,
        table: &'a str,
        range: LedgerRange,
    ) -> StorageFuture<'a, Vec<HistoryRow>>;

    /// Deletes rows of every history table whose ledger falls in `range`.
    fn delete_history_range(&mut self, range: LedgerRange) -> StorageFuture<'_, ()>;

    fn write_state_entries(&mut self, writes: Vec<StateWrite>) -> StorageFuture<'_, ()>;

    fn truncate_state(&mut self) -> StorageFuture<'_, ()>;

    /// All state entries ordered by type and key.
    fn state_entries(&mut self) -> StorageFuture<'_, Vec<LedgerEntry>>;
}
