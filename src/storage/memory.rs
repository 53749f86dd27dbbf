//! Embedded in-memory backend.
//!
//! Transactions stage their writes and apply them atomically on commit, so a
//! reader in another session never observes a half-applied ledger. Lookup
//! tables behave like database sequences: an inserted key keeps its ID even
//! when the surrounding transaction rolls back.

use super::session::{HistoryRow, Session, StateWrite, StorageError, StorageFuture};
use crate::ledger::{EntryType, LedgerEntry, LedgerRange};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default, Clone)]
struct Tables {
    last_ledger: u32,
    ingest_version: u32,
    state_invalid: bool,
    history: BTreeMap<String, BTreeMap<String, HistoryRow>>,
    state: BTreeMap<(EntryType, String), LedgerEntry>,
}

impl Tables {
    fn apply(&mut self, write: PendingWrite) -> Result<(), StorageError> {
        match write {
            PendingWrite::Cursor(sequence) => self.last_ledger = sequence,
            PendingWrite::Version(version) => self.ingest_version = version,
            PendingWrite::StateInvalid(invalid) => self.state_invalid = invalid,
            PendingWrite::Insert { table, rows } => {
                let target = self.history.entry(table.clone()).or_default();
                for row in rows {
                    if target.contains_key(&row.key) {
                        return Err(StorageError::DuplicateRow {
                            table,
                            key: row.key,
                        });
                    }
                    target.insert(row.key.clone(), row);
                }
            }
            PendingWrite::Upsert { table, rows } => {
                let target = self.history.entry(table).or_default();
                for row in rows {
                    target.insert(row.key.clone(), row);
                }
            }
            PendingWrite::DeleteRange(range) => {
                for rows in self.history.values_mut() {
                    rows.retain(|_, row| !range.contains(row.ledger));
                }
            }
            PendingWrite::State(writes) => {
                for write in writes {
                    match write {
                        StateWrite::Upsert(entry) => {
                            self.state
                                .insert((entry.entry_type, entry.key.clone()), entry);
                        }
                        StateWrite::Remove { entry_type, key } => {
                            self.state.remove(&(entry_type, key));
                        }
                    }
                }
            }
            PendingWrite::TruncateState => self.state.clear(),
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Cursor(u32),
    Version(u32),
    StateInvalid(bool),
    Insert { table: String, rows: Vec<HistoryRow> },
    Upsert { table: String, rows: Vec<HistoryRow> },
    DeleteRange(LedgerRange),
    State(Vec<StateWrite>),
    TruncateState,
}

struct Shared {
    tables: Mutex<Tables>,
    lookups: Mutex<HashMap<String, HashMap<String, i64>>>,
    next_lookup_id: AtomicI64,
    cursor_lock: Arc<AsyncMutex<()>>,
    verification_lock: AtomicBool,
    fail_commits: AtomicUsize,
    commits: AtomicU64,
}

/// Shared in-memory database. Clones refer to the same data.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                lookups: Mutex::new(HashMap::new()),
                next_lookup_id: AtomicI64::new(1),
                cursor_lock: Arc::new(AsyncMutex::new(())),
                verification_lock: AtomicBool::new(false),
                fail_commits: AtomicUsize::new(0),
                commits: AtomicU64::new(0),
            }),
        }
    }

    pub fn session(&self) -> MemorySession {
        MemorySession {
            shared: self.shared.clone(),
            tx: None,
        }
    }

    /// The next `count` commits fail with a transient error and roll back.
    pub fn fail_next_commits(&self, count: usize) {
        self.shared.fail_commits.store(count, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> u64 {
        self.shared.commits.load(Ordering::SeqCst)
    }

    pub fn last_ledger_ingest(&self) -> u32 {
        self.shared.tables.lock().unwrap().last_ledger
    }

    pub fn ingest_version(&self) -> u32 {
        self.shared.tables.lock().unwrap().ingest_version
    }

    pub fn state_invalid(&self) -> bool {
        self.shared.tables.lock().unwrap().state_invalid
    }

    /// Committed rows of `table`, ordered by key.
    pub fn history_rows(&self, table: &str) -> Vec<HistoryRow> {
        self.shared
            .tables
            .lock()
            .unwrap()
            .history
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn state_entries(&self) -> Vec<LedgerEntry> {
        self.shared
            .tables
            .lock()
            .unwrap()
            .state
            .values()
            .cloned()
            .collect()
    }

    pub fn lookup_len(&self, table: &str) -> usize {
        self.shared
            .lookups
            .lock()
            .unwrap()
            .get(table)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

struct PendingTx {
    writes: Vec<PendingWrite>,
    cursor_guard: Option<OwnedMutexGuard<()>>,
    holds_verification_lock: bool,
    /// Committed tables as of `begin_snapshot`.
    snapshot: Option<Tables>,
}

pub struct MemorySession {
    shared: Arc<Shared>,
    tx: Option<PendingTx>,
}

impl MemorySession {
    fn stage(&mut self, write: PendingWrite) -> Result<()> {
        match self.tx.as_mut() {
            Some(tx) => {
                tx.writes.push(write);
                Ok(())
            }
            None => {
                let mut tables = self.shared.tables.lock().unwrap();
                let mut next = tables.clone();
                next.apply(write)?;
                *tables = next;
                Ok(())
            }
        }
    }

    /// Reads the committed tables, or the transaction's snapshot if it has one.
    fn committed<T>(&self, read: impl FnOnce(&Tables) -> T) -> T {
        match self.tx.as_ref().and_then(|tx| tx.snapshot.as_ref()) {
            Some(snapshot) => read(snapshot),
            None => read(&self.shared.tables.lock().unwrap()),
        }
    }

    /// Committed tables with this session's staged writes applied.
    fn view(&self) -> Result<Tables> {
        let mut tables = self.committed(Tables::clone);
        if let Some(tx) = &self.tx {
            for write in tx.writes.iter().cloned() {
                tables.apply(write)?;
            }
        }
        Ok(tables)
    }

    fn staged_scalar<T>(&self, pick: impl Fn(&PendingWrite) -> Option<T>) -> Option<T> {
        self.tx
            .as_ref()
            .and_then(|tx| tx.writes.iter().rev().find_map(pick))
    }

    fn release(&mut self, tx: PendingTx) {
        if tx.holds_verification_lock {
            self.shared.verification_lock.store(false, Ordering::SeqCst);
        }
        drop(tx.cursor_guard);
    }

    fn read_cursor(&self) -> u32 {
        self.staged_scalar(|write| match write {
            PendingWrite::Cursor(sequence) => Some(*sequence),
            _ => None,
        })
        .unwrap_or_else(|| self.committed(|tables| tables.last_ledger))
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.release(tx);
        }
    }
}

impl Session for MemorySession {
    fn begin(&mut self) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            if self.tx.is_some() {
                return Err(StorageError::TransactionInProgress.into());
            }
            self.tx = Some(PendingTx {
                writes: Vec::new(),
                cursor_guard: None,
                holds_verification_lock: false,
                snapshot: None,
            });
            Ok(())
        })
    }

    fn begin_snapshot(&mut self) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            if self.tx.is_some() {
                return Err(StorageError::TransactionInProgress.into());
            }
            let snapshot = self.shared.tables.lock().unwrap().clone();
            self.tx = Some(PendingTx {
                writes: Vec::new(),
                cursor_guard: None,
                holds_verification_lock: false,
                snapshot: Some(snapshot),
            });
            Ok(())
        })
    }

    fn commit(&mut self) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            let mut tx = self.tx.take().ok_or(StorageError::NoTransaction)?;
            let writes = std::mem::take(&mut tx.writes);
            let outcome = {
                let injected = self
                    .shared
                    .fail_commits
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                        remaining.checked_sub(1)
                    })
                    .is_ok();
                if injected {
                    Err(StorageError::Transient("injected commit failure".to_string()))
                } else {
                    let mut tables = self.shared.tables.lock().unwrap();
                    let mut next = tables.clone();
                    let applied = writes.into_iter().try_for_each(|write| next.apply(write));
                    if applied.is_ok() {
                        *tables = next;
                    }
                    applied
                }
            };
            self.release(tx);
            outcome?;
            self.shared.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn rollback(&mut self) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            if let Some(tx) = self.tx.take() {
                self.release(tx);
            }
            Ok(())
        })
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn clone_session(&self) -> Box<dyn Session> {
        Box::new(MemorySession {
            shared: self.shared.clone(),
            tx: None,
        })
    }

    fn get_last_ledger_ingest(&mut self) -> StorageFuture<'_, u32> {
        Box::pin(async move {
            let needs_lock = matches!(&self.tx, Some(tx) if tx.cursor_guard.is_none());
            if needs_lock {
                let guard = self.shared.cursor_lock.clone().lock_owned().await;
                if let Some(tx) = self.tx.as_mut() {
                    tx.cursor_guard = Some(guard);
                }
            }
            Ok(self.read_cursor())
        })
    }

    fn get_last_ledger_ingest_non_blocking(&mut self) -> StorageFuture<'_, u32> {
        Box::pin(async move { Ok(self.read_cursor()) })
    }

    fn update_last_ledger_ingest(&mut self, sequence: u32) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.stage(PendingWrite::Cursor(sequence)) })
    }

    fn get_ingest_version(&mut self) -> StorageFuture<'_, u32> {
        Box::pin(async move {
            Ok(self
                .staged_scalar(|write| match write {
                    PendingWrite::Version(version) => Some(*version),
                    _ => None,
                })
                .unwrap_or_else(|| self.committed(|tables| tables.ingest_version)))
        })
    }

    fn update_ingest_version(&mut self, version: u32) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.stage(PendingWrite::Version(version)) })
    }

    fn get_state_invalid(&mut self) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            Ok(self
                .staged_scalar(|write| match write {
                    PendingWrite::StateInvalid(invalid) => Some(*invalid),
                    _ => None,
                })
                .unwrap_or_else(|| self.committed(|tables| tables.state_invalid)))
        })
    }

    fn update_state_invalid(&mut self, invalid: bool) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.stage(PendingWrite::StateInvalid(invalid)) })
    }

    fn try_state_verification_lock(&mut self) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            let shared = self.shared.clone();
            let tx = self.tx.as_mut().ok_or(StorageError::NoTransaction)?;
            if tx.holds_verification_lock {
                return Ok(true);
            }
            let acquired = shared
                .verification_lock
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            tx.holds_verification_lock = acquired;
            Ok(acquired)
        })
    }

    fn insert_lookup_keys<'a>(
        &'a mut self,
        table: &'a str,
        keys: &'a [String],
    ) -> StorageFuture<'a, u64> {
        Box::pin(async move {
            let mut lookups = self.shared.lookups.lock().unwrap();
            let ids = lookups.entry(table.to_string()).or_default();
            let mut inserted = 0;
            for key in keys {
                if !ids.contains_key(key) {
                    let id = self.shared.next_lookup_id.fetch_add(1, Ordering::SeqCst);
                    ids.insert(key.clone(), id);
                    inserted += 1;
                }
            }
            Ok(inserted)
        })
    }

    fn lookup_ids<'a>(
        &'a mut self,
        table: &'a str,
        keys: &'a [String],
    ) -> StorageFuture<'a, HashMap<String, i64>> {
        Box::pin(async move {
            let lookups = self.shared.lookups.lock().unwrap();
            let Some(ids) = lookups.get(table) else {
                return Ok(HashMap::new());
            };
            Ok(keys
                .iter()
                .filter_map(|key| ids.get(key).map(|id| (key.clone(), *id)))
                .collect())
        })
    }

    fn insert_history_rows<'a>(
        &'a mut self,
        table: &'a str,
        rows: Vec<HistoryRow>,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.stage(PendingWrite::Insert {
                table: table.to_string(),
                rows,
            })
        })
    }

    fn upsert_history_rows<'a>(
        &'a mut self,
        table: &'a str,
        rows: Vec<HistoryRow>,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.stage(PendingWrite::Upsert {
                table: table.to_string(),
                rows,
            })
        })
    }

    fn history_rows<'a>(
        &'a mut self,
        table: &'a str,
        range: LedgerRange,
    ) -> StorageFuture<'a, Vec<HistoryRow>> {
        Box::pin(async move {
            let tables = self.view()?;
            Ok(tables
                .history
                .get(table)
                .map(|rows| {
                    rows.values()
                        .filter(|row| range.contains(row.ledger))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn delete_history_range(&mut self, range: LedgerRange) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.stage(PendingWrite::DeleteRange(range)) })
    }

    fn write_state_entries(&mut self, writes: Vec<StateWrite>) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            if writes.is_empty() {
                return Ok(());
            }
            self.stage(PendingWrite::State(writes))
        })
    }

    fn truncate_state(&mut self) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.stage(PendingWrite::TruncateState) })
    }

    fn state_entries(&mut self) -> StorageFuture<'_, Vec<LedgerEntry>> {
        Box::pin(async move { Ok(self.view()?.state.into_values().collect()) })
    }
}
