use super::change::{Change, LedgerEntry};
use super::meta::LedgerCloseMeta;
use super::source::{HistoryArchive, LedgerSource, SourceError, SourceFuture};
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct SourceInner {
    ledgers: BTreeMap<u32, LedgerCloseMeta>,
    failures: HashMap<u32, String>,
    requests: Vec<u32>,
}

/// Ledger source backed by a map of published ledgers. Cloning shares the
/// underlying map so tests can publish while the pipeline polls.
#[derive(Clone, Default)]
pub struct MemoryLedgerSource {
    inner: Arc<Mutex<SourceInner>>,
}

impl MemoryLedgerSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ledgers(ledgers: impl IntoIterator<Item = LedgerCloseMeta>) -> Self {
        let source = Self::new();
        for ledger in ledgers {
            source.publish(ledger);
        }
        source
    }

    pub fn publish(&self, ledger: LedgerCloseMeta) {
        let mut inner = self.inner.lock().unwrap();
        inner.ledgers.insert(ledger.sequence(), ledger);
    }

    /// The next `get_ledger(sequence)` fails with `message` instead of
    /// returning the ledger.
    pub fn fail_once(&self, sequence: u32, message: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures.insert(sequence, message.into());
    }

    /// Every sequence requested so far, in request order.
    pub fn requests(&self) -> Vec<u32> {
        self.inner.lock().unwrap().requests.clone()
    }
}

impl LedgerSource for MemoryLedgerSource {
    fn get_ledger(&self, sequence: u32) -> SourceFuture<'_, LedgerCloseMeta> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner.requests.push(sequence);
            if let Some(message) = inner.failures.remove(&sequence) {
                return Err(SourceError::Other(anyhow!(message)));
            }
            inner
                .ledgers
                .get(&sequence)
                .cloned()
                .ok_or(SourceError::NotAvailable { sequence })
        })
    }

    fn get_latest_ledger_sequence(&self) -> SourceFuture<'_, u32> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            inner
                .ledgers
                .keys()
                .next_back()
                .copied()
                .ok_or_else(|| SourceError::Other(anyhow!("no ledgers published")))
        })
    }
}

/// Checkpoint archive backed by in-memory entry snapshots.
#[derive(Clone, Default)]
pub struct MemoryHistoryArchive {
    checkpoints: Arc<Mutex<BTreeMap<u32, Vec<LedgerEntry>>>>,
}

impl MemoryHistoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_checkpoint_state(&self, checkpoint: u32, entries: Vec<LedgerEntry>) {
        self.checkpoints
            .lock()
            .unwrap()
            .insert(checkpoint, entries);
    }
}

impl HistoryArchive for MemoryHistoryArchive {
    fn get_checkpoint_state(&self, checkpoint: u32) -> BoxFuture<'_, Result<Vec<Change>>> {
        Box::pin(async move {
            let checkpoints = self.checkpoints.lock().unwrap();
            let entries = checkpoints
                .get(&checkpoint)
                .ok_or_else(|| anyhow!("checkpoint {checkpoint} is not in the archive"))?;
            Ok(entries.iter().cloned().map(Change::created).collect())
        })
    }

    fn get_latest_checkpoint(&self) -> BoxFuture<'_, Result<u32>> {
        Box::pin(async move {
            self.checkpoints
                .lock()
                .unwrap()
                .keys()
                .next_back()
                .copied()
                .ok_or_else(|| anyhow!("archive has no checkpoints"))
        })
    }
}
