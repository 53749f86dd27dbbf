//! Change processors maintaining the current-state tables.

use super::{ChangeProcessor, ProcessorFuture, StatsReset};
use crate::ledger::{Change, ChangeKind};
use crate::storage::{Session, StateWrite};
use anyhow::{anyhow, Result};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Mirrors every change into the state tables, writing in chunks of
/// `max_buffered_rows` and finalising on commit.
pub struct EntriesChangeProcessor {
    max_buffered_rows: usize,
    pending: Vec<StateWrite>,
}

impl EntriesChangeProcessor {
    pub fn new(max_buffered_rows: usize) -> Self {
        Self {
            max_buffered_rows: max_buffered_rows.max(1),
            pending: Vec::new(),
        }
    }

    fn state_write(change: &Change) -> Result<StateWrite> {
        match change.kind() {
            ChangeKind::Created | ChangeKind::Updated => change
                .post()
                .cloned()
                .map(StateWrite::Upsert)
                .ok_or_else(|| {
                    anyhow!(
                        "{} change on {} has no post-image",
                        kind_name(change),
                        change.key()
                    )
                }),
            ChangeKind::Removed => Ok(StateWrite::Remove {
                entry_type: change.entry_type(),
                key: change.key().to_string(),
            }),
        }
    }
}

fn kind_name(change: &Change) -> &'static str {
    match change.kind() {
        ChangeKind::Created => "created",
        ChangeKind::Updated => "updated",
        ChangeKind::Removed => "removed",
    }
}

impl ChangeProcessor for EntriesChangeProcessor {
    fn name(&self) -> &str {
        "EntriesChangeProcessor"
    }

    fn process_change<'a>(
        &'a mut self,
        session: &'a mut dyn Session,
        change: &'a Change,
    ) -> ProcessorFuture<'a> {
        Box::pin(async move {
            self.pending.push(Self::state_write(change)?);
            if self.pending.len() >= self.max_buffered_rows {
                session.write_state_entries(mem::take(&mut self.pending)).await?;
            }
            Ok(())
        })
    }

    fn commit<'a>(&'a mut self, session: &'a mut dyn Session) -> ProcessorFuture<'a> {
        Box::pin(async move {
            if self.pending.is_empty() {
                return Ok(());
            }
            session.write_state_entries(mem::take(&mut self.pending)).await
        })
    }
}

#[derive(Debug, Default)]
pub struct ChangeStats {
    created: AtomicU64,
    updated: AtomicU64,
    removed: AtomicU64,
}

impl ChangeStats {
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn updated(&self) -> u64 {
        self.updated.load(Ordering::Relaxed)
    }

    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.created() + self.updated() + self.removed()
    }
}

impl StatsReset for ChangeStats {
    fn reset_stats(&self) {
        self.created.store(0, Ordering::Relaxed);
        self.updated.store(0, Ordering::Relaxed);
        self.removed.store(0, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct StatsChangeProcessor {
    stats: Arc<ChangeStats>,
}

impl StatsChangeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stats(stats: Arc<ChangeStats>) -> Self {
        Self { stats }
    }

    pub fn stats_handle(&self) -> Arc<ChangeStats> {
        self.stats.clone()
    }
}

impl ChangeProcessor for StatsChangeProcessor {
    fn name(&self) -> &str {
        "StatsChangeProcessor"
    }

    fn process_change<'a>(
        &'a mut self,
        _session: &'a mut dyn Session,
        change: &'a Change,
    ) -> ProcessorFuture<'a> {
        let counter = match change.kind() {
            ChangeKind::Created => &self.stats.created,
            ChangeKind::Updated => &self.stats.updated,
            ChangeKind::Removed => &self.stats.removed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Box::pin(async { Ok(()) })
    }

    fn commit<'a>(&'a mut self, _session: &'a mut dyn Session) -> ProcessorFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}
