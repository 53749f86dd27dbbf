//! Atomically published view of the state machine for concurrent readers.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateName {
    Start,
    Build,
    Resume,
    VerifyRange,
    ReingestHistoryRange,
    Stop,
}

impl StateName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateName::Start => "start",
            StateName::Build => "build",
            StateName::Resume => "resume",
            StateName::VerifyRange => "verify_range",
            StateName::ReingestHistoryRange => "reingest_history_range",
            StateName::Stop => "stop",
        }
    }
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot; a new one replaces the old on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub state: StateName,
    /// Zero until this instance has read or written the cursor.
    pub last_ingested_ledger: u32,
    pub ingest_version: u32,
    /// Ledgers applied by this instance since it was created.
    pub ledgers_processed: u64,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            state: StateName::Start,
            last_ingested_ledger: 0,
            ingest_version: 0,
            ledgers_processed: 0,
        }
    }
}

/// Single-writer publisher with lock-free readers.
#[derive(Debug)]
pub struct ProgressTracker {
    current: ArcSwap<StateSnapshot>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(StateSnapshot::default()),
        }
    }

    pub fn current(&self) -> Arc<StateSnapshot> {
        self.current.load_full()
    }

    pub fn enter(&self, state: StateName) {
        self.update(|snapshot| snapshot.state = state);
    }

    pub fn mark_ingested(&self, ledger: u32, ingest_version: u32, applied: u64) {
        self.update(|snapshot| {
            snapshot.last_ingested_ledger = ledger;
            snapshot.ingest_version = ingest_version;
            snapshot.ledgers_processed += applied;
        });
    }

    fn update(&self, apply: impl Fn(&mut StateSnapshot)) {
        self.current.rcu(|current| {
            let mut next = StateSnapshot::clone(current);
            apply(&mut next);
            next
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_keep_their_snapshot_after_updates() {
        let tracker = ProgressTracker::new();
        let before = tracker.current();

        tracker.enter(StateName::Resume);
        tracker.mark_ingested(10, 19, 1);

        assert_eq!(before.state, StateName::Start);
        assert_eq!(before.last_ingested_ledger, 0);

        let after = tracker.current();
        assert_eq!(after.state, StateName::Resume);
        assert_eq!(after.last_ingested_ledger, 10);
        assert_eq!(after.ingest_version, 19);
        assert_eq!(after.ledgers_processed, 1);
    }

    #[test]
    fn processed_counter_accumulates() {
        let tracker = ProgressTracker::new();
        tracker.mark_ingested(2, 19, 0);
        tracker.mark_ingested(3, 19, 1);
        tracker.mark_ingested(4, 19, 1);
        assert_eq!(tracker.current().ledgers_processed, 2);
        assert_eq!(tracker.current().last_ingested_ledger, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_readers_never_see_torn_snapshots() {
        let tracker = Arc::new(ProgressTracker::new());
        let writer = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                for ledger in 1..=500u32 {
                    tracker.mark_ingested(ledger, ledger, 1);
                    tokio::task::yield_now().await;
                }
            })
        };

        let reader = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    let snapshot = tracker.current();
                    assert_eq!(snapshot.last_ingested_ledger, snapshot.ingest_version);
                    assert_eq!(
                        snapshot.ledgers_processed,
                        snapshot.last_ingested_ledger as u64
                    );
                    tokio::task::yield_now().await;
                }
            })
        };

        writer.await.unwrap();
        reader.await.unwrap();
    }
}
