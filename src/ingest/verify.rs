//! Background comparison of live entry state against checkpoint snapshots.

use super::is_cancelled;
use crate::ledger::{HistoryArchive, LedgerEntry};
use crate::runtime::telemetry::Telemetry;
use crate::storage::Session;
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// True for checkpoint ledgers selected for verification: every
/// `every`-th checkpoint of a `checkpoint_frequency` schedule.
pub fn ledger_eligible_for_state_verification(
    checkpoint_frequency: u32,
    every: u32,
    sequence: u32,
) -> bool {
    let period = checkpoint_frequency as u64 * every.max(1) as u64;
    period > 0 && (sequence as u64 + 1) % period == 0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Matched { entries: usize },
    Mismatch { reason: String },
}

/// Checks the session's entry state against an authoritative source.
pub trait StateVerifier: Send + Sync {
    fn verify<'a>(
        &'a self,
        session: &'a mut dyn Session,
        checkpoint: u32,
    ) -> BoxFuture<'a, Result<Verification>>;
}

/// Compares state tables with the archive snapshot of the same checkpoint.
pub struct ArchiveStateVerifier {
    archive: Arc<dyn HistoryArchive>,
}

impl ArchiveStateVerifier {
    pub fn new(archive: Arc<dyn HistoryArchive>) -> Self {
        Self { archive }
    }
}

impl StateVerifier for ArchiveStateVerifier {
    fn verify<'a>(
        &'a self,
        session: &'a mut dyn Session,
        checkpoint: u32,
    ) -> BoxFuture<'a, Result<Verification>> {
        Box::pin(async move {
            let actual = session.state_entries().await?;
            let mut expected: Vec<LedgerEntry> = self
                .archive
                .get_checkpoint_state(checkpoint)
                .await
                .with_context(|| format!("error reading checkpoint {checkpoint} from the archive"))?
                .into_iter()
                .filter_map(|change| change.post().cloned())
                .collect();
            expected.sort_by(|a, b| (a.entry_type, &a.key).cmp(&(b.entry_type, &b.key)));

            Ok(compare_entries(&actual, &expected))
        })
    }
}

fn compare_entries(actual: &[LedgerEntry], expected: &[LedgerEntry]) -> Verification {
    for (live, archived) in actual.iter().zip(expected) {
        if live != archived {
            return Verification::Mismatch {
                reason: format!(
                    "entry {} {} differs from the archive",
                    live.entry_type, live.key
                ),
            };
        }
    }

    if actual.len() != expected.len() {
        return Verification::Mismatch {
            reason: format!(
                "state has {} entries, archive has {}",
                actual.len(),
                expected.len()
            ),
        };
    }

    Verification::Matched {
        entries: actual.len(),
    }
}

pub(crate) struct VerificationTask {
    pub session: Box<dyn Session>,
    pub verifier: Arc<dyn StateVerifier>,
    pub telemetry: Arc<Telemetry>,
    pub checkpoint: u32,
    pub timeout: Option<Duration>,
    pub token: CancellationToken,
    pub running: Arc<AtomicBool>,
}

impl VerificationTask {
    /// Runs detached. Errors are logged; cancellation is silent.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        let running = self.running.clone();
        let checkpoint = self.checkpoint;
        tokio::spawn(async move {
            let telemetry = self.telemetry.clone();
            let token = self.token.clone();
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Ok(None),
                result = self.run() => result,
            };

            match outcome {
                Ok(Some(true)) => telemetry.record_verification(true),
                Ok(Some(false)) => telemetry.record_verification(false),
                Ok(None) => {}
                Err(err) if is_cancelled(&err) => {}
                Err(err) => {
                    telemetry.record_verification(false);
                    tracing::error!(
                        checkpoint,
                        error = %format!("{err:#}"),
                        "state verification failed"
                    );
                }
            }
            running.store(false, Ordering::SeqCst);
        })
    }

    /// `Some(matched)` when a comparison ran, `None` when it was skipped.
    /// The session arrives inside a snapshot transaction taken at the checkpoint.
    async fn run(mut self) -> Result<Option<bool>> {
        let checkpoint = self.checkpoint;
        let session = self.session.as_mut();

        let result = verify_locked(session, self.verifier.as_ref(), checkpoint, self.timeout).await;
        if session.in_transaction() {
            if let Err(err) = session.rollback().await {
                tracing::warn!(error = %err, "failed to roll back verification transaction");
            }
        }

        match result? {
            None => Ok(None),
            Some(Verification::Matched { entries }) => {
                tracing::info!(checkpoint, entries, "state verification succeeded");
                Ok(Some(true))
            }
            Some(Verification::Mismatch { reason }) => {
                tracing::error!(
                    checkpoint,
                    reason = %reason,
                    "state verification found a mismatch; marking state invalid"
                );
                session.update_state_invalid(true).await?;
                Ok(Some(false))
            }
        }
    }
}

async fn verify_locked(
    session: &mut dyn Session,
    verifier: &dyn StateVerifier,
    checkpoint: u32,
    timeout: Option<Duration>,
) -> Result<Option<Verification>> {
    if session.get_state_invalid().await? {
        tracing::warn!(checkpoint, "state is already marked invalid; skipping verification");
        return Ok(None);
    }

    if !session.try_state_verification_lock().await? {
        tracing::debug!(checkpoint, "another instance is verifying state; skipping");
        return Ok(None);
    }

    if session.get_last_ledger_ingest_non_blocking().await? != checkpoint {
        tracing::debug!(checkpoint, "snapshot is not at the checkpoint; skipping verification");
        return Ok(None);
    }

    tracing::info!(checkpoint, "starting state verification");
    let verification = match timeout {
        Some(limit) => tokio::time::timeout(limit, verifier.verify(session, checkpoint))
            .await
            .map_err(|_| anyhow!("state verification timed out after {}s", limit.as_secs()))??,
        None => verifier.verify(session, checkpoint).await?,
    };

    Ok(Some(verification))
}
