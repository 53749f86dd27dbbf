//! Polls the ledger source for the next ledger with a linearly growing delay.

use super::IngestError;
use crate::ledger::{LedgerCloseMeta, LedgerSource, SourceError};
use crate::runtime::config::IngestConfig;
use crate::runtime::hooks::{run_cancellable, HookDecision};
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Delay schedule for [`wait_for_ledger`]: `initial`, `initial + step`,
/// `initial + 2 * step`, ... until `timeout` has elapsed in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub initial: Duration,
    pub step: Duration,
    pub timeout: Duration,
}

impl WaitPolicy {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            initial: config.ledger_wait_initial_backoff(),
            step: config.ledger_wait_backoff_step(),
            timeout: config.ledger_wait_timeout(),
        }
    }
}

/// Returns ledger `sequence` once the source publishes it.
///
/// "Not available" answers are retried until `policy.timeout`, which then
/// fails with [`IngestError::LedgerWaitTimeout`]. Any other source error is
/// returned immediately.
pub async fn wait_for_ledger(
    source: &dyn LedgerSource,
    sequence: u32,
    policy: WaitPolicy,
    token: &CancellationToken,
) -> Result<LedgerCloseMeta> {
    let started = Instant::now();
    let mut delay = policy.initial;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let outcome = match run_cancellable(token, async {
            Ok(source.get_ledger(sequence).await)
        })
        .await
        {
            HookDecision::Finished(Ok(outcome)) => outcome,
            HookDecision::Finished(Err(err)) => return Err(err),
            HookDecision::Cancelled => return Err(IngestError::Cancelled.into()),
        };

        match outcome {
            Ok(ledger) => {
                if attempts > 1 {
                    tracing::debug!(
                        ledger = sequence,
                        attempts,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "ledger became available"
                    );
                }
                return Ok(ledger);
            }
            Err(SourceError::NotAvailable { .. }) => {
                let waited = started.elapsed();
                if waited >= policy.timeout {
                    return Err(IngestError::LedgerWaitTimeout { sequence, waited }.into());
                }

                let sleep_for = delay.min(policy.timeout - waited);
                tracing::debug!(
                    ledger = sequence,
                    attempts,
                    backoff_ms = sleep_for.as_millis() as u64,
                    "ledger not available yet; waiting"
                );

                let slept = run_cancellable(token, async {
                    tokio::time::sleep(sleep_for).await;
                    Ok(())
                })
                .await;
                if let HookDecision::Cancelled = slept {
                    return Err(IngestError::Cancelled.into());
                }
                delay = delay.saturating_add(policy.step);
            }
            Err(SourceError::Other(err)) => {
                return Err(err).with_context(|| format!("error getting ledger {sequence}"));
            }
        }
    }
}

/// Maps a source failure for a ledger that should already exist.
pub(crate) fn ledger_fetch_error(sequence: u32, err: SourceError) -> anyhow::Error {
    match err {
        SourceError::NotAvailable { sequence } => {
            IngestError::LedgerNotAvailable { sequence }.into()
        }
        SourceError::Other(err) => err.context(format!("error getting ledger {sequence}")),
    }
}
