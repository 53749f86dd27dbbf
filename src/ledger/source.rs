//! Collaborator traits for the wire-level ledger backend and the checkpoint
//! archive. Both are implemented outside this crate in production; the
//! in-memory versions in [`super::memory`] back tests and embedded use.

use super::change::Change;
use super::meta::LedgerCloseMeta;
use super::range::LedgerRange;
use anyhow::Result;
use futures::future::BoxFuture;
use std::fmt;

pub type SourceFuture<'a, T> = BoxFuture<'a, Result<T, SourceError>>;

/// Error returned by [`LedgerSource::get_ledger`].
#[derive(Debug)]
pub enum SourceError {
    /// The ledger has not been closed/published yet. Recoverable.
    NotAvailable { sequence: u32 },
    Other(anyhow::Error),
}

impl SourceError {
    pub fn is_not_available(&self) -> bool {
        matches!(self, SourceError::NotAvailable { .. })
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::NotAvailable { sequence } => {
                write!(f, "ledger {sequence} is not available yet")
            }
            SourceError::Other(err) => write!(f, "ledger source error: {err:#}"),
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SourceError::NotAvailable { .. } => None,
            SourceError::Other(err) => Some(err.as_ref()),
        }
    }
}

impl From<anyhow::Error> for SourceError {
    fn from(err: anyhow::Error) -> Self {
        SourceError::Other(err)
    }
}

/// Supplies closed ledgers in sequence order.
pub trait LedgerSource: Send + Sync {
    fn get_ledger(&self, sequence: u32) -> SourceFuture<'_, LedgerCloseMeta>;

    fn get_latest_ledger_sequence(&self) -> SourceFuture<'_, u32>;

    /// Lets a backend pre-buffer a range before it is read sequentially.
    fn prepare_range(&self, _range: LedgerRange) -> SourceFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Supplies full entry state at checkpoint ledgers.
pub trait HistoryArchive: Send + Sync {
    /// Every entry live at `checkpoint`, as `created` changes.
    fn get_checkpoint_state(&self, checkpoint: u32) -> BoxFuture<'_, Result<Vec<Change>>>;

    fn get_latest_checkpoint(&self) -> BoxFuture<'_, Result<u32>>;
}
