use crate::ledger::LedgerRange;
use crate::storage::StorageError;
use std::fmt;
use std::time::Duration;

/// Conditions callers classify with `downcast_ref` rather than by message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// The next ledger has not been published yet. Recoverable.
    LedgerNotAvailable { sequence: u32 },
    InvalidRange { from: u32, to: u32 },
    /// A non-forced reingestion reaches the live cursor.
    RangeConflict { range: LedgerRange, cursor: u32 },
    /// Verification replays need an empty database.
    DatabaseNotEmpty { cursor: u32 },
    LedgerWaitTimeout { sequence: u32, waited: Duration },
    Cancelled,
    AlreadyRunning,
    /// Parallel reingestion stopped; `restart` covers every unfinished job.
    ReingestFailed {
        job: LedgerRange,
        restart: LedgerRange,
    },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::LedgerNotAvailable { sequence } => {
                write!(f, "ledger {sequence} is not available yet")
            }
            IngestError::InvalidRange { from, to } => write!(f, "invalid range: [{from}, {to}]"),
            IngestError::RangeConflict { range, cursor } => write!(
                f,
                "range {range} overlaps the live ingestion cursor at ledger {cursor}; \
                 rerun with force to serialise with live ingestion"
            ),
            IngestError::DatabaseNotEmpty { cursor } => write!(
                f,
                "database is not empty (last ingested ledger {cursor}); verification requires an empty database"
            ),
            IngestError::LedgerWaitTimeout { sequence, waited } => write!(
                f,
                "timed out after {}ms waiting for ledger {sequence}",
                waited.as_millis()
            ),
            IngestError::Cancelled => write!(f, "ingestion cancelled"),
            IngestError::AlreadyRunning => write!(f, "operation is already running"),
            IngestError::ReingestFailed { job, restart } => write!(
                f,
                "reingestion job {job} failed; restart with range {restart}"
            ),
        }
    }
}

impl std::error::Error for IngestError {}

/// True when any error in the chain reports cancellation, including
/// cancellation attached as context.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    if matches!(err.downcast_ref::<IngestError>(), Some(IngestError::Cancelled))
        || matches!(err.downcast_ref::<StorageError>(), Some(StorageError::Cancelled))
    {
        return true;
    }
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<IngestError>(),
            Some(IngestError::Cancelled)
        ) || matches!(
            cause.downcast_ref::<StorageError>(),
            Some(StorageError::Cancelled)
        )
    })
}

/// The outermost [`IngestError`], whether raised as an error or attached
/// with `.context(...)`.
pub fn ingest_error(err: &anyhow::Error) -> Option<&IngestError> {
    // Context links in `chain()` do not downcast to their context type.
    err.downcast_ref::<IngestError>().or_else(|| {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<IngestError>())
    })
}
