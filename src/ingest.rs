//! Ingestion state machine, the processor runner it drives and the
//! parallel reingestion orchestrator built on top of it.

pub mod aggregates;
pub(crate) mod backoff;
pub mod error;
pub(crate) mod lifecycle;
pub mod reingest;
pub mod runner;
pub mod system;
pub mod verify;
pub mod watch;

pub use aggregates::{DerivedAggregates, LedgerCountAggregates, LEDGER_AGGREGATES_TABLE};
pub use error::{ingest_error, is_cancelled, IngestError};
pub use reingest::{split_ranges, JobReport, ParallelReingest, ReingestReport, SystemFactory};
pub use runner::{ProcessorRunner, RunStats};
pub use system::{
    check_range_conflict, checkpoint_at_or_before, is_checkpoint, State, System, SystemParams,
};
pub use verify::{
    ledger_eligible_for_state_verification, ArchiveStateVerifier, StateVerifier, Verification,
};
pub use watch::{wait_for_ledger, WaitPolicy};
