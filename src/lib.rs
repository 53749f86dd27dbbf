pub mod ingest;
pub mod ledger;
pub mod loader;
pub mod processors;
pub mod runtime;
pub mod storage;

pub use ingest::{
    IngestError, ParallelReingest, ProcessorRunner, ReingestReport, State, System, SystemParams,
};
pub use ledger::{
    Change, HistoryArchive, LedgerCloseMeta, LedgerRange, LedgerSource, MemoryHistoryArchive,
    MemoryLedgerSource,
};
pub use loader::{FutureId, Loader, LoaderError, LoaderTable};
pub use processors::{DefaultProcessorSet, ProcessorSet};
pub use runtime::config::{IngestConfig, IngestConfigBuilder, IngestConfigParams};
pub use runtime::progress::{ProgressTracker, StateName, StateSnapshot};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use storage::{MemoryStore, Session, StorageError};
