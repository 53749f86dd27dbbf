//! Ledger data model plus the collaborator traits that supply closed ledgers
//! and checkpoint state to the ingestion pipeline.

pub mod change;
pub mod memory;
pub mod meta;
pub mod range;
pub mod source;

pub use change::{Change, ChangeKind, EntryType, LedgerEntry};
pub use memory::{MemoryHistoryArchive, MemoryLedgerSource};
pub use meta::{LedgerCloseMeta, LedgerHeader, LedgerTransaction, Operation};
pub use range::LedgerRange;
pub use source::{HistoryArchive, LedgerSource, SourceError, SourceFuture};
