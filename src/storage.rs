//! Storage seam used by the ingestion pipeline: one [`Session`] per
//! isolation unit plus the embedded [`MemoryStore`] backend.

pub mod memory;
pub mod session;

pub use memory::{MemorySession, MemoryStore};
pub use session::{
    is_transient, HistoryRow, Session, StateWrite, StorageError, StorageFuture,
};
