//! Storage backends for the knowledge base.

pub mod memory;
pub mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::MemoryStore;
pub use traits::{
    CommitReceipt, EntryDraft, KnowledgeStore, StorageError, Transaction, VersionGuard,
};

#[cfg(feature = "persistent")]
pub use persistent::{DurableStore, DurableConfig};
