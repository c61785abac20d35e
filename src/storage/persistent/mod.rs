//! Durable storage backend (feature `persistent`).
//!
//! Single-process durability built from three small pieces:
//! - an append-only ledger file with length-prefixed, CRC32-checked
//!   framing ([`codec`])
//! - an exclusive file lock so only one process appends ([`FileLock`])
//! - replay-on-open recovery through the same [`crate::ledger`] code
//!   used for audit replay
//!
//! The entity store is never written separately: the ledger file is the
//! single source of truth and materialized state is rebuilt from it.

mod codec;
mod file_lock;
mod log;

pub use file_lock::FileLock;
pub use log::{DurableConfig, DurableStore};
