//! The storage contract for the knowledge base.
//!
//! A backend stores canonical entities, relationship records, and the
//! provenance ledger. The one mutating operation is [`KnowledgeStore::commit`],
//! which applies a whole transaction atomically: the ledger entries and
//! the record upserts for one merge operation land together or not at
//! all, and version guards enforce optimistic concurrency.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::entity::{Entity, EntityCategory, EntityId};
use crate::ledger::{LedgerOp, ProvenanceEntry, ProvenanceSubject, ReplayState};
use crate::relationship::{RelationshipId, RelationshipRecord};
use crate::source::SourceRef;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Entity not found.
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    /// Relationship record not found.
    #[error("relationship not found: {0}")]
    RelationshipNotFound(RelationshipId),

    /// A version guard failed: the entity moved since it was read.
    #[error("version conflict on {entity}: expected {expected}, found {actual}")]
    VersionConflict {
        entity: EntityId,
        expected: u64,
        actual: u64,
    },

    /// Key already exists.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Stored data failed integrity checks.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// Backend error.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Version conflicts are transient: the merge resolver re-fetches and
    /// retries. Everything else aborts the operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Optimistic-concurrency guard: the commit only proceeds if the entity
/// is still at the expected version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionGuard {
    /// Guarded entity.
    pub entity: EntityId,
    /// Version the transaction was computed against.
    pub expected: u64,
}

/// A ledger entry awaiting its commit sequence number.
#[derive(Debug, Clone)]
pub struct EntryDraft {
    /// What the entry is about.
    pub subject: ProvenanceSubject,
    /// The recorded operation.
    pub op: LedgerOp,
    /// Driving source, if any.
    pub source: Option<SourceRef>,
    /// Operation time, set by the resolver.
    pub timestamp: DateTime<Utc>,
    /// Subject entity version after the operation.
    pub resulting_version: Option<u64>,
}

/// One atomic unit of change: record upserts plus the ledger entries
/// describing them.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    /// Version guards checked before anything is applied.
    pub guards: Vec<VersionGuard>,
    /// Full post-state of every entity the transaction touches.
    pub entities: Vec<Entity>,
    /// Full post-state of every relationship the transaction touches.
    pub relationships: Vec<RelationshipRecord>,
    /// Ledger entries, in order; sequences are assigned at commit.
    pub entries: Vec<EntryDraft>,
}

impl Transaction {
    /// An empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a version guard.
    #[must_use]
    pub fn guard(mut self, entity: EntityId, expected: u64) -> Self {
        self.guards.push(VersionGuard { entity, expected });
        self
    }

    /// Returns true if the transaction changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty() && self.entries.is_empty()
    }
}

/// Sequence range assigned to a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Sequence of the first entry in the transaction.
    pub first_sequence: u64,
    /// Sequence of the last entry in the transaction.
    pub last_sequence: u64,
}

/// Durable, queryable storage for the knowledge base.
///
/// All mutation goes through the merge resolver, which is the sole
/// writer of record; readers get clones, never references into shared
/// state.
pub trait KnowledgeStore: Send + Sync {
    /// Atomically applies a transaction.
    ///
    /// # Errors
    /// - [`StorageError::VersionConflict`] if a guard fails; nothing is
    ///   applied.
    /// - [`StorageError::Backend`] if persistence fails; nothing is
    ///   applied.
    fn commit(&self, txn: Transaction) -> Result<CommitReceipt, StorageError>;

    /// Gets an entity by ID, following duplicate-merge redirects.
    fn entity(&self, id: EntityId) -> Result<Option<Entity>, StorageError>;

    /// Gets the exact record for an ID, superseded or not.
    fn entity_raw(&self, id: EntityId) -> Result<Option<Entity>, StorageError>;

    /// Lists non-superseded entities of a category.
    fn entities_by_category(
        &self,
        category: EntityCategory,
    ) -> Result<Vec<Entity>, StorageError>;

    /// Gets a relationship record by ID.
    fn relationship(
        &self,
        id: RelationshipId,
    ) -> Result<Option<RelationshipRecord>, StorageError>;

    /// Lists relationship records touching an entity.
    fn relationships_for(
        &self,
        entity: EntityId,
    ) -> Result<Vec<RelationshipRecord>, StorageError>;

    /// Lists every relationship record.
    fn relationships(&self) -> Result<Vec<RelationshipRecord>, StorageError>;

    /// Full ledger scan, in sequence order.
    fn ledger(&self) -> Result<Vec<ProvenanceEntry>, StorageError>;

    /// Ordered ledger entries about one entity.
    fn ledger_for_entity(&self, id: EntityId) -> Result<Vec<ProvenanceEntry>, StorageError>;

    /// Number of committed ledger entries.
    fn ledger_len(&self) -> Result<u64, StorageError>;

    /// Clone of the whole materialized state.
    fn snapshot(&self) -> Result<ReplayState, StorageError>;

    /// Stable digest of the materialized state.
    fn state_digest(&self) -> Result<[u8; 32], StorageError> {
        Ok(self.snapshot()?.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: the store must stay object-safe.
    fn _assert_object_safe(_: &dyn KnowledgeStore) {}

    #[test]
    fn version_conflict_is_retryable() {
        let err = StorageError::VersionConflict {
            entity: EntityId::new(),
            expected: 3,
            actual: 4,
        };
        assert!(err.is_retryable());
        assert!(!StorageError::Backend("disk on fire".to_string()).is_retryable());
    }

    #[test]
    fn transaction_builder() {
        let id = EntityId::new();
        let txn = Transaction::new().guard(id, 2);
        assert!(txn.is_empty());
        assert_eq!(txn.guards, vec![VersionGuard { entity: id, expected: 2 }]);
    }
}
