//! Thread-safe in-memory storage backend.
//!
//! The default backend: materialized state plus the ledger, under one
//! lock so a commit is atomic by construction. Intended for embedded
//! usage, tests, and as the reference implementation the durable backend
//! must agree with.

use std::sync::RwLock;

use crate::entity::{Entity, EntityCategory, EntityId};
use crate::ledger::{LedgerOp, ProvenanceEntry, ReplayState};
use crate::relationship::{RelationshipId, RelationshipRecord};
use crate::storage::traits::{
    CommitReceipt, KnowledgeStore, StorageError, Transaction,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) state: ReplayState,
    pub(crate) ledger: Vec<ProvenanceEntry>,
}

impl StoreState {
    /// Checks guards and builds the sequenced entries without mutating
    /// anything. The durable backend persists the entries between
    /// `prepare` and `install`; a persistence failure leaves the state
    /// untouched.
    pub(crate) fn prepare(
        &self,
        txn: &Transaction,
    ) -> Result<(Vec<ProvenanceEntry>, CommitReceipt), StorageError> {
        if txn.entries.is_empty() {
            return Err(StorageError::Backend(
                "transaction carries no ledger entries".to_string(),
            ));
        }

        for guard in &txn.guards {
            let current = self
                .state
                .entities
                .get(&guard.entity)
                .ok_or(StorageError::EntityNotFound(guard.entity))?;
            if current.version != guard.expected {
                return Err(StorageError::VersionConflict {
                    entity: guard.entity,
                    expected: guard.expected,
                    actual: current.version,
                });
            }
        }

        let first_sequence = self.ledger.len() as u64 + 1;
        let mut sequence = first_sequence;
        let mut entries = Vec::with_capacity(txn.entries.len());
        for draft in &txn.entries {
            entries.push(ProvenanceEntry {
                sequence,
                subject: draft.subject,
                op: draft.op.clone(),
                source: draft.source.clone(),
                timestamp: draft.timestamp,
                resulting_version: draft.resulting_version,
            });
            sequence += 1;
        }

        let receipt = CommitReceipt {
            first_sequence,
            last_sequence: sequence - 1,
        };
        Ok((entries, receipt))
    }

    /// Applies a prepared transaction.
    pub(crate) fn install(&mut self, txn: &Transaction, entries: Vec<ProvenanceEntry>) {
        for entity in &txn.entities {
            self.state.entities.insert(entity.id, entity.clone());
        }
        for record in &txn.relationships {
            self.state.relationships.insert(record.id, record.clone());
        }
        self.ledger.extend(entries);
    }

    pub(crate) fn resolve_canonical(
        &self,
        id: EntityId,
    ) -> Result<Option<EntityId>, StorageError> {
        let mut current = id;
        for _ in 0..128 {
            let Some(entity) = self.state.entities.get(&current) else {
                return Ok(None);
            };
            let Some(next) = entity.merged_into else {
                return Ok(Some(current));
            };
            if next == current {
                return Err(StorageError::Corrupt(
                    "entity redirect contains a self-cycle".to_string(),
                ));
            }
            current = next;
        }
        Err(StorageError::Corrupt(
            "entity redirect resolution exceeded hop limit".to_string(),
        ))
    }
}

/// Returns true if a ledger entry concerns the given entity, either
/// directly or through a relationship it participates in.
pub(crate) fn entry_touches(entry: &ProvenanceEntry, id: EntityId) -> bool {
    if entry.subject.entity() == Some(id) {
        return true;
    }
    match &entry.op {
        LedgerOp::Link { record } => record.touches(id),
        LedgerOp::LinkEndpointResolved { entity, .. } => *entity == id,
        LedgerOp::Redirect { into } => *into == id,
        _ => false,
    }
}

/// Thread-safe in-memory knowledge store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<StoreState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with previously committed entries
    /// (durable-backend reopen).
    pub(crate) fn from_parts(state: ReplayState, ledger: Vec<ProvenanceEntry>) -> Self {
        Self {
            inner: RwLock::new(StoreState { state, ledger }),
        }
    }

    /// Commits with a persistence hook between guard check and state
    /// mutation. If `persist` fails, nothing is applied.
    pub(crate) fn commit_with<F>(
        &self,
        txn: &Transaction,
        persist: F,
    ) -> Result<CommitReceipt, StorageError>
    where
        F: FnOnce(&[ProvenanceEntry]) -> Result<(), StorageError>,
    {
        let mut inner = self.inner.write().map_err(|_| lock_err("commit"))?;
        let (entries, receipt) = inner.prepare(txn)?;
        persist(&entries)?;
        inner.install(txn, entries);
        Ok(receipt)
    }
}

impl KnowledgeStore for MemoryStore {
    fn commit(&self, txn: Transaction) -> Result<CommitReceipt, StorageError> {
        self.commit_with(&txn, |_| Ok(()))
    }

    fn entity(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        let inner = self.inner.read().map_err(|_| lock_err("entity"))?;
        let Some(canonical) = inner.resolve_canonical(id)? else {
            return Ok(None);
        };
        Ok(inner.state.entities.get(&canonical).cloned())
    }

    fn entity_raw(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        let inner = self.inner.read().map_err(|_| lock_err("entity_raw"))?;
        Ok(inner.state.entities.get(&id).cloned())
    }

    fn entities_by_category(
        &self,
        category: EntityCategory,
    ) -> Result<Vec<Entity>, StorageError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| lock_err("entities_by_category"))?;
        Ok(inner
            .state
            .entities
            .values()
            .filter(|e| e.category == category && !e.is_superseded())
            .cloned()
            .collect())
    }

    fn relationship(
        &self,
        id: RelationshipId,
    ) -> Result<Option<RelationshipRecord>, StorageError> {
        let inner = self.inner.read().map_err(|_| lock_err("relationship"))?;
        Ok(inner.state.relationships.get(&id).cloned())
    }

    fn relationships_for(
        &self,
        entity: EntityId,
    ) -> Result<Vec<RelationshipRecord>, StorageError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| lock_err("relationships_for"))?;
        Ok(inner
            .state
            .relationships
            .values()
            .filter(|r| r.touches(entity))
            .cloned()
            .collect())
    }

    fn relationships(&self) -> Result<Vec<RelationshipRecord>, StorageError> {
        let inner = self.inner.read().map_err(|_| lock_err("relationships"))?;
        Ok(inner.state.relationships.values().cloned().collect())
    }

    fn ledger(&self) -> Result<Vec<ProvenanceEntry>, StorageError> {
        let inner = self.inner.read().map_err(|_| lock_err("ledger"))?;
        Ok(inner.ledger.clone())
    }

    fn ledger_for_entity(&self, id: EntityId) -> Result<Vec<ProvenanceEntry>, StorageError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| lock_err("ledger_for_entity"))?;
        Ok(inner
            .ledger
            .iter()
            .filter(|entry| entry_touches(entry, id))
            .cloned()
            .collect())
    }

    fn ledger_len(&self) -> Result<u64, StorageError> {
        let inner = self.inner.read().map_err(|_| lock_err("ledger_len"))?;
        Ok(inner.ledger.len() as u64)
    }

    fn snapshot(&self) -> Result<ReplayState, StorageError> {
        let inner = self.inner.read().map_err(|_| lock_err("snapshot"))?;
        Ok(inner.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::confidence::Confidence;
    use crate::ledger::ProvenanceSubject;
    use crate::storage::traits::EntryDraft;

    fn create_txn(entity: &Entity) -> Transaction {
        Transaction {
            guards: Vec::new(),
            entities: vec![entity.clone()],
            relationships: Vec::new(),
            entries: vec![EntryDraft {
                subject: ProvenanceSubject::Entity(entity.id),
                op: LedgerOp::Create {
                    entity: entity.clone(),
                },
                source: None,
                timestamp: entity.created_at,
                resulting_version: Some(1),
            }],
        }
    }

    fn sample_entity(name: &str) -> Entity {
        Entity::new(
            name,
            EntityCategory::Organization,
            Confidence::clamped(0.9),
            Utc::now(),
        )
    }

    #[test]
    fn commit_assigns_contiguous_sequences() {
        let store = MemoryStore::new();
        let a = sample_entity("A Corp");
        let b = sample_entity("B Corp");

        let r1 = store.commit(create_txn(&a)).unwrap();
        let r2 = store.commit(create_txn(&b)).unwrap();

        assert_eq!(r1.first_sequence, 1);
        assert_eq!(r2.first_sequence, 2);
        assert_eq!(store.ledger_len().unwrap(), 2);
    }

    #[test]
    fn version_guard_rejects_stale_commit() {
        let store = MemoryStore::new();
        let mut entity = sample_entity("A Corp");
        store.commit(create_txn(&entity)).unwrap();

        // Simulate a writer that read version 1, while another commit
        // advanced the entity to version 2.
        entity.bump(Utc::now());
        let winning = Transaction {
            guards: vec![crate::storage::traits::VersionGuard {
                entity: entity.id,
                expected: 1,
            }],
            entities: vec![entity.clone()],
            relationships: Vec::new(),
            entries: vec![EntryDraft {
                subject: ProvenanceSubject::Entity(entity.id),
                op: LedgerOp::AddAlias {
                    alias: "A Corporation".to_string(),
                },
                source: None,
                timestamp: Utc::now(),
                resulting_version: Some(2),
            }],
        };
        store.commit(winning.clone()).unwrap();

        let err = store.commit(winning).unwrap_err();
        assert!(matches!(err, StorageError::VersionConflict { .. }));
        // The failed commit left no trace.
        assert_eq!(store.ledger_len().unwrap(), 2);
    }

    #[test]
    fn empty_transaction_is_rejected() {
        let store = MemoryStore::new();
        let err = store.commit(Transaction::new()).unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
    }

    #[test]
    fn entity_follows_redirects() {
        let store = MemoryStore::new();
        let winner = sample_entity("Example Corp");
        let mut loser = sample_entity("Example Corporation");
        store.commit(create_txn(&winner)).unwrap();
        store.commit(create_txn(&loser)).unwrap();

        loser.merged_into = Some(winner.id);
        loser.bump(Utc::now());
        let redirect = Transaction {
            guards: Vec::new(),
            entities: vec![loser.clone()],
            relationships: Vec::new(),
            entries: vec![EntryDraft {
                subject: ProvenanceSubject::Entity(loser.id),
                op: LedgerOp::Redirect { into: winner.id },
                source: None,
                timestamp: Utc::now(),
                resulting_version: Some(loser.version),
            }],
        };
        store.commit(redirect).unwrap();

        let resolved = store.entity(loser.id).unwrap().unwrap();
        assert_eq!(resolved.id, winner.id);
        // The raw record is still there, marked superseded.
        let raw = store.entity_raw(loser.id).unwrap().unwrap();
        assert!(raw.is_superseded());
        // Superseded entities drop out of category listings.
        let orgs = store
            .entities_by_category(EntityCategory::Organization)
            .unwrap();
        assert_eq!(orgs.len(), 1);
    }

    #[test]
    fn replay_of_ledger_matches_snapshot() {
        let store = MemoryStore::new();
        store.commit(create_txn(&sample_entity("A Corp"))).unwrap();
        store.commit(create_txn(&sample_entity("B Corp"))).unwrap();

        let replayed = ReplayState::from_entries(&store.ledger().unwrap()).unwrap();
        assert_eq!(replayed.digest(), store.state_digest().unwrap());
    }
}
