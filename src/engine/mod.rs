//! The merge engine facade.
//!
//! Wires the pipeline together — schema validator, fuzzy matcher over
//! the canonical index, merge resolver over the knowledge store — and
//! exposes the three external surfaces:
//!
//! - the inbound candidate interface ([`MergeEngine::submit`] and
//!   [`MergeEngine::submit_batch`]),
//! - the outbound read-only query interface (entities, relationships,
//!   provenance, stats), and
//! - the conflict adjudication interface
//!   ([`MergeEngine::pending_conflicts`] /
//!   [`MergeEngine::resolve_conflict`]).
//!
//! The engine never exposes a write path to entities other than
//! candidate submission and adjudication.

pub mod runtime;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::candidate::CandidateRecord;
use crate::config::EngineConfig;
use crate::entity::{Entity, EntityCategory, EntityId};
use crate::error::{CandidateRejection, CanonError, CanonResult};
use crate::index::CanonicalIndex;
use crate::ledger::{ProvenanceEntry, ReplayState};
use crate::relationship::{RelationshipId, RelationshipRecord};
use crate::resolver::{MergeOutcome, MergeReceipt, MergeResolver, PendingConflict};
use crate::storage::{KnowledgeStore, MemoryStore, StorageError};
use crate::validate::SchemaValidator;
use crate::value::AttributeValue;

/// Counts for one batch submission, in the shape the reporting layer
/// renders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Total records submitted.
    pub submitted: usize,
    /// New canonical entities.
    pub created: usize,
    /// Merged into existing entities.
    pub merged: usize,
    /// Held for corroboration.
    pub corroborating: usize,
    /// Raised conflicts.
    pub conflicts: usize,
    /// Rejected by the schema validator.
    pub rejected: usize,
    /// Failed transiently (retry budget, storage); resubmittable.
    pub failed: usize,
}

/// Per-record results plus the summary for one batch.
#[derive(Debug)]
pub struct BatchReport {
    /// One result per submitted record, in submission order.
    pub results: Vec<CanonResult<MergeReceipt>>,
    /// Aggregate counts.
    pub summary: BatchSummary,
}

/// A point-in-time view of what the engine holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Live (non-superseded) entities per category.
    pub entities_by_category: BTreeMap<EntityCategory, usize>,
    /// Relationship linking records.
    pub relationships: usize,
    /// Open field disputes.
    pub pending_conflicts: usize,
    /// Candidates held for corroboration.
    pub pending_corroborations: usize,
    /// Committed ledger entries.
    pub ledger_entries: u64,
}

/// The entity resolution & merge engine.
///
/// # Examples
///
/// ```
/// use canonize::{CandidateRecord, EntityCategory, MergeEngine, MergeOutcome};
///
/// let engine = MergeEngine::in_memory(Default::default());
/// let receipt = engine
///     .submit(CandidateRecord::new(
///         EntityCategory::Organization,
///         "Example Corp",
///         "https://example.org/articles/1",
///     ))
///     .unwrap();
/// assert_eq!(receipt.outcome, MergeOutcome::Created);
/// ```
pub struct MergeEngine {
    validator: SchemaValidator,
    resolver: MergeResolver,
    store: Arc<dyn KnowledgeStore>,
}

impl MergeEngine {
    /// Creates an engine over the in-memory backend.
    #[must_use]
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), config)
            .expect("empty in-memory store always opens")
    }

    /// Creates an engine over an existing backend, rebuilding the
    /// canonical index from the stored entities.
    ///
    /// # Errors
    /// Returns [`CanonError::Storage`] if the backend cannot be read.
    pub fn with_store(
        store: Arc<dyn KnowledgeStore>,
        config: EngineConfig,
    ) -> CanonResult<Self> {
        let snapshot = store.snapshot()?;
        let index = Arc::new(CanonicalIndex::rebuild(snapshot.entities.values()));
        debug!(aliases = index.len(), "canonical index rebuilt");
        let resolver = MergeResolver::new(Arc::clone(&store), index, config);
        Ok(Self {
            validator: SchemaValidator::new(),
            resolver,
            store,
        })
    }

    // ------------------------------------------------------------------
    // Inbound candidate interface
    // ------------------------------------------------------------------

    /// Submits one candidate record.
    ///
    /// # Errors
    /// - [`CanonError::Validation`] with the structured rejection; no
    ///   state changed.
    /// - [`CanonError::Merge`] on an exhausted retry budget; retryable.
    /// - [`CanonError::Storage`] if the backend failed; the operation
    ///   aborted atomically.
    pub fn submit(&self, candidate: CandidateRecord) -> CanonResult<MergeReceipt> {
        let validated = self.validator.validate(candidate)?;
        self.resolver.process(validated)
    }

    /// Submits a batch. Rejections and transient failures never abort
    /// the batch; each record gets its own result.
    #[must_use]
    pub fn submit_batch(&self, candidates: Vec<CandidateRecord>) -> BatchReport {
        let mut summary = BatchSummary {
            submitted: candidates.len(),
            ..BatchSummary::default()
        };
        let mut results = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let result = self.submit(candidate);
            match &result {
                Ok(receipt) => match receipt.outcome {
                    MergeOutcome::Created => summary.created += 1,
                    MergeOutcome::Merged => summary.merged += 1,
                    MergeOutcome::Corroborating => summary.corroborating += 1,
                    MergeOutcome::Conflict => summary.conflicts += 1,
                },
                Err(e) if e.is_validation() => summary.rejected += 1,
                Err(_) => summary.failed += 1,
            }
            results.push(result);
        }

        debug!(
            submitted = summary.submitted,
            created = summary.created,
            merged = summary.merged,
            rejected = summary.rejected,
            "batch processed"
        );
        BatchReport { results, summary }
    }

    /// Validates a candidate without touching the merge path.
    ///
    /// # Errors
    /// Returns the structured rejection for a malformed candidate.
    pub fn check(&self, candidate: CandidateRecord) -> Result<(), CandidateRejection> {
        self.validator.validate(candidate).map(|_| ())
    }

    /// Finalizes every candidate still held for corroboration.
    ///
    /// # Errors
    /// Returns the first merge or storage failure encountered.
    pub fn flush_pending(&self) -> CanonResult<Vec<MergeReceipt>> {
        self.resolver.flush_pending()
    }

    // ------------------------------------------------------------------
    // Outbound query interface (read-only)
    // ------------------------------------------------------------------

    /// Gets an entity by ID, following duplicate-merge redirects.
    ///
    /// # Errors
    /// Returns [`CanonError::Storage`] if the backend cannot be read.
    pub fn entity(&self, id: EntityId) -> CanonResult<Option<Entity>> {
        Ok(self.store.entity(id)?)
    }

    /// Gets the exact stored record, without following redirects.
    ///
    /// # Errors
    /// Returns [`CanonError::Storage`] if the backend cannot be read.
    pub fn entity_raw(&self, id: EntityId) -> CanonResult<Option<Entity>> {
        Ok(self.store.entity_raw(id)?)
    }

    /// Lists live entities of a category.
    ///
    /// # Errors
    /// Returns [`CanonError::Storage`] if the backend cannot be read.
    pub fn entities_by_category(
        &self,
        category: EntityCategory,
    ) -> CanonResult<Vec<Entity>> {
        Ok(self.store.entities_by_category(category)?)
    }

    /// Gets a relationship record by ID.
    ///
    /// # Errors
    /// Returns [`CanonError::Storage`] if the backend cannot be read.
    pub fn relationship(
        &self,
        id: RelationshipId,
    ) -> CanonResult<Option<RelationshipRecord>> {
        Ok(self.store.relationship(id)?)
    }

    /// Lists relationship records touching an entity.
    ///
    /// # Errors
    /// Returns [`CanonError::Storage`] if the backend cannot be read.
    pub fn relationships_for(&self, entity: EntityId) -> CanonResult<Vec<RelationshipRecord>> {
        Ok(self.store.relationships_for(entity)?)
    }

    /// Ordered provenance entries for one entity — the full audit trail,
    /// superseded values included.
    ///
    /// # Errors
    /// Returns [`CanonError::Storage`] if the backend cannot be read.
    pub fn replay(&self, entity: EntityId) -> CanonResult<Vec<ProvenanceEntry>> {
        Ok(self.store.ledger_for_entity(entity)?)
    }

    /// Rebuilds the entire store state from the ledger.
    ///
    /// # Errors
    /// Returns [`CanonError::Storage`] if the ledger cannot be read or
    /// does not replay.
    pub fn full_replay(&self) -> CanonResult<ReplayState> {
        let entries = self.store.ledger()?;
        ReplayState::from_entries(&entries)
            .map_err(|e| CanonError::Storage(StorageError::Corrupt(e.to_string())))
    }

    /// Verifies that replaying the ledger reproduces the live state.
    ///
    /// # Errors
    /// Returns [`CanonError::Storage`] if either side cannot be read.
    pub fn verify_replay(&self) -> CanonResult<bool> {
        let replayed = self.full_replay()?.digest();
        let live = self.store.state_digest()?;
        Ok(replayed == live)
    }

    /// Current engine statistics.
    ///
    /// # Errors
    /// Returns [`CanonError::Storage`] if the backend cannot be read.
    pub fn stats(&self) -> CanonResult<EngineStats> {
        let mut entities_by_category = BTreeMap::new();
        for category in EntityCategory::ENTITY_CATEGORIES {
            entities_by_category
                .insert(category, self.store.entities_by_category(category)?.len());
        }
        Ok(EngineStats {
            entities_by_category,
            relationships: self.store.relationships()?.len(),
            pending_conflicts: self.resolver.pending_conflicts()?.len(),
            pending_corroborations: self.resolver.pending_corroborations(),
            ledger_entries: self.store.ledger_len()?,
        })
    }

    // ------------------------------------------------------------------
    // Conflict adjudication interface
    // ------------------------------------------------------------------

    /// Lists pending conflicts: entity, field, and the competing values
    /// with their sources.
    ///
    /// # Errors
    /// Returns [`CanonError::Storage`] if the backend cannot be read.
    pub fn pending_conflicts(&self) -> CanonResult<Vec<PendingConflict>> {
        self.resolver.pending_conflicts()
    }

    /// Applies a resolution: the chosen value (one of the competing
    /// observations) becomes the accepted value, with the rationale
    /// recorded in the ledger.
    ///
    /// # Errors
    /// - [`crate::MergeError::NoOpenDispute`] if the field is not
    ///   disputed.
    /// - [`crate::MergeError::ResolutionNotAmongCompeting`] if the value
    ///   matches none of the competing observations.
    pub fn resolve_conflict(
        &self,
        entity: EntityId,
        key: &str,
        chosen: &AttributeValue,
        rationale: &str,
    ) -> CanonResult<MergeReceipt> {
        self.resolver.resolve_conflict(entity, key, chosen, rationale)
    }

    /// Explicitly merges a post-hoc duplicate into its survivor. The
    /// loser keeps its ID and redirects forever.
    ///
    /// # Errors
    /// - [`crate::MergeError::SelfMerge`] /
    ///   [`crate::MergeError::CategoryMismatch`] on invalid pairs.
    /// - [`crate::MergeError::RetryExhausted`] under sustained
    ///   contention.
    pub fn merge_duplicates(
        &self,
        winner: EntityId,
        loser: EntityId,
    ) -> CanonResult<Entity> {
        self.resolver.merge_duplicates(winner, loser)
    }
}
