//! # canonize — entity resolution & merge engine
//!
//! canonize reconciles fuzzy, partially-overlapping, confidence-scored
//! observations from many independent submissions into one canonical
//! record per real-world entity, while preserving full source
//! provenance and surfacing conflicting claims instead of guessing.
//!
//! ## Core concepts
//!
//! - **Candidate**: an unverified, confidence-scored observation
//!   produced upstream
//! - **Entity**: the single authoritative record for one real-world
//!   subject, with aliases, attributes, sources, and a version
//! - **Provenance ledger**: an append-only, totally ordered log whose
//!   replay reproduces the store exactly
//! - **Conflict**: a disagreement the engine declines to auto-resolve
//!
//! ## Usage
//!
//! ```rust
//! use canonize::{CandidateRecord, EntityCategory, MergeEngine, MergeOutcome};
//!
//! let engine = MergeEngine::in_memory(Default::default());
//!
//! let created = engine.submit(
//!     CandidateRecord::new(
//!         EntityCategory::Organization,
//!         "Example Corp",
//!         "https://example.org/articles/1",
//!     )
//!     .confidence(0.9)
//!     .attribute("sector", "technology", 0.8),
//! )?;
//! assert_eq!(created.outcome, MergeOutcome::Created);
//!
//! // A punctuation-level variant merges instead of duplicating.
//! let merged = engine.submit(CandidateRecord::new(
//!     EntityCategory::Organization,
//!     "Example Corp.",
//!     "https://other.example.net/articles/2",
//! ))?;
//! assert_eq!(merged.outcome, MergeOutcome::Merged);
//! assert_eq!(merged.entity, created.entity);
//! # Ok::<(), canonize::CanonError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod candidate;
pub mod confidence;
pub mod entity;
pub mod error;
pub mod normalize;
pub mod relationship;
pub mod source;
pub mod value;

// Pipeline components
pub mod config;
pub mod engine;
pub mod index;
pub mod ledger;
pub mod matcher;
pub mod resolver;
pub mod storage;
pub mod validate;

// Re-export primary types at crate root for convenience
pub use candidate::{AttributeObservation, CandidateRecord, EndpointRef, RelationshipObservation};
pub use confidence::Confidence;
pub use config::{CorroborationConfig, EngineConfig, RuntimeConfig};
pub use engine::runtime::{EngineRuntime, SubmissionTicket};
pub use engine::{BatchReport, BatchSummary, EngineStats, MergeEngine};
pub use entity::{Entity, EntityCategory, EntityId, FieldDispute, FieldValue};
pub use error::{
    CandidateRejection, CanonError, CanonResult, MergeError, RuntimeError, ValidationError,
};
pub use index::CanonicalIndex;
pub use ledger::{LedgerOp, ProvenanceEntry, ProvenanceSubject, ReplayState};
pub use matcher::{FuzzyMatcher, MatchCandidate, MatchDecision, MatcherConfig};
pub use relationship::{EndpointState, LinkSide, RelationshipId, RelationshipRecord};
pub use resolver::{MergeOutcome, MergeReceipt, MergeResolver, PendingConflict};
pub use source::SourceRef;
pub use storage::{KnowledgeStore, MemoryStore, StorageError};
pub use validate::{SchemaValidator, ValidatedCandidate};
pub use value::AttributeValue;

#[cfg(feature = "persistent")]
pub use storage::{DurableConfig, DurableStore};
