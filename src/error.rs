//! Error types for canonize.
//!
//! All errors are strongly typed using thiserror. The taxonomy follows the
//! processing boundary of a single candidate: validation failures are
//! reported and dropped, concurrency races are retryable, and storage
//! failures abort the whole operation atomically. Ambiguous matches and
//! field conflicts are first-class outcomes, not errors.

use thiserror::Error;

use crate::entity::{EntityCategory, EntityId};

/// Validation errors raised by the schema validator.
///
/// A single candidate can violate several constraints at once; the
/// validator collects every violation into a [`CandidateRejection`]
/// instead of stopping at the first.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("candidate name cannot be empty")]
    EmptyName,

    #[error("candidate name is too short: {length} chars (minimum {minimum})")]
    NameTooShort { length: usize, minimum: usize },

    #[error("confidence value {value} is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange { value: f32 },

    #[error("unknown category: {category}")]
    UnknownCategory { category: String },

    #[error("malformed source URL: {url}")]
    MalformedSourceUrl { url: String },

    #[error("attribute key cannot be empty")]
    EmptyAttributeKey,

    #[error("attribute '{key}' has type {actual}, expected {expected} for category {category}")]
    AttributeTypeMismatch {
        key: String,
        actual: &'static str,
        expected: &'static str,
        category: EntityCategory,
    },

    #[error("relationship candidate is missing its subject/predicate/object observation")]
    MissingRelationship,

    #[error("non-relationship candidate carries a relationship observation")]
    UnexpectedRelationship,

    #[error("relationship endpoint cannot itself be a relationship")]
    RelationshipEndpointCategory,

    #[error("relationship predicate cannot be empty")]
    EmptyPredicate,
}

/// A structured rejection: the candidate never reached the merge path.
///
/// Rejections are non-fatal to the caller. The record is dropped from the
/// pipeline and reported; nothing is partially merged.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("candidate '{name}' rejected: {}", format_violations(.violations))]
pub struct CandidateRejection {
    /// The proposed name of the rejected candidate (possibly empty).
    pub name: String,
    /// Every constraint the candidate violated.
    pub violations: Vec<ValidationError>,
}

fn format_violations(violations: &[ValidationError]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised while merging a validated candidate.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The optimistic-concurrency retry budget was exhausted.
    ///
    /// No partial state was persisted. The caller may resubmit.
    #[error("entity {entity} changed concurrently; retry budget of {budget} exhausted")]
    RetryExhausted { entity: EntityId, budget: u32 },

    /// The target entity disappeared between match and merge.
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    /// A conflict resolution referenced a field that has no open dispute.
    #[error("no open dispute on entity {entity} for field '{key}'")]
    NoOpenDispute { entity: EntityId, key: String },

    /// A conflict resolution chose a value none of the disputing
    /// observations hold.
    #[error("resolution for entity {entity} field '{key}' is not among the competing values")]
    ResolutionNotAmongCompeting { entity: EntityId, key: String },

    /// An explicit duplicate merge named the same entity twice.
    #[error("cannot merge entity {0} into itself")]
    SelfMerge(EntityId),

    /// An explicit duplicate merge crossed categories.
    #[error("cannot merge {loser} ({loser_category}) into {winner} ({winner_category}): categories differ")]
    CategoryMismatch {
        winner: EntityId,
        winner_category: EntityCategory,
        loser: EntityId,
        loser_category: EntityCategory,
    },
}

/// Errors raised by the submission runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The bounded submission queue is full.
    #[error("submission queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The runtime has shut down and no longer accepts work.
    #[error("runtime has shut down")]
    ShutDown,
}

/// Top-level error type for canonize operations.
#[derive(Debug, Error)]
pub enum CanonError {
    #[error("validation: {0}")]
    Validation(#[from] CandidateRejection),

    #[error("merge: {0}")]
    Merge(#[from] MergeError),

    #[error("storage: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("runtime: {0}")]
    Runtime(#[from] RuntimeError),
}

impl CanonError {
    /// Returns true if the operation may succeed on resubmission.
    ///
    /// Validation failures will not change on retry. Concurrency losses and
    /// queue backpressure are transient by design.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Merge(e) => matches!(e, MergeError::RetryExhausted { .. }),
            Self::Storage(e) => e.is_retryable(),
            Self::Runtime(e) => matches!(e, RuntimeError::QueueFull { .. }),
        }
    }

    /// Returns true if this is a validation rejection.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Result type alias for canonize operations.
pub type CanonResult<T> = Result<T, CanonError>;
