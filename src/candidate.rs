//! Candidate records: unverified observations entering the engine.
//!
//! Candidates are produced upstream by the text-extraction step and are
//! ephemeral: they either pass the schema validator and reach the merge
//! resolver, or are rejected and dropped. Nothing in a candidate is
//! trusted until validated.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::EntityCategory;
use crate::value::AttributeValue;

/// One key→value observation with its extraction confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeObservation {
    /// The observed value.
    pub value: AttributeValue,
    /// Raw confidence as reported by the extractor; clamped during
    /// validation.
    pub confidence: f32,
}

/// One endpoint of a relationship observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRef {
    /// Proposed name of the endpoint entity.
    pub name: String,
    /// Category the endpoint was extracted as.
    pub category: EntityCategory,
}

/// A subject–predicate–object observation linking two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipObservation {
    /// The relationship's subject (e.g. a person).
    pub subject: EndpointRef,
    /// What connects the two (e.g. "supplies", "operates_in", "leads").
    pub predicate: String,
    /// The relationship's object (e.g. an organization).
    pub object: EndpointRef,
}

/// An unverified, confidence-scored observation about an entity.
///
/// # Examples
///
/// ```
/// use canonize::{CandidateRecord, EntityCategory};
///
/// let candidate = CandidateRecord::new(
///     EntityCategory::Organization,
///     "Example Corp",
///     "https://example.org/articles/1",
/// )
/// .confidence(0.9)
/// .attribute("sector", "technology", 0.8);
///
/// assert_eq!(candidate.name, "Example Corp");
/// assert_eq!(candidate.attributes.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// What kind of entity this observation describes.
    pub category: EntityCategory,

    /// Proposed name, as extracted.
    pub name: String,

    /// Key→value attribute observations.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeObservation>,

    /// URL of the document the observation was extracted from.
    pub source_url: String,

    /// When the document was retrieved.
    pub retrieved_at: DateTime<Utc>,

    /// Extraction confidence for this candidate as a whole.
    pub confidence: f32,

    /// Present iff `category` is [`EntityCategory::Relationship`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<RelationshipObservation>,
}

impl CandidateRecord {
    /// Starts a candidate with the given category, name, and source URL.
    ///
    /// Extraction confidence defaults to 0.5; set it with
    /// [`CandidateRecord::confidence`].
    #[must_use]
    pub fn new(
        category: EntityCategory,
        name: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            category,
            name: name.into(),
            attributes: BTreeMap::new(),
            source_url: source_url.into(),
            retrieved_at: Utc::now(),
            confidence: 0.5,
            relationship: None,
        }
    }

    /// Starts a relationship candidate from a subject–predicate–object
    /// triple. The candidate's name is derived from the triple.
    #[must_use]
    pub fn relationship(
        subject: EndpointRef,
        predicate: impl Into<String>,
        object: EndpointRef,
        source_url: impl Into<String>,
    ) -> Self {
        let predicate = predicate.into();
        let name = format!("{} {} {}", subject.name, predicate, object.name);
        Self {
            category: EntityCategory::Relationship,
            name,
            attributes: BTreeMap::new(),
            source_url: source_url.into(),
            retrieved_at: Utc::now(),
            confidence: 0.5,
            relationship: Some(RelationshipObservation {
                subject,
                predicate,
                object,
            }),
        }
    }

    /// Sets the extraction confidence.
    #[must_use]
    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Sets the retrieval timestamp.
    #[must_use]
    pub fn retrieved(mut self, at: DateTime<Utc>) -> Self {
        self.retrieved_at = at;
        self
    }

    /// Adds an attribute observation.
    #[must_use]
    pub fn attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
        confidence: f32,
    ) -> Self {
        self.attributes.insert(
            key.into(),
            AttributeObservation {
                value: value.into(),
                confidence,
            },
        );
        self
    }
}

impl EndpointRef {
    /// Creates an endpoint reference.
    #[must_use]
    pub fn new(name: impl Into<String>, category: EntityCategory) -> Self {
        Self {
            name: name.into(),
            category,
        }
    }
}
