//! Schema validation and normalization of candidate records.
//!
//! The validator is the gate in front of the merge path: malformed
//! candidates are rejected with a structured list of every violated
//! constraint, and accepted candidates come out normalized (trimmed,
//! casefolded names; clamped confidences; checked source URLs). A
//! rejection is non-fatal to the caller — the record is dropped and
//! reported, never partially merged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::candidate::{CandidateRecord, RelationshipObservation};
use crate::confidence::Confidence;
use crate::entity::EntityCategory;
use crate::error::{CandidateRejection, ValidationError};
use crate::normalize::normalize_name;
use crate::source::{is_valid_url, SourceRef};
use crate::value::AttributeValue;

/// Minimum candidate name length after trimming.
const MIN_NAME_LEN: usize = 2;

/// A normalized attribute observation that passed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedObservation {
    /// The observed value, vocabulary-normalized for known keys.
    pub value: AttributeValue,
    /// Clamped confidence.
    pub confidence: Confidence,
}

/// A validated relationship endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedEndpoint {
    /// Trimmed endpoint name.
    pub name: String,
    /// Normalized alias key for the endpoint.
    pub normalized_name: String,
    /// Endpoint category; never [`EntityCategory::Relationship`].
    pub category: EntityCategory,
}

/// A validated subject–predicate–object triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedRelationship {
    pub subject: ValidatedEndpoint,
    /// Trimmed, casefolded predicate.
    pub predicate: String,
    pub object: ValidatedEndpoint,
}

/// A candidate that passed the schema validator.
///
/// This is the only shape the merge resolver accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedCandidate {
    /// Candidate category.
    pub category: EntityCategory,
    /// Trimmed proposed name.
    pub name: String,
    /// Normalized alias key for the name.
    pub normalized_name: String,
    /// Validated attribute observations, keyed by trimmed lowercase key.
    pub attributes: BTreeMap<String, ValidatedObservation>,
    /// Validated source reference.
    pub source: SourceRef,
    /// Clamped extraction confidence.
    pub confidence: Confidence,
    /// Present iff `category` is [`EntityCategory::Relationship`].
    pub relationship: Option<ValidatedRelationship>,
}

/// Parses a category from its string form.
///
/// # Errors
/// Returns [`ValidationError::UnknownCategory`] for unrecognized input.
pub fn parse_category(value: &str) -> Result<EntityCategory, ValidationError> {
    EntityCategory::try_from(value.to_string()).map_err(|_| ValidationError::UnknownCategory {
        category: value.trim().to_string(),
    })
}

/// Vocabulary keys whose text values are casefolded during normalization.
///
/// These mirror the attribute vocabularies the upstream extractor emits:
/// organization sectors, location kinds, person roles.
fn is_vocabulary_key(category: EntityCategory, key: &str) -> bool {
    matches!(
        (category, key),
        (EntityCategory::Organization, "sector")
            | (EntityCategory::Location, "kind")
            | (EntityCategory::Person, "role")
    )
}

/// Expected value type for known category-specific keys.
fn expected_type(category: EntityCategory, key: &str) -> Option<&'static str> {
    match (category, key) {
        (EntityCategory::Organization, "sector")
        | (EntityCategory::Location, "kind")
        | (EntityCategory::Person, "role") => Some("text"),
        (EntityCategory::Person, "affiliation") => Some("text or entity"),
        _ => None,
    }
}

fn type_matches(expected: &'static str, value: &AttributeValue) -> bool {
    match expected {
        "text" => value.is_text(),
        "text or entity" => value.is_text() || value.as_entity().is_some(),
        _ => true,
    }
}

/// Validates and normalizes candidate records.
///
/// # Examples
///
/// ```
/// use canonize::{CandidateRecord, EntityCategory, SchemaValidator};
///
/// let validator = SchemaValidator::new();
/// let ok = validator.validate(CandidateRecord::new(
///     EntityCategory::Organization,
///     "  Example Corp. ",
///     "https://example.org/a",
/// ));
/// assert_eq!(ok.unwrap().normalized_name, "example corp");
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchemaValidator {
    _priv: (),
}

impl SchemaValidator {
    /// Creates a validator with the default rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates one candidate, collecting every violation.
    ///
    /// # Errors
    /// Returns a [`CandidateRejection`] listing all violated constraints.
    pub fn validate(
        &self,
        candidate: CandidateRecord,
    ) -> Result<ValidatedCandidate, CandidateRejection> {
        let mut violations = Vec::new();

        let name = candidate.name.trim().to_string();
        let normalized_name = normalize_name(&name);
        if normalized_name.is_empty() {
            violations.push(ValidationError::EmptyName);
        } else if name.chars().count() < MIN_NAME_LEN {
            violations.push(ValidationError::NameTooShort {
                length: name.chars().count(),
                minimum: MIN_NAME_LEN,
            });
        }

        let confidence = match check_confidence(candidate.confidence) {
            Ok(c) => c,
            Err(e) => {
                violations.push(e);
                Confidence::default()
            }
        };

        if !is_valid_url(&candidate.source_url) {
            violations.push(ValidationError::MalformedSourceUrl {
                url: candidate.source_url.clone(),
            });
        }

        let mut attributes = BTreeMap::new();
        for (key, observation) in &candidate.attributes {
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                violations.push(ValidationError::EmptyAttributeKey);
                continue;
            }

            let attr_confidence = match check_confidence(observation.confidence) {
                Ok(c) => c,
                Err(e) => {
                    violations.push(e);
                    continue;
                }
            };

            let mut value = observation.value.clone();
            if let Some(expected) = expected_type(candidate.category, &key) {
                if !type_matches(expected, &value) {
                    violations.push(ValidationError::AttributeTypeMismatch {
                        key: key.clone(),
                        actual: value.type_name(),
                        expected,
                        category: candidate.category,
                    });
                    continue;
                }
            }
            if is_vocabulary_key(candidate.category, &key) {
                if let AttributeValue::Text(text) = &value {
                    value = AttributeValue::Text(text.trim().to_lowercase());
                }
            }

            attributes.insert(
                key,
                ValidatedObservation {
                    value,
                    confidence: attr_confidence,
                },
            );
        }

        let relationship = match (candidate.category, &candidate.relationship) {
            (EntityCategory::Relationship, Some(rel)) => {
                validate_relationship(rel, &mut violations)
            }
            (EntityCategory::Relationship, None) => {
                violations.push(ValidationError::MissingRelationship);
                None
            }
            (_, Some(_)) => {
                violations.push(ValidationError::UnexpectedRelationship);
                None
            }
            (_, None) => None,
        };

        if violations.is_empty() {
            Ok(ValidatedCandidate {
                category: candidate.category,
                name,
                normalized_name,
                attributes,
                source: SourceRef::checked_at(
                    candidate.source_url,
                    candidate.retrieved_at,
                    confidence,
                )
                .expect("url already checked"),
                confidence,
                relationship,
            })
        } else {
            Err(CandidateRejection { name, violations })
        }
    }

    /// Validates a batch, splitting it into accepted and rejected records.
    ///
    /// Rejections never abort the batch.
    #[must_use]
    pub fn validate_batch(
        &self,
        candidates: Vec<CandidateRecord>,
    ) -> (Vec<ValidatedCandidate>, Vec<CandidateRejection>) {
        let mut accepted = Vec::with_capacity(candidates.len());
        let mut rejected = Vec::new();
        for candidate in candidates {
            match self.validate(candidate) {
                Ok(v) => accepted.push(v),
                Err(r) => rejected.push(r),
            }
        }
        (accepted, rejected)
    }
}

/// Non-finite confidences are rejected; finite values are clamped.
fn check_confidence(value: f32) -> Result<Confidence, ValidationError> {
    if value.is_finite() {
        Ok(Confidence::clamped(value))
    } else {
        Err(ValidationError::ConfidenceOutOfRange { value })
    }
}

fn validate_relationship(
    rel: &RelationshipObservation,
    violations: &mut Vec<ValidationError>,
) -> Option<ValidatedRelationship> {
    let before = violations.len();

    let predicate = rel.predicate.trim().to_lowercase();
    if predicate.is_empty() {
        violations.push(ValidationError::EmptyPredicate);
    }

    let subject = validate_endpoint(&rel.subject.name, rel.subject.category, violations);
    let object = validate_endpoint(&rel.object.name, rel.object.category, violations);

    if violations.len() > before {
        return None;
    }
    Some(ValidatedRelationship {
        subject: subject?,
        predicate,
        object: object?,
    })
}

fn validate_endpoint(
    name: &str,
    category: EntityCategory,
    violations: &mut Vec<ValidationError>,
) -> Option<ValidatedEndpoint> {
    if category == EntityCategory::Relationship {
        violations.push(ValidationError::RelationshipEndpointCategory);
        return None;
    }
    let name = name.trim().to_string();
    let normalized_name = normalize_name(&name);
    if normalized_name.is_empty() {
        violations.push(ValidationError::EmptyName);
        return None;
    }
    Some(ValidatedEndpoint {
        name,
        normalized_name,
        category,
    })
}
