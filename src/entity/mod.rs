//! Canonical entity types and identity management.
//!
//! The Entity layer anchors everything in canonize. Without stable entity
//! IDs there is nothing for aliases to resolve to, nothing for provenance
//! to attach to, and no record to merge observations into.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::confidence::Confidence;
use crate::source::SourceRef;
use crate::value::AttributeValue;

/// Globally unique, stable entity identifier.
///
/// Once created, an `EntityId` never changes and is never reused. Even a
/// duplicate that loses a merge keeps its ID so historical references
/// stay resolvable.
///
/// # Examples
///
/// ```
/// use canonize::EntityId;
///
/// let id = EntityId::new();
/// assert!(!id.is_nil());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Creates a new random entity ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an entity ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns true if this is a nil (all zeros) UUID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Creates a nil entity ID (for testing or sentinel values).
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Classification of entities.
///
/// The category is immutable after creation: an Organization can never
/// become a Location. Matching is scoped by category so that a person and
/// a country sharing a name can never merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntityCategory {
    /// A company, institution, or group.
    Organization,
    /// A geographic place: country, city, or region.
    Location,
    /// A human person.
    Person,
    /// A linking record between two entities.
    Relationship,
}

impl EntityCategory {
    /// All categories that canonical entities can have.
    ///
    /// `Relationship` candidates decompose into entity merges plus a
    /// linking record; they never become canonical entities themselves.
    pub const ENTITY_CATEGORIES: [Self; 3] = [Self::Organization, Self::Location, Self::Person];
}

impl TryFrom<String> for EntityCategory {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("organization") {
            Ok(Self::Organization)
        } else if value.eq_ignore_ascii_case("location") {
            Ok(Self::Location)
        } else if value.eq_ignore_ascii_case("person") {
            Ok(Self::Person)
        } else if value.eq_ignore_ascii_case("relationship") {
            Ok(Self::Relationship)
        } else {
            Err(format!(
                "unknown category: {value}. Expected organization, location, person, or relationship"
            ))
        }
    }
}

impl From<EntityCategory> for String {
    fn from(value: EntityCategory) -> Self {
        value.to_string()
    }
}

impl fmt::Display for EntityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Organization => write!(f, "organization"),
            Self::Location => write!(f, "location"),
            Self::Person => write!(f, "person"),
            Self::Relationship => write!(f, "relationship"),
        }
    }
}

/// The accepted value of one attribute, with its provenance.
///
/// At most one `FieldValue` is accepted per attribute key at a time.
/// Superseded values are retained in the provenance ledger, never
/// deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    /// The accepted value.
    pub value: AttributeValue,
    /// Confidence of the observation that set this value.
    pub confidence: Confidence,
    /// Where the observation came from.
    pub source: SourceRef,
    /// When this value was accepted.
    pub last_updated: DateTime<Utc>,
}

/// A pending field-level dispute awaiting adjudication.
///
/// While a dispute is open the field has no accepted value; the engine
/// never guesses between equally confident observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDispute {
    /// The disputed attribute key.
    pub key: String,
    /// Every competing observation, in arrival order.
    pub competing: Vec<FieldValue>,
    /// When the dispute was opened.
    pub opened_at: DateTime<Utc>,
}

impl FieldDispute {
    /// Returns true if `value` is already among the competing observations.
    #[must_use]
    pub fn contains(&self, value: &AttributeValue) -> bool {
        self.competing.iter().any(|c| c.value.is_identical(value))
    }
}

/// The single authoritative record for one real-world subject.
///
/// Entities are created and mutated only by the merge resolver, and never
/// physically deleted: a duplicate that loses a merge is marked
/// superseded via [`Entity::merged_into`] and keeps redirecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Globally unique identifier, assigned at creation.
    pub id: EntityId,

    /// Immutable category.
    pub category: EntityCategory,

    /// Primary name, chosen by policy (highest-confidence name observed).
    pub canonical_name: String,

    /// Observed name variants. Union-only; never shrinks.
    #[serde(default)]
    pub aliases: BTreeSet<String>,

    /// Confidence of the observation that chose the canonical name.
    pub name_confidence: Confidence,

    /// Accepted attribute values, at most one per key.
    #[serde(default)]
    pub attributes: BTreeMap<String, FieldValue>,

    /// Every source that ever touched this entity, in merge order.
    #[serde(default)]
    pub sources: Vec<SourceRef>,

    /// Open field disputes awaiting adjudication.
    #[serde(default)]
    pub conflicts: Vec<FieldDispute>,

    /// Monotonically increasing version, bumped on every accepted
    /// mutation; the optimistic-concurrency token.
    pub version: u64,

    /// When the entity was first created.
    pub created_at: DateTime<Utc>,

    /// When the entity was last mutated.
    pub updated_at: DateTime<Utc>,

    /// Set when this entity lost a duplicate merge; all reads redirect to
    /// the surviving entity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<EntityId>,
}

impl Entity {
    /// Creates a new entity at version 1.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        category: EntityCategory,
        name_confidence: Confidence,
        created_at: DateTime<Utc>,
    ) -> Self {
        let canonical_name = name.into();
        let mut aliases = BTreeSet::new();
        aliases.insert(canonical_name.clone());
        Self {
            id: EntityId::new(),
            category,
            canonical_name,
            aliases,
            name_confidence,
            attributes: BTreeMap::new(),
            sources: Vec::new(),
            conflicts: Vec::new(),
            version: 1,
            created_at,
            updated_at: created_at,
            merged_into: None,
        }
    }

    /// Returns true if this entity lost a duplicate merge.
    #[must_use]
    pub const fn is_superseded(&self) -> bool {
        self.merged_into.is_some()
    }

    /// Returns the accepted value for `key`, if any.
    #[must_use]
    pub fn accepted_value(&self, key: &str) -> Option<&FieldValue> {
        self.attributes.get(key)
    }

    /// Returns the open dispute for `key`, if any.
    #[must_use]
    pub fn open_dispute(&self, key: &str) -> Option<&FieldDispute> {
        self.conflicts.iter().find(|d| d.key == key)
    }

    /// Adds an alias variant. Returns true if it was new.
    pub fn add_alias(&mut self, alias: impl Into<String>) -> bool {
        self.aliases.insert(alias.into())
    }

    /// Records one accepted mutation: bumps the version and the
    /// modification timestamp. Called once per committed transaction.
    pub fn bump(&mut self, at: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = at;
    }

    /// Number of known aliases.
    #[must_use]
    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }
}
