//! The provenance ledger: an append-only, totally ordered log of every
//! accepted change.
//!
//! Every mutation the merge resolver commits is described by one or more
//! ledger entries. Entries are never mutated or deleted; corrections are
//! new entries. Replaying the ledger from empty state reproduces the
//! entity store exactly, which is both the audit guarantee and the
//! disaster-recovery path.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::confidence::Confidence;
use crate::entity::{Entity, EntityId, FieldDispute, FieldValue};
use crate::relationship::{LinkSide, RelationshipId, RelationshipRecord};
use crate::source::SourceRef;

/// What a ledger entry is about: a canonical entity or a linking record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ProvenanceSubject {
    Entity(EntityId),
    Relationship(RelationshipId),
}

impl ProvenanceSubject {
    /// Returns the entity ID if this entry is about an entity.
    #[must_use]
    pub const fn entity(&self) -> Option<EntityId> {
        match self {
            Self::Entity(id) => Some(*id),
            Self::Relationship(_) => None,
        }
    }
}

/// A rival entity considered during an ambiguous match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RivalMatch {
    /// The rival's entity ID.
    pub entity: EntityId,
    /// Its similarity score against the candidate name.
    pub score: f32,
}

/// The operation a ledger entry records.
///
/// Operations are self-contained: applying them in sequence to empty
/// state reproduces the store. Field-level operations carry before/after
/// snapshots so superseded values stay retrievable forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOp {
    /// A new entity was created. Carries the full initial record.
    Create { entity: Entity },

    /// An attribute gained or changed its accepted value.
    UpdateField {
        key: String,
        before: Option<FieldValue>,
        after: FieldValue,
    },

    /// A lower-confidence observation was declined; the stored value was
    /// kept. The rejected value is recorded here and nowhere else.
    RejectField {
        key: String,
        kept: FieldValue,
        rejected: FieldValue,
    },

    /// A new name variant was recorded.
    AddAlias { alias: String },

    /// A higher-confidence observation renamed the entity. The old name
    /// stays in the alias set.
    RenameCanonical {
        before: String,
        after: String,
        confidence: Confidence,
    },

    /// A source citation was appended (see the entry's `source`).
    AddSource,

    /// Equally confident observations disagreed; the field entered
    /// dispute. `displaced` is the previously accepted value, if any —
    /// disputed fields have no accepted value until adjudicated.
    FlagConflict {
        key: String,
        competing: Vec<FieldValue>,
        displaced: Option<FieldValue>,
    },

    /// The fuzzy matcher found rivals too close to call. Records the
    /// dispute without mutating any entity.
    FlagAmbiguous {
        candidate_name: String,
        rivals: Vec<RivalMatch>,
    },

    /// An external adjudication supplied the winning value for a
    /// disputed field.
    ResolveConflict {
        key: String,
        chosen: FieldValue,
        rationale: String,
        competing: Vec<FieldValue>,
    },

    /// This entity lost a post-hoc duplicate merge; all its aliases now
    /// point at `into` and reads redirect there.
    Redirect { into: EntityId },

    /// A relationship linking record was created.
    Link { record: RelationshipRecord },

    /// A pending relationship endpoint resolved to an entity.
    LinkEndpointResolved { side: LinkSide, entity: EntityId },
}

impl LedgerOp {
    /// Short operation name for logs and reports.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::UpdateField { .. } => "update_field",
            Self::RejectField { .. } => "reject_field",
            Self::AddAlias { .. } => "add_alias",
            Self::RenameCanonical { .. } => "rename_canonical",
            Self::AddSource => "add_source",
            Self::FlagConflict { .. } => "flag_conflict",
            Self::FlagAmbiguous { .. } => "flag_ambiguous",
            Self::ResolveConflict { .. } => "resolve_conflict",
            Self::Redirect { .. } => "redirect",
            Self::Link { .. } => "link",
            Self::LinkEndpointResolved { .. } => "link_endpoint_resolved",
        }
    }
}

/// One immutable entry in the provenance ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    /// Global, monotonically increasing sequence number, assigned at
    /// commit.
    pub sequence: u64,

    /// What the entry is about.
    pub subject: ProvenanceSubject,

    /// The recorded operation.
    #[serde(flatten)]
    pub op: LedgerOp,

    /// The source reference driving the operation, if any. Adjudications
    /// have none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,

    /// When the entry was committed.
    pub timestamp: DateTime<Utc>,

    /// The subject entity's version after this operation. `None` for
    /// relationship entries; unchanged for operations that do not mutate
    /// the entity (ambiguous-match flags).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resulting_version: Option<u64>,
}

impl fmt::Display for ProvenanceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.sequence, self.op.kind())
    }
}

/// Errors raised while replaying the ledger.
///
/// A replay error means the ledger is corrupt or was produced by an
/// incompatible writer; it is not recoverable by retrying.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("entry #{sequence}: entity {entity} not found")]
    MissingEntity { sequence: u64, entity: EntityId },

    #[error("entry #{sequence}: relationship {relationship} not found")]
    MissingRelationship {
        sequence: u64,
        relationship: RelationshipId,
    },

    #[error("entry #{sequence}: create over existing entity {entity}")]
    DuplicateCreate { sequence: u64, entity: EntityId },

    #[error("entry #{sequence}: {op} entry has the wrong subject kind")]
    SubjectMismatch { sequence: u64, op: &'static str },

    #[error("entries out of order: #{sequence} after #{previous}")]
    OutOfOrder { sequence: u64, previous: u64 },
}

/// Materialized store state, rebuilt by folding ledger entries.
///
/// The in-memory backend uses this as its live state; `full_replay`
/// rebuilds a fresh one from the ledger for verification and recovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayState {
    /// Canonical entities by ID, superseded duplicates included.
    pub entities: BTreeMap<EntityId, Entity>,
    /// Relationship linking records by ID.
    pub relationships: BTreeMap<RelationshipId, RelationshipRecord>,
}

impl ReplayState {
    /// Creates empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds state by replaying entries in order.
    ///
    /// # Errors
    /// Returns a [`ReplayError`] if the entries are inconsistent.
    pub fn from_entries<'a, I>(entries: I) -> Result<Self, ReplayError>
    where
        I: IntoIterator<Item = &'a ProvenanceEntry>,
    {
        let mut state = Self::new();
        let mut previous = 0u64;
        for entry in entries {
            if entry.sequence <= previous {
                return Err(ReplayError::OutOfOrder {
                    sequence: entry.sequence,
                    previous,
                });
            }
            previous = entry.sequence;
            state.apply(entry)?;
        }
        Ok(state)
    }

    /// Applies one entry to this state.
    ///
    /// # Errors
    /// Returns a [`ReplayError`] if the entry references unknown state.
    pub fn apply(&mut self, entry: &ProvenanceEntry) -> Result<(), ReplayError> {
        match (&entry.op, entry.subject) {
            (LedgerOp::Create { entity }, ProvenanceSubject::Entity(id)) => {
                if self.entities.contains_key(&id) {
                    return Err(ReplayError::DuplicateCreate {
                        sequence: entry.sequence,
                        entity: id,
                    });
                }
                self.entities.insert(id, entity.clone());
            }

            (LedgerOp::UpdateField { key, after, .. }, ProvenanceSubject::Entity(id)) => {
                let entity = self.entity_mut(entry.sequence, id)?;
                entity.attributes.insert(key.clone(), after.clone());
                stamp(entity, entry);
            }

            (LedgerOp::RejectField { .. }, ProvenanceSubject::Entity(id)) => {
                // The stored value was kept; only the version stamp moves.
                let entity = self.entity_mut(entry.sequence, id)?;
                stamp(entity, entry);
            }

            (LedgerOp::AddAlias { alias }, ProvenanceSubject::Entity(id)) => {
                let entity = self.entity_mut(entry.sequence, id)?;
                entity.aliases.insert(alias.clone());
                stamp(entity, entry);
            }

            (
                LedgerOp::RenameCanonical {
                    after, confidence, ..
                },
                ProvenanceSubject::Entity(id),
            ) => {
                let entity = self.entity_mut(entry.sequence, id)?;
                entity.canonical_name.clone_from(after);
                entity.name_confidence = *confidence;
                entity.aliases.insert(after.clone());
                stamp(entity, entry);
            }

            (LedgerOp::AddSource, ProvenanceSubject::Entity(id)) => {
                let source = entry.source.clone();
                let entity = self.entity_mut(entry.sequence, id)?;
                if let Some(source) = source {
                    entity.sources.push(source);
                }
                stamp(entity, entry);
            }

            (
                LedgerOp::FlagConflict {
                    key,
                    competing,
                    displaced,
                },
                ProvenanceSubject::Entity(id),
            ) => {
                let timestamp = entry.timestamp;
                let entity = self.entity_mut(entry.sequence, id)?;
                if displaced.is_some() {
                    entity.attributes.remove(key);
                }
                match entity.conflicts.iter_mut().find(|d| &d.key == key) {
                    Some(dispute) => dispute.competing.clone_from(competing),
                    None => entity.conflicts.push(FieldDispute {
                        key: key.clone(),
                        competing: competing.clone(),
                        opened_at: timestamp,
                    }),
                }
                stamp(entity, entry);
            }

            (LedgerOp::FlagAmbiguous { .. }, ProvenanceSubject::Entity(_)) => {
                // Recorded for audit; no entity state is mutated.
            }

            (LedgerOp::ResolveConflict { key, chosen, .. }, ProvenanceSubject::Entity(id)) => {
                let entity = self.entity_mut(entry.sequence, id)?;
                entity.conflicts.retain(|d| &d.key != key);
                entity.attributes.insert(key.clone(), chosen.clone());
                stamp(entity, entry);
            }

            (LedgerOp::Redirect { into }, ProvenanceSubject::Entity(id)) => {
                let into = *into;
                let entity = self.entity_mut(entry.sequence, id)?;
                entity.merged_into = Some(into);
                stamp(entity, entry);
            }

            (LedgerOp::Link { record }, ProvenanceSubject::Relationship(id)) => {
                self.relationships.insert(id, record.clone());
            }

            (LedgerOp::AddSource, ProvenanceSubject::Relationship(id)) => {
                let source = entry.source.clone();
                let record = self.relationship_mut(entry.sequence, id)?;
                if let Some(source) = source {
                    record.sources.push(source);
                }
            }

            (
                LedgerOp::LinkEndpointResolved { side, entity },
                ProvenanceSubject::Relationship(id),
            ) => {
                let (side, entity) = (*side, *entity);
                let record = self.relationship_mut(entry.sequence, id)?;
                record.resolve_endpoint(side, entity);
            }

            (op, _) => {
                return Err(ReplayError::SubjectMismatch {
                    sequence: entry.sequence,
                    op: op.kind(),
                });
            }
        }
        Ok(())
    }

    /// Stable digest of the materialized state.
    ///
    /// Two states with identical entities and relationships produce the
    /// same digest; used to verify replay determinism.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        let encoded =
            serde_json::to_vec(self).expect("replay state serializes");
        hasher.update(&encoded);
        *hasher.finalize().as_bytes()
    }

    fn entity_mut(
        &mut self,
        sequence: u64,
        id: EntityId,
    ) -> Result<&mut Entity, ReplayError> {
        self.entities
            .get_mut(&id)
            .ok_or(ReplayError::MissingEntity {
                sequence,
                entity: id,
            })
    }

    fn relationship_mut(
        &mut self,
        sequence: u64,
        id: RelationshipId,
    ) -> Result<&mut RelationshipRecord, ReplayError> {
        self.relationships
            .get_mut(&id)
            .ok_or(ReplayError::MissingRelationship {
                sequence,
                relationship: id,
            })
    }
}

/// Sets the subject entity's version and modification time from the entry.
fn stamp(entity: &mut Entity, entry: &ProvenanceEntry) {
    if let Some(version) = entry.resulting_version {
        if version != entity.version {
            entity.version = version;
            entity.updated_at = entry.timestamp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::Confidence;
    use crate::entity::EntityCategory;
    use crate::value::AttributeValue;

    fn source() -> SourceRef {
        SourceRef::checked("https://example.org/a", 0.8).unwrap()
    }

    fn field(value: &str, confidence: f32) -> FieldValue {
        FieldValue {
            value: AttributeValue::text(value),
            confidence: Confidence::clamped(confidence),
            source: source(),
            last_updated: Utc::now(),
        }
    }

    fn create_entry(sequence: u64, entity: &Entity) -> ProvenanceEntry {
        ProvenanceEntry {
            sequence,
            subject: ProvenanceSubject::Entity(entity.id),
            op: LedgerOp::Create {
                entity: entity.clone(),
            },
            source: Some(source()),
            timestamp: entity.created_at,
            resulting_version: Some(1),
        }
    }

    #[test]
    fn replay_applies_create_and_update() {
        let entity = Entity::new(
            "Example Corp",
            EntityCategory::Organization,
            Confidence::clamped(0.9),
            Utc::now(),
        );
        let id = entity.id;
        let after = field("technology", 0.8);
        let entries = vec![
            create_entry(1, &entity),
            ProvenanceEntry {
                sequence: 2,
                subject: ProvenanceSubject::Entity(id),
                op: LedgerOp::UpdateField {
                    key: "sector".to_string(),
                    before: None,
                    after: after.clone(),
                },
                source: Some(source()),
                timestamp: Utc::now(),
                resulting_version: Some(2),
            },
        ];

        let state = ReplayState::from_entries(&entries).unwrap();
        let replayed = &state.entities[&id];
        assert_eq!(replayed.attributes["sector"], after);
        assert_eq!(replayed.version, 2);
    }

    #[test]
    fn replay_flag_conflict_unsets_field() {
        let entity = Entity::new(
            "Example Corp",
            EntityCategory::Organization,
            Confidence::clamped(0.9),
            Utc::now(),
        );
        let id = entity.id;
        let displaced = field("energy", 0.8);
        let rival = field("military", 0.8);
        let entries = vec![
            create_entry(1, &entity),
            ProvenanceEntry {
                sequence: 2,
                subject: ProvenanceSubject::Entity(id),
                op: LedgerOp::UpdateField {
                    key: "sector".to_string(),
                    before: None,
                    after: displaced.clone(),
                },
                source: Some(source()),
                timestamp: Utc::now(),
                resulting_version: Some(2),
            },
            ProvenanceEntry {
                sequence: 3,
                subject: ProvenanceSubject::Entity(id),
                op: LedgerOp::FlagConflict {
                    key: "sector".to_string(),
                    competing: vec![displaced.clone(), rival],
                    displaced: Some(displaced),
                },
                source: Some(source()),
                timestamp: Utc::now(),
                resulting_version: Some(3),
            },
        ];

        let state = ReplayState::from_entries(&entries).unwrap();
        let replayed = &state.entities[&id];
        assert!(replayed.accepted_value("sector").is_none());
        assert_eq!(replayed.conflicts.len(), 1);
        assert_eq!(replayed.conflicts[0].competing.len(), 2);
    }

    #[test]
    fn replay_rejects_out_of_order() {
        let entity = Entity::new(
            "X Corp",
            EntityCategory::Organization,
            Confidence::clamped(0.9),
            Utc::now(),
        );
        let entries = vec![create_entry(2, &entity), create_entry(1, &entity)];
        assert!(matches!(
            ReplayState::from_entries(&entries),
            Err(ReplayError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn replay_rejects_update_of_unknown_entity() {
        let entries = vec![ProvenanceEntry {
            sequence: 1,
            subject: ProvenanceSubject::Entity(EntityId::new()),
            op: LedgerOp::AddAlias {
                alias: "ghost".to_string(),
            },
            source: None,
            timestamp: Utc::now(),
            resulting_version: Some(2),
        }];
        assert!(matches!(
            ReplayState::from_entries(&entries),
            Err(ReplayError::MissingEntity { .. })
        ));
    }

    #[test]
    fn digest_is_stable_and_state_sensitive() {
        let entity = Entity::new(
            "Example Corp",
            EntityCategory::Organization,
            Confidence::clamped(0.9),
            Utc::now(),
        );
        let entries = vec![create_entry(1, &entity)];
        let a = ReplayState::from_entries(&entries).unwrap();
        let b = ReplayState::from_entries(&entries).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), ReplayState::new().digest());
    }

    #[test]
    fn entry_display_shows_sequence_and_kind() {
        let entity = Entity::new(
            "Example Corp",
            EntityCategory::Organization,
            Confidence::clamped(0.9),
            Utc::now(),
        );
        let entry = create_entry(7, &entity);
        assert_eq!(entry.to_string(), "#7 create");
    }
}
