//! Relationship linking records.
//!
//! A relationship candidate decomposes into two independent entity merges
//! plus a linking record that references both IDs. The linking record has
//! its own identity and provenance, and partial completion — one side
//! merged, the other still pending corroboration — is a valid,
//! inspectable intermediate state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::confidence::Confidence;
use crate::entity::{EntityCategory, EntityId};
use crate::source::SourceRef;

/// Unique identifier for a relationship record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationshipId(Uuid);

impl RelationshipId {
    /// Creates a new random relationship ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RelationshipId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RelationshipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the link an endpoint sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSide {
    Subject,
    Object,
}

impl fmt::Display for LinkSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subject => write!(f, "subject"),
            Self::Object => write!(f, "object"),
        }
    }
}

/// State of one endpoint of a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EndpointState {
    /// The endpoint merged into a canonical entity.
    Resolved { entity: EntityId },
    /// The endpoint is held for corroboration; the link completes when it
    /// resolves.
    Pending {
        name: String,
        category: EntityCategory,
    },
}

impl EndpointState {
    /// Returns the resolved entity ID, if any.
    #[must_use]
    pub const fn entity(&self) -> Option<EntityId> {
        match self {
            Self::Resolved { entity } => Some(*entity),
            Self::Pending { .. } => None,
        }
    }

    /// Returns true if the endpoint has resolved.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }
}

/// A first-class linking record between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    /// Globally unique identifier.
    pub id: RelationshipId,

    /// Subject endpoint.
    pub subject: EndpointState,

    /// What connects the two.
    pub predicate: String,

    /// Object endpoint.
    pub object: EndpointState,

    /// Every source that observed this relationship.
    pub sources: Vec<SourceRef>,

    /// Extraction confidence of the strongest observation.
    pub confidence: Confidence,

    /// When the link was first recorded.
    pub created_at: DateTime<Utc>,
}

impl RelationshipRecord {
    /// Returns true if both endpoints have resolved.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.subject.is_resolved() && self.object.is_resolved()
    }

    /// Returns true if the link touches the given entity.
    #[must_use]
    pub fn touches(&self, id: EntityId) -> bool {
        self.subject.entity() == Some(id) || self.object.entity() == Some(id)
    }

    /// Returns the endpoint on the given side.
    #[must_use]
    pub const fn endpoint(&self, side: LinkSide) -> &EndpointState {
        match side {
            LinkSide::Subject => &self.subject,
            LinkSide::Object => &self.object,
        }
    }

    /// Resolves the endpoint on the given side to an entity.
    pub fn resolve_endpoint(&mut self, side: LinkSide, entity: EntityId) {
        let slot = match side {
            LinkSide::Subject => &mut self.subject,
            LinkSide::Object => &mut self.object,
        };
        *slot = EndpointState::Resolved { entity };
    }

    /// Returns true if this record links the same pair with the same
    /// predicate as another observation.
    #[must_use]
    pub fn same_link(&self, subject: &EndpointState, predicate: &str, object: &EndpointState) -> bool {
        self.predicate == predicate
            && endpoint_matches(&self.subject, subject)
            && endpoint_matches(&self.object, object)
    }
}

fn endpoint_matches(a: &EndpointState, b: &EndpointState) -> bool {
    match (a, b) {
        (EndpointState::Resolved { entity: x }, EndpointState::Resolved { entity: y }) => x == y,
        (
            EndpointState::Pending { name: nx, category: cx },
            EndpointState::Pending { name: ny, category: cy },
        ) => cx == cy && nx.eq_ignore_ascii_case(ny),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(subject: EndpointState, object: EndpointState) -> RelationshipRecord {
        RelationshipRecord {
            id: RelationshipId::new(),
            subject,
            predicate: "supplies".to_string(),
            object,
            sources: Vec::new(),
            confidence: Confidence::clamped(0.8),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn partial_completion_is_inspectable() {
        let resolved = EntityId::new();
        let link = record(
            EndpointState::Resolved { entity: resolved },
            EndpointState::Pending {
                name: "Example Co".to_string(),
                category: EntityCategory::Organization,
            },
        );
        assert!(!link.is_complete());
        assert!(link.touches(resolved));
        assert!(link.object.entity().is_none());
    }

    #[test]
    fn resolving_an_endpoint_completes_the_link() {
        let a = EntityId::new();
        let b = EntityId::new();
        let mut link = record(
            EndpointState::Resolved { entity: a },
            EndpointState::Pending {
                name: "Gaza".to_string(),
                category: EntityCategory::Location,
            },
        );
        link.resolve_endpoint(LinkSide::Object, b);
        assert!(link.is_complete());
        assert!(link.touches(b));
    }

    #[test]
    fn same_link_compares_pair_and_predicate() {
        let a = EntityId::new();
        let b = EntityId::new();
        let link = record(
            EndpointState::Resolved { entity: a },
            EndpointState::Resolved { entity: b },
        );
        assert!(link.same_link(
            &EndpointState::Resolved { entity: a },
            "supplies",
            &EndpointState::Resolved { entity: b },
        ));
        assert!(!link.same_link(
            &EndpointState::Resolved { entity: a },
            "operates_in",
            &EndpointState::Resolved { entity: b },
        ));
    }
}
