//! The merge resolver: the state machine at the center of the engine.
//!
//! For each validated candidate with its ranked match candidates, the
//! resolver takes exactly one of four paths:
//!
//! - `NoMatch → Create`: allocate a fresh entity and index its name.
//! - `StrongMatch → Merge`: fold the candidate's fields into the target
//!   under the confidence-weighted field policy.
//! - `WeakMatch → Corroborate`: hold the candidate until a second signal
//!   confirms the match, or expire it into a new entity.
//! - `Ambiguous → Conflict`: record the tie and change nothing.
//!
//! Every mutation is committed through the knowledge store together with
//! its ledger entries, guarded by the entity version. Losers of a
//! concurrent race retry against the post-update state, bounded by the
//! retry budget. The resolver is the sole writer of record: no other
//! component mutates entities.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::entity::{Entity, EntityCategory, EntityId, FieldDispute, FieldValue};
use crate::error::{CanonError, CanonResult, MergeError};
use crate::index::CanonicalIndex;
use crate::ledger::{LedgerOp, ProvenanceSubject, RivalMatch};
use crate::matcher::{FuzzyMatcher, MatchDecision};
use crate::relationship::{EndpointState, LinkSide, RelationshipId, RelationshipRecord};
use crate::storage::{EntryDraft, KnowledgeStore, StorageError, Transaction};
use crate::validate::{ValidatedCandidate, ValidatedEndpoint, ValidatedObservation};
use crate::value::AttributeValue;

/// How a submission landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeOutcome {
    /// A new canonical entity was created.
    Created,
    /// The candidate merged into an existing entity.
    Merged,
    /// The candidate is held pending corroboration of a weak match.
    Corroborating,
    /// The candidate raised a conflict requiring adjudication.
    Conflict,
}

impl std::fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Merged => write!(f, "merged"),
            Self::Corroborating => write!(f, "corroborating"),
            Self::Conflict => write!(f, "conflict"),
        }
    }
}

/// The engine's answer for one accepted submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeReceipt {
    /// Outcome tag.
    pub outcome: MergeOutcome,
    /// The assigned or updated entity, when the submission concerned one.
    pub entity: Option<EntityId>,
    /// The linking record, for relationship submissions.
    pub relationship: Option<RelationshipId>,
}

impl MergeReceipt {
    fn entity(outcome: MergeOutcome, entity: EntityId) -> Self {
        Self {
            outcome,
            entity: Some(entity),
            relationship: None,
        }
    }
}

/// A pending conflict surfaced for adjudication.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingConflict {
    /// The disputed entity.
    pub entity: EntityId,
    /// Its canonical name, for display.
    pub name: String,
    /// The disputed field.
    pub key: String,
    /// Competing observations with their sources.
    pub competing: Vec<FieldValue>,
}

/// A weak match held for corroboration.
#[derive(Debug, Clone)]
struct HeldCandidate {
    candidate: ValidatedCandidate,
    target: EntityId,
    score: f32,
    held_at: DateTime<Utc>,
    submissions_seen: u32,
    /// Relationship endpoints waiting on this candidate's resolution.
    links: Vec<(RelationshipId, LinkSide)>,
}

type PendingKey = (EntityCategory, String);

/// The merge resolver. One per engine; shared across workers.
pub struct MergeResolver {
    store: Arc<dyn KnowledgeStore>,
    index: Arc<CanonicalIndex>,
    matcher: FuzzyMatcher,
    config: EngineConfig,
    pending: Mutex<HashMap<PendingKey, HeldCandidate>>,
}

impl MergeResolver {
    /// Creates a resolver over the given store and index.
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        index: Arc<CanonicalIndex>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            index,
            matcher: FuzzyMatcher::new(config.matcher),
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Processes one validated candidate to completion.
    ///
    /// # Errors
    /// - [`MergeError::RetryExhausted`] when concurrent writers keep
    ///   winning; retryable, no partial state.
    /// - [`CanonError::Storage`] when the backend fails; the operation
    ///   aborted atomically.
    pub fn process(&self, candidate: ValidatedCandidate) -> CanonResult<MergeReceipt> {
        self.age_pending()?;
        if candidate.category == EntityCategory::Relationship {
            self.process_relationship(candidate)
        } else {
            self.process_entity(candidate)
        }
    }

    /// Number of candidates currently held for corroboration.
    #[must_use]
    pub fn pending_corroborations(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Forces every held candidate to its final state now.
    ///
    /// Each becomes a merge if its target still matches strongly, or a
    /// new entity otherwise.
    pub fn flush_pending(&self) -> CanonResult<Vec<MergeReceipt>> {
        let held: Vec<HeldCandidate> = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| StorageError::Backend("poisoned lock: pending".to_string()))
                .map_err(CanonError::from)?;
            pending.drain().map(|(_, h)| h).collect()
        };

        let mut receipts = Vec::with_capacity(held.len());
        for candidate in held {
            receipts.push(self.finalize_held(candidate)?);
        }
        Ok(receipts)
    }

    // ------------------------------------------------------------------
    // Entity path
    // ------------------------------------------------------------------

    fn process_entity(&self, candidate: ValidatedCandidate) -> CanonResult<MergeReceipt> {
        let key = (candidate.category, candidate.normalized_name.clone());

        // A second observation of a held name is itself the strongest
        // corroboration signal.
        let held = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| StorageError::Backend("poisoned lock: pending".to_string()))
                .map_err(CanonError::from)?;
            pending.remove(&key)
        };
        if let Some(held) = held {
            return self.corroborate_held(held, candidate);
        }

        let (decision, _ranked) =
            self.matcher
                .matches(&candidate.normalized_name, candidate.category, &self.index);

        match decision {
            MatchDecision::NoMatch => self.create(candidate, Vec::new()),
            MatchDecision::Strong(top) => {
                let (receipt, _) = self.merge(&candidate, top.entity)?;
                Ok(receipt)
            }
            MatchDecision::Weak(top) => self.corroborate_or_hold(candidate, top.entity, top.score),
            MatchDecision::Ambiguous(rivals) => self.flag_ambiguous(&candidate, &rivals),
        }
    }

    /// Create path. Claims the normalized name first so two concurrent
    /// creates of the same name race on the index, not the store.
    fn create(
        &self,
        candidate: ValidatedCandidate,
        links: Vec<(RelationshipId, LinkSide)>,
    ) -> CanonResult<MergeReceipt> {
        let now = Utc::now();
        let mut entity = Entity::new(
            candidate.name.clone(),
            candidate.category,
            candidate.confidence,
            now,
        );
        entity.sources.push(candidate.source.clone());
        for (key, observation) in &candidate.attributes {
            entity.attributes.insert(
                key.clone(),
                FieldValue {
                    value: observation.value.clone(),
                    confidence: observation.confidence,
                    source: candidate.source.clone(),
                    last_updated: now,
                },
            );
        }

        if let Err(owner) =
            self.index
                .claim(candidate.category, &candidate.normalized_name, entity.id)
        {
            // Lost the create race; the winner is the match target now.
            debug!(name = %candidate.name, %owner, "create race lost, merging into winner");
            let (receipt, target) = self.merge(&candidate, owner)?;
            self.resolve_links(&links, target)?;
            return Ok(receipt);
        }

        let txn = Transaction {
            guards: Vec::new(),
            entities: vec![entity.clone()],
            relationships: Vec::new(),
            entries: vec![EntryDraft {
                subject: ProvenanceSubject::Entity(entity.id),
                op: LedgerOp::Create {
                    entity: entity.clone(),
                },
                source: Some(candidate.source.clone()),
                timestamp: now,
                resulting_version: Some(1),
            }],
        };

        if let Err(e) = self.store.commit(txn) {
            self.index
                .release(candidate.category, &candidate.normalized_name, entity.id);
            return Err(e.into());
        }

        info!(entity = %entity.id, name = %candidate.name, category = %candidate.category, "entity created");
        self.resolve_links(&links, entity.id)?;
        Ok(MergeReceipt::entity(MergeOutcome::Created, entity.id))
    }

    /// Merge path with bounded optimistic-concurrency retries.
    ///
    /// Returns the receipt and the entity the candidate finally landed
    /// on (redirects may move it).
    fn merge(
        &self,
        candidate: &ValidatedCandidate,
        target: EntityId,
    ) -> CanonResult<(MergeReceipt, EntityId)> {
        let epsilon = self.config.confidence_epsilon;

        for attempt in 0..self.config.retry_budget {
            let Some(mut entity) = self.store.entity(target).map_err(CanonError::from)? else {
                // A concurrent create can hold the index claim before its
                // commit lands; treat the gap as contention.
                std::thread::yield_now();
                continue;
            };
            let expected = entity.version;
            let landed_on = entity.id;
            let now = Utc::now();
            let mut drafts: Vec<EntryDraft> = Vec::new();
            let mut conflicted = false;

            let draft = |op: LedgerOp, source: Option<crate::source::SourceRef>| EntryDraft {
                subject: ProvenanceSubject::Entity(landed_on),
                op,
                source,
                timestamp: now,
                // Filled in after the bump below.
                resulting_version: None,
            };

            if entity.add_alias(candidate.name.clone()) {
                drafts.push(draft(
                    LedgerOp::AddAlias {
                        alias: candidate.name.clone(),
                    },
                    Some(candidate.source.clone()),
                ));
            }

            if candidate
                .confidence
                .beats(entity.name_confidence, epsilon)
                && entity.canonical_name != candidate.name
            {
                drafts.push(draft(
                    LedgerOp::RenameCanonical {
                        before: entity.canonical_name.clone(),
                        after: candidate.name.clone(),
                        confidence: candidate.confidence,
                    },
                    Some(candidate.source.clone()),
                ));
                entity.canonical_name = candidate.name.clone();
                entity.name_confidence = candidate.confidence;
            }

            for (key, observation) in &candidate.attributes {
                let flagged = apply_observation(
                    &mut entity,
                    key,
                    observation,
                    &candidate.source,
                    now,
                    epsilon,
                    &mut |op, source| drafts.push(draft(op, source)),
                );
                conflicted = conflicted || flagged;
            }

            // Always cite the source; on an identical resubmission this
            // is the only entry, so idempotence holds.
            entity.sources.push(candidate.source.clone());
            drafts.push(draft(LedgerOp::AddSource, Some(candidate.source.clone())));

            entity.bump(now);
            for d in &mut drafts {
                d.resulting_version = Some(entity.version);
            }

            let txn = Transaction {
                guards: vec![crate::storage::VersionGuard {
                    entity: landed_on,
                    expected,
                }],
                entities: vec![entity],
                relationships: Vec::new(),
                entries: drafts,
            };

            match self.store.commit(txn) {
                Ok(_) => {
                    let _ = self.index.insert(
                        candidate.category,
                        &candidate.normalized_name,
                        landed_on,
                    );
                    let outcome = if conflicted {
                        MergeOutcome::Conflict
                    } else {
                        MergeOutcome::Merged
                    };
                    debug!(entity = %landed_on, outcome = %outcome, "candidate merged");
                    return Ok((MergeReceipt::entity(outcome, landed_on), landed_on));
                }
                Err(StorageError::VersionConflict { .. }) => {
                    debug!(entity = %landed_on, attempt, "merge lost the version race, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(entity = %target, budget = self.config.retry_budget, "merge retry budget exhausted");
        Err(MergeError::RetryExhausted {
            entity: target,
            budget: self.config.retry_budget,
        }
        .into())
    }

    /// Weak-match path: merge immediately if a corroboration signal is
    /// already present, otherwise hold.
    fn corroborate_or_hold(
        &self,
        candidate: ValidatedCandidate,
        target: EntityId,
        score: f32,
    ) -> CanonResult<MergeReceipt> {
        if self.is_corroborated(&candidate, target)? {
            let (receipt, _) = self.merge(&candidate, target)?;
            return Ok(receipt);
        }

        debug!(name = %candidate.name, %target, score, "weak match held for corroboration");
        let key = (candidate.category, candidate.normalized_name.clone());
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| StorageError::Backend("poisoned lock: pending".to_string()))
            .map_err(CanonError::from)?;
        pending.insert(
            key,
            HeldCandidate {
                candidate,
                target,
                score,
                held_at: Utc::now(),
                submissions_seen: 0,
                links: Vec::new(),
            },
        );
        Ok(MergeReceipt::entity(MergeOutcome::Corroborating, target))
    }

    /// A shared source host or a shared alias corroborates a weak match
    /// on arrival.
    fn is_corroborated(
        &self,
        candidate: &ValidatedCandidate,
        target: EntityId,
    ) -> CanonResult<bool> {
        let Some(entity) = self.store.entity(target).map_err(CanonError::from)? else {
            return Ok(false);
        };
        if let Some(host) = candidate.source.host() {
            if entity.sources.iter().any(|s| s.host() == Some(host)) {
                return Ok(true);
            }
        }
        Ok(entity.aliases.contains(&candidate.name))
    }

    /// A second observation of a held name arrived: if it independently
    /// points at the same target, both merge; otherwise the newcomer
    /// replaces the held candidate.
    fn corroborate_held(
        &self,
        held: HeldCandidate,
        candidate: ValidatedCandidate,
    ) -> CanonResult<MergeReceipt> {
        let (decision, _) =
            self.matcher
                .matches(&candidate.normalized_name, candidate.category, &self.index);
        let confirms = match decision {
            MatchDecision::Strong(top) | MatchDecision::Weak(top) => top.entity == held.target,
            _ => false,
        };

        if confirms {
            info!(target = %held.target, name = %candidate.name, "weak match corroborated");
            let (_, landed) = self.merge(&held.candidate, held.target)?;
            self.resolve_links(&held.links, landed)?;
            let (receipt, _) = self.merge(&candidate, held.target)?;
            return Ok(receipt);
        }

        // The newcomer disagrees about the target; keep holding with the
        // newcomer's evidence, preserving the original hold clock.
        let key = (candidate.category, candidate.normalized_name.clone());
        let target = held.target;
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| StorageError::Backend("poisoned lock: pending".to_string()))
            .map_err(CanonError::from)?;
        pending.insert(
            key,
            HeldCandidate {
                candidate,
                ..held
            },
        );
        Ok(MergeReceipt::entity(MergeOutcome::Corroborating, target))
    }

    /// Ambiguity path: record the tie; mutate nothing.
    fn flag_ambiguous(
        &self,
        candidate: &ValidatedCandidate,
        rivals: &[crate::matcher::MatchCandidate],
    ) -> CanonResult<MergeReceipt> {
        let top = rivals
            .first()
            .expect("ambiguous decision always carries rivals");
        let current_version = self
            .store
            .entity(top.entity)
            .map_err(CanonError::from)?
            .map(|e| e.version);

        let txn = Transaction {
            guards: Vec::new(),
            entities: Vec::new(),
            relationships: Vec::new(),
            entries: vec![EntryDraft {
                subject: ProvenanceSubject::Entity(top.entity),
                op: LedgerOp::FlagAmbiguous {
                    candidate_name: candidate.name.clone(),
                    rivals: rivals
                        .iter()
                        .map(|r| RivalMatch {
                            entity: r.entity,
                            score: r.score,
                        })
                        .collect(),
                },
                source: Some(candidate.source.clone()),
                timestamp: Utc::now(),
                resulting_version: current_version,
            }],
        };
        self.store.commit(txn).map_err(CanonError::from)?;

        info!(name = %candidate.name, rivals = rivals.len(), "ambiguous match flagged");
        Ok(MergeReceipt::entity(MergeOutcome::Conflict, top.entity))
    }

    // ------------------------------------------------------------------
    // Corroboration aging
    // ------------------------------------------------------------------

    /// Ages every held candidate by one submission and finalizes the
    /// expired ones. Called on each submission; there is no background
    /// thread.
    fn age_pending(&self) -> CanonResult<()> {
        let expired: Vec<HeldCandidate> = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| StorageError::Backend("poisoned lock: pending".to_string()))
                .map_err(CanonError::from)?;
            let now = Utc::now();
            let max_submissions = self.config.corroboration.max_held_submissions;
            let max_hold = Duration::seconds(self.config.corroboration.max_hold_seconds);

            let mut expired_keys = Vec::new();
            for (key, held) in pending.iter_mut() {
                held.submissions_seen += 1;
                if held.submissions_seen >= max_submissions || now - held.held_at > max_hold {
                    expired_keys.push(key.clone());
                }
            }
            expired_keys
                .iter()
                .filter_map(|k| pending.remove(k))
                .collect()
        };

        for held in expired {
            self.finalize_held(held)?;
        }
        Ok(())
    }

    /// A held candidate leaves the queue: merge if its target now
    /// matches strongly (the index may have changed while it waited),
    /// otherwise create the entity it described.
    fn finalize_held(&self, held: HeldCandidate) -> CanonResult<MergeReceipt> {
        let (decision, _) = self.matcher.matches(
            &held.candidate.normalized_name,
            held.candidate.category,
            &self.index,
        );
        match decision {
            MatchDecision::Strong(top) => {
                let (receipt, landed) = self.merge(&held.candidate, top.entity)?;
                self.resolve_links(&held.links, landed)?;
                Ok(receipt)
            }
            _ => {
                debug!(name = %held.candidate.name, "corroboration window closed, creating entity");
                self.create(held.candidate, held.links)
            }
        }
    }

    // ------------------------------------------------------------------
    // Relationship path
    // ------------------------------------------------------------------

    fn process_relationship(&self, candidate: ValidatedCandidate) -> CanonResult<MergeReceipt> {
        let relationship = candidate
            .relationship
            .clone()
            .expect("validator guarantees relationship payload");

        let subject = self.resolve_endpoint(&candidate, &relationship.subject)?;
        let object = self.resolve_endpoint(&candidate, &relationship.object)?;

        // Idempotent link: a re-observation of the same triple adds a
        // citation instead of a second record.
        for existing in self.store.relationships().map_err(CanonError::from)? {
            if existing.same_link(&subject.state, &relationship.predicate, &object.state) {
                let mut updated = existing.clone();
                updated.sources.push(candidate.source.clone());
                let txn = Transaction {
                    guards: Vec::new(),
                    entities: Vec::new(),
                    relationships: vec![updated],
                    entries: vec![EntryDraft {
                        subject: ProvenanceSubject::Relationship(existing.id),
                        op: LedgerOp::AddSource,
                        source: Some(candidate.source.clone()),
                        timestamp: Utc::now(),
                        resulting_version: None,
                    }],
                };
                self.store.commit(txn).map_err(CanonError::from)?;
                return Ok(MergeReceipt {
                    outcome: MergeOutcome::Merged,
                    entity: subject.state.entity(),
                    relationship: Some(existing.id),
                });
            }
        }

        let record = RelationshipRecord {
            id: RelationshipId::new(),
            subject: subject.state.clone(),
            predicate: relationship.predicate.clone(),
            object: object.state.clone(),
            sources: vec![candidate.source.clone()],
            confidence: candidate.confidence,
            created_at: Utc::now(),
        };
        let txn = Transaction {
            guards: Vec::new(),
            entities: Vec::new(),
            relationships: vec![record.clone()],
            entries: vec![EntryDraft {
                subject: ProvenanceSubject::Relationship(record.id),
                op: LedgerOp::Link {
                    record: record.clone(),
                },
                source: Some(candidate.source.clone()),
                timestamp: record.created_at,
                resulting_version: None,
            }],
        };
        self.store.commit(txn).map_err(CanonError::from)?;

        // Pending endpoints learn their link so resolution can complete it.
        self.register_pending_links(&subject, record.id, LinkSide::Subject)?;
        self.register_pending_links(&object, record.id, LinkSide::Object)?;

        info!(link = %record.id, predicate = %relationship.predicate, complete = record.is_complete(), "relationship recorded");
        Ok(MergeReceipt {
            outcome: MergeOutcome::Created,
            entity: subject.state.entity(),
            relationship: Some(record.id),
        })
    }

    fn resolve_endpoint(
        &self,
        candidate: &ValidatedCandidate,
        endpoint: &ValidatedEndpoint,
    ) -> CanonResult<ResolvedEndpoint> {
        let sub_candidate = ValidatedCandidate {
            category: endpoint.category,
            name: endpoint.name.clone(),
            normalized_name: endpoint.normalized_name.clone(),
            attributes: std::collections::BTreeMap::new(),
            source: candidate.source.clone(),
            confidence: candidate.confidence,
            relationship: None,
        };
        let receipt = self.process_entity(sub_candidate)?;
        let state = match (receipt.outcome, receipt.entity) {
            (MergeOutcome::Corroborating, _) => EndpointState::Pending {
                name: endpoint.name.clone(),
                category: endpoint.category,
            },
            (_, Some(entity)) => EndpointState::Resolved { entity },
            (_, None) => EndpointState::Pending {
                name: endpoint.name.clone(),
                category: endpoint.category,
            },
        };
        Ok(ResolvedEndpoint {
            state,
            pending_key: matches!(receipt.outcome, MergeOutcome::Corroborating).then(|| {
                (endpoint.category, endpoint.normalized_name.clone())
            }),
        })
    }

    fn register_pending_links(
        &self,
        endpoint: &ResolvedEndpoint,
        link: RelationshipId,
        side: LinkSide,
    ) -> CanonResult<()> {
        let Some(key) = &endpoint.pending_key else {
            return Ok(());
        };
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| StorageError::Backend("poisoned lock: pending".to_string()))
            .map_err(CanonError::from)?;
        if let Some(held) = pending.get_mut(key) {
            held.links.push((link, side));
        }
        Ok(())
    }

    /// Completes links whose pending endpoint just resolved.
    fn resolve_links(
        &self,
        links: &[(RelationshipId, LinkSide)],
        entity: EntityId,
    ) -> CanonResult<()> {
        for (link_id, side) in links {
            let Some(mut record) = self.store.relationship(*link_id).map_err(CanonError::from)?
            else {
                continue;
            };
            record.resolve_endpoint(*side, entity);
            let txn = Transaction {
                guards: Vec::new(),
                entities: Vec::new(),
                relationships: vec![record],
                entries: vec![EntryDraft {
                    subject: ProvenanceSubject::Relationship(*link_id),
                    op: LedgerOp::LinkEndpointResolved {
                        side: *side,
                        entity,
                    },
                    source: None,
                    timestamp: Utc::now(),
                    resulting_version: None,
                }],
            };
            self.store.commit(txn).map_err(CanonError::from)?;
            debug!(link = %link_id, side = %side, %entity, "link endpoint resolved");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Adjudication and post-hoc duplicate merges
    // ------------------------------------------------------------------

    /// Lists every open field dispute.
    pub fn pending_conflicts(&self) -> CanonResult<Vec<PendingConflict>> {
        let snapshot = self.store.snapshot().map_err(CanonError::from)?;
        let mut out = Vec::new();
        for entity in snapshot.entities.values() {
            for dispute in &entity.conflicts {
                out.push(PendingConflict {
                    entity: entity.id,
                    name: entity.canonical_name.clone(),
                    key: dispute.key.clone(),
                    competing: dispute.competing.clone(),
                });
            }
        }
        Ok(out)
    }

    /// Applies an external adjudication: the chosen value must be one of
    /// the competing observations; it becomes the accepted value and the
    /// dispute closes.
    pub fn resolve_conflict(
        &self,
        entity_id: EntityId,
        key: &str,
        chosen: &AttributeValue,
        rationale: &str,
    ) -> CanonResult<MergeReceipt> {
        for _attempt in 0..self.config.retry_budget {
            let Some(mut entity) = self.store.entity(entity_id).map_err(CanonError::from)? else {
                return Err(MergeError::EntityNotFound(entity_id).into());
            };
            let landed_on = entity.id;
            let expected = entity.version;

            let Some(position) = entity.conflicts.iter().position(|d| d.key == key) else {
                return Err(MergeError::NoOpenDispute {
                    entity: landed_on,
                    key: key.to_string(),
                }
                .into());
            };
            let dispute = entity.conflicts.remove(position);
            let Some(winner) = dispute
                .competing
                .iter()
                .find(|c| c.value.is_identical(chosen))
                .cloned()
            else {
                return Err(MergeError::ResolutionNotAmongCompeting {
                    entity: landed_on,
                    key: key.to_string(),
                }
                .into());
            };

            let now = Utc::now();
            entity.attributes.insert(key.to_string(), winner.clone());
            entity.bump(now);

            let txn = Transaction {
                guards: vec![crate::storage::VersionGuard {
                    entity: landed_on,
                    expected,
                }],
                entities: vec![entity.clone()],
                relationships: Vec::new(),
                entries: vec![EntryDraft {
                    subject: ProvenanceSubject::Entity(landed_on),
                    op: LedgerOp::ResolveConflict {
                        key: key.to_string(),
                        chosen: winner,
                        rationale: rationale.to_string(),
                        competing: dispute.competing,
                    },
                    source: None,
                    timestamp: now,
                    resulting_version: Some(entity.version),
                }],
            };

            match self.store.commit(txn) {
                Ok(_) => {
                    info!(entity = %landed_on, key, "conflict resolved");
                    return Ok(MergeReceipt::entity(MergeOutcome::Merged, landed_on));
                }
                Err(StorageError::VersionConflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(MergeError::RetryExhausted {
            entity: entity_id,
            budget: self.config.retry_budget,
        }
        .into())
    }

    /// Post-hoc duplicate merge: folds `loser` into `winner` under the
    /// field policy, re-points the loser's aliases, and marks the loser
    /// superseded. The loser is never deleted; reads of its ID redirect.
    pub fn merge_duplicates(
        &self,
        winner_id: EntityId,
        loser_id: EntityId,
    ) -> CanonResult<Entity> {
        if winner_id == loser_id {
            return Err(MergeError::SelfMerge(winner_id).into());
        }
        let epsilon = self.config.confidence_epsilon;

        for _attempt in 0..self.config.retry_budget {
            let Some(mut winner) = self.store.entity(winner_id).map_err(CanonError::from)? else {
                return Err(MergeError::EntityNotFound(winner_id).into());
            };
            let Some(mut loser) = self.store.entity_raw(loser_id).map_err(CanonError::from)?
            else {
                return Err(MergeError::EntityNotFound(loser_id).into());
            };
            if loser.merged_into == Some(winner.id) {
                return Ok(winner);
            }
            if winner.category != loser.category {
                return Err(MergeError::CategoryMismatch {
                    winner: winner.id,
                    winner_category: winner.category,
                    loser: loser.id,
                    loser_category: loser.category,
                }
                .into());
            }

            let now = Utc::now();
            let winner_expected = winner.version;
            let loser_expected = loser.version;
            let winner_subject = ProvenanceSubject::Entity(winner.id);
            let mut drafts: Vec<EntryDraft> = Vec::new();

            for alias in loser.aliases.clone() {
                if winner.add_alias(alias.clone()) {
                    drafts.push(EntryDraft {
                        subject: winner_subject,
                        op: LedgerOp::AddAlias { alias },
                        source: None,
                        timestamp: now,
                        resulting_version: None,
                    });
                }
            }

            for (key, stored) in loser.attributes.clone() {
                let observation = ValidatedObservation {
                    value: stored.value.clone(),
                    confidence: stored.confidence,
                };
                apply_observation(
                    &mut winner,
                    &key,
                    &observation,
                    &stored.source,
                    now,
                    epsilon,
                    &mut |op, source| {
                        drafts.push(EntryDraft {
                            subject: winner_subject,
                            op,
                            source,
                            timestamp: now,
                            resulting_version: None,
                        });
                    },
                );
            }

            for source in loser.sources.clone() {
                winner.sources.push(source.clone());
                drafts.push(EntryDraft {
                    subject: winner_subject,
                    op: LedgerOp::AddSource,
                    source: Some(source),
                    timestamp: now,
                    resulting_version: None,
                });
            }

            winner.bump(now);
            for d in &mut drafts {
                d.resulting_version = Some(winner.version);
            }

            loser.merged_into = Some(winner.id);
            loser.bump(now);
            drafts.push(EntryDraft {
                subject: ProvenanceSubject::Entity(loser.id),
                op: LedgerOp::Redirect { into: winner.id },
                source: None,
                timestamp: now,
                resulting_version: Some(loser.version),
            });

            let category = winner.category;
            let loser_aliases: Vec<String> = loser
                .aliases
                .iter()
                .map(|a| crate::normalize::normalize_name(a))
                .collect();
            let txn = Transaction {
                guards: vec![
                    crate::storage::VersionGuard {
                        entity: winner.id,
                        expected: winner_expected,
                    },
                    crate::storage::VersionGuard {
                        entity: loser.id,
                        expected: loser_expected,
                    },
                ],
                entities: vec![winner.clone(), loser.clone()],
                relationships: Vec::new(),
                entries: drafts,
            };

            match self.store.commit(txn) {
                Ok(_) => {
                    let skipped =
                        self.index
                            .redirect(category, &loser_aliases, loser.id, winner.id);
                    if !skipped.is_empty() {
                        warn!(count = skipped.len(), "aliases owned by third entities were not re-pointed");
                    }
                    info!(winner = %winner.id, loser = %loser.id, "duplicate merged");
                    return Ok(winner);
                }
                Err(StorageError::VersionConflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(MergeError::RetryExhausted {
            entity: winner_id,
            budget: self.config.retry_budget,
        }
        .into())
    }
}

struct ResolvedEndpoint {
    state: EndpointState,
    pending_key: Option<PendingKey>,
}

/// The field-level merge policy. Returns true if the observation opened
/// or joined a dispute.
///
/// - absent key: accept the value
/// - identical value: nothing (the caller cites the source)
/// - tie within epsilon: dispute; the field loses its accepted value
/// - strictly higher confidence: overwrite, before-value in the ledger
/// - lower confidence: keep stored, record the rejected value
fn apply_observation(
    entity: &mut Entity,
    key: &str,
    observation: &ValidatedObservation,
    source: &crate::source::SourceRef,
    now: DateTime<Utc>,
    epsilon: f32,
    emit: &mut dyn FnMut(LedgerOp, Option<crate::source::SourceRef>),
) -> bool {
    let incoming = FieldValue {
        value: observation.value.clone(),
        confidence: observation.confidence,
        source: source.clone(),
        last_updated: now,
    };

    // An open dispute absorbs every new observation of the key; nothing
    // is auto-resolved.
    if let Some(dispute) = entity.conflicts.iter_mut().find(|d| d.key == key) {
        if !dispute.contains(&incoming.value) {
            dispute.competing.push(incoming);
            let competing = dispute.competing.clone();
            emit(
                LedgerOp::FlagConflict {
                    key: key.to_string(),
                    competing,
                    displaced: None,
                },
                Some(source.clone()),
            );
        }
        return true;
    }

    match entity.attributes.get(key) {
        None => {
            emit(
                LedgerOp::UpdateField {
                    key: key.to_string(),
                    before: None,
                    after: incoming.clone(),
                },
                Some(source.clone()),
            );
            entity.attributes.insert(key.to_string(), incoming);
            false
        }
        Some(stored) if stored.value.is_identical(&incoming.value) => false,
        Some(stored) if incoming.confidence.ties_with(stored.confidence, epsilon) => {
            let displaced = stored.clone();
            entity.attributes.remove(key);
            let competing = vec![displaced.clone(), incoming];
            entity.conflicts.push(FieldDispute {
                key: key.to_string(),
                competing: competing.clone(),
                opened_at: now,
            });
            emit(
                LedgerOp::FlagConflict {
                    key: key.to_string(),
                    competing,
                    displaced: Some(displaced),
                },
                Some(source.clone()),
            );
            true
        }
        Some(stored) if incoming.confidence.beats(stored.confidence, epsilon) => {
            let before = stored.clone();
            emit(
                LedgerOp::UpdateField {
                    key: key.to_string(),
                    before: Some(before),
                    after: incoming.clone(),
                },
                Some(source.clone()),
            );
            entity.attributes.insert(key.to_string(), incoming);
            false
        }
        Some(stored) => {
            // Lower confidence: the stored value survives, the rejected
            // observation is preserved in the ledger entry.
            emit(
                LedgerOp::RejectField {
                    key: key.to_string(),
                    kept: stored.clone(),
                    rejected: incoming,
                },
                Some(source.clone()),
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CandidateRecord;
    use crate::storage::MemoryStore;
    use crate::validate::SchemaValidator;

    fn resolver() -> MergeResolver {
        MergeResolver::new(
            Arc::new(MemoryStore::new()),
            Arc::new(CanonicalIndex::new()),
            EngineConfig::default(),
        )
    }

    fn validated(category: EntityCategory, name: &str, url: &str) -> ValidatedCandidate {
        SchemaValidator::new()
            .validate(CandidateRecord::new(category, name, url).confidence(0.9))
            .unwrap()
    }

    #[test]
    fn no_match_creates_entity() {
        let r = resolver();
        let receipt = r
            .process(validated(
                EntityCategory::Organization,
                "Example Corp",
                "https://example.org/a",
            ))
            .unwrap();
        assert_eq!(receipt.outcome, MergeOutcome::Created);
        assert!(receipt.entity.is_some());
    }

    #[test]
    fn punctuation_variant_strong_matches() {
        let r = resolver();
        let first = r
            .process(validated(
                EntityCategory::Organization,
                "Example Corp",
                "https://example.org/a",
            ))
            .unwrap();
        let second = r
            .process(validated(
                EntityCategory::Organization,
                "Example Corp.",
                "https://another.example.net/b",
            ))
            .unwrap();
        assert_eq!(second.outcome, MergeOutcome::Merged);
        assert_eq!(second.entity, first.entity);
    }

    #[test]
    fn truncated_variant_is_held_for_corroboration() {
        let r = resolver();
        let first = r
            .process(validated(
                EntityCategory::Organization,
                "Example Corp",
                "https://example.org/a",
            ))
            .unwrap();
        let second = r
            .process(validated(
                EntityCategory::Organization,
                "Example Co",
                "https://another.example.net/b",
            ))
            .unwrap();
        assert_eq!(second.outcome, MergeOutcome::Corroborating);
        assert_eq!(second.entity, first.entity);
        assert_eq!(r.pending_corroborations(), 1);
    }

    #[test]
    fn shared_source_host_corroborates_immediately() {
        let r = resolver();
        let first = r
            .process(validated(
                EntityCategory::Organization,
                "Example Corp",
                "https://example.org/a",
            ))
            .unwrap();
        // Same host as the stored source: merge without holding.
        let second = r
            .process(validated(
                EntityCategory::Organization,
                "Example Co",
                "https://example.org/b",
            ))
            .unwrap();
        assert_eq!(second.outcome, MergeOutcome::Merged);
        assert_eq!(second.entity, first.entity);
        assert_eq!(r.pending_corroborations(), 0);
    }

    #[test]
    fn second_weak_observation_promotes_both() {
        let r = resolver();
        let first = r
            .process(validated(
                EntityCategory::Organization,
                "Example Corp",
                "https://example.org/a",
            ))
            .unwrap();
        let held = r
            .process(validated(
                EntityCategory::Organization,
                "Example Co",
                "https://one.example.net/b",
            ))
            .unwrap();
        assert_eq!(held.outcome, MergeOutcome::Corroborating);

        let promoted = r
            .process(validated(
                EntityCategory::Organization,
                "Example Co",
                "https://two.example.io/c",
            ))
            .unwrap();
        assert_eq!(promoted.outcome, MergeOutcome::Merged);
        assert_eq!(promoted.entity, first.entity);
        assert_eq!(r.pending_corroborations(), 0);
    }

    #[test]
    fn flush_creates_uncorroborated_pending() {
        let r = resolver();
        r.process(validated(
            EntityCategory::Organization,
            "Example Corp",
            "https://example.org/a",
        ))
        .unwrap();
        r.process(validated(
            EntityCategory::Organization,
            "Example Co",
            "https://one.example.net/b",
        ))
        .unwrap();

        let receipts = r.flush_pending().unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].outcome, MergeOutcome::Created);
        assert_eq!(r.pending_corroborations(), 0);
    }

    #[test]
    fn category_isolation_prevents_cross_matching() {
        let r = resolver();
        let org = r
            .process(validated(
                EntityCategory::Organization,
                "Jordan",
                "https://example.org/a",
            ))
            .unwrap();
        let place = r
            .process(validated(
                EntityCategory::Location,
                "Jordan",
                "https://example.org/b",
            ))
            .unwrap();
        assert_eq!(org.outcome, MergeOutcome::Created);
        assert_eq!(place.outcome, MergeOutcome::Created);
        assert_ne!(org.entity, place.entity);
    }

    #[test]
    fn equal_confidence_disagreement_flags_conflict() {
        let r = resolver();
        let validator = SchemaValidator::new();
        let first = validator
            .validate(
                CandidateRecord::new(
                    EntityCategory::Organization,
                    "Example Corp",
                    "https://example.org/a",
                )
                .confidence(0.9)
                .attribute("sector", "military", 0.8),
            )
            .unwrap();
        let second = validator
            .validate(
                CandidateRecord::new(
                    EntityCategory::Organization,
                    "Example Corp",
                    "https://another.example.net/b",
                )
                .confidence(0.9)
                .attribute("sector", "technology", 0.8),
            )
            .unwrap();

        let r1 = r.process(first).unwrap();
        let r2 = r.process(second).unwrap();
        assert_eq!(r1.outcome, MergeOutcome::Created);
        assert_eq!(r2.outcome, MergeOutcome::Conflict);

        let conflicts = r.pending_conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].key, "sector");
        assert_eq!(conflicts[0].competing.len(), 2);
    }

    #[test]
    fn higher_confidence_overwrites_and_keeps_history() {
        let r = resolver();
        let validator = SchemaValidator::new();
        let store = Arc::clone(&r.store);
        let first = validator
            .validate(
                CandidateRecord::new(
                    EntityCategory::Organization,
                    "Example Corp",
                    "https://example.org/a",
                )
                .confidence(0.9)
                .attribute("sector", "military", 0.5),
            )
            .unwrap();
        let second = validator
            .validate(
                CandidateRecord::new(
                    EntityCategory::Organization,
                    "Example Corp",
                    "https://another.example.net/b",
                )
                .confidence(0.9)
                .attribute("sector", "technology", 0.9),
            )
            .unwrap();

        let created = r.process(first).unwrap();
        r.process(second).unwrap();

        let entity = store.entity(created.entity.unwrap()).unwrap().unwrap();
        assert_eq!(
            entity.attributes["sector"].value,
            AttributeValue::text("technology")
        );

        // The superseded value survives in the ledger.
        let history = store.ledger_for_entity(entity.id).unwrap();
        let superseded = history.iter().any(|e| {
            matches!(
                &e.op,
                LedgerOp::UpdateField {
                    before: Some(before),
                    ..
                } if before.value.is_identical(&AttributeValue::text("military"))
            )
        });
        assert!(superseded);
    }

    #[test]
    fn lower_confidence_is_rejected_but_recorded() {
        let r = resolver();
        let validator = SchemaValidator::new();
        let store = Arc::clone(&r.store);
        let first = validator
            .validate(
                CandidateRecord::new(
                    EntityCategory::Organization,
                    "Example Corp",
                    "https://example.org/a",
                )
                .confidence(0.9)
                .attribute("sector", "military", 0.9),
            )
            .unwrap();
        let second = validator
            .validate(
                CandidateRecord::new(
                    EntityCategory::Organization,
                    "Example Corp",
                    "https://another.example.net/b",
                )
                .confidence(0.9)
                .attribute("sector", "technology", 0.4),
            )
            .unwrap();

        let created = r.process(first).unwrap();
        let merged = r.process(second).unwrap();
        assert_eq!(merged.outcome, MergeOutcome::Merged);

        let entity = store.entity(created.entity.unwrap()).unwrap().unwrap();
        assert_eq!(
            entity.attributes["sector"].value,
            AttributeValue::text("military")
        );
        let history = store.ledger_for_entity(entity.id).unwrap();
        assert!(history
            .iter()
            .any(|e| matches!(&e.op, LedgerOp::RejectField { .. })));
    }

    #[test]
    fn resolve_conflict_applies_choice() {
        let r = resolver();
        let validator = SchemaValidator::new();
        let store = Arc::clone(&r.store);
        let first = validator
            .validate(
                CandidateRecord::new(
                    EntityCategory::Organization,
                    "Example Corp",
                    "https://example.org/a",
                )
                .confidence(0.9)
                .attribute("sector", "military", 0.8),
            )
            .unwrap();
        let second = validator
            .validate(
                CandidateRecord::new(
                    EntityCategory::Organization,
                    "Example Corp",
                    "https://another.example.net/b",
                )
                .confidence(0.9)
                .attribute("sector", "technology", 0.8),
            )
            .unwrap();
        let created = r.process(first).unwrap();
        r.process(second).unwrap();

        let entity_id = created.entity.unwrap();
        let receipt = r
            .resolve_conflict(
                entity_id,
                "sector",
                &AttributeValue::text("technology"),
                "manual review of filings",
            )
            .unwrap();
        assert_eq!(receipt.outcome, MergeOutcome::Merged);

        let entity = store.entity(entity_id).unwrap().unwrap();
        assert!(entity.conflicts.is_empty());
        assert_eq!(
            entity.attributes["sector"].value,
            AttributeValue::text("technology")
        );
        assert!(r.pending_conflicts().unwrap().is_empty());
    }

    #[test]
    fn resolve_conflict_rejects_foreign_value() {
        let r = resolver();
        let validator = SchemaValidator::new();
        let first = validator
            .validate(
                CandidateRecord::new(
                    EntityCategory::Organization,
                    "Example Corp",
                    "https://example.org/a",
                )
                .confidence(0.9)
                .attribute("sector", "military", 0.8),
            )
            .unwrap();
        let second = validator
            .validate(
                CandidateRecord::new(
                    EntityCategory::Organization,
                    "Example Corp",
                    "https://another.example.net/b",
                )
                .confidence(0.9)
                .attribute("sector", "technology", 0.8),
            )
            .unwrap();
        let created = r.process(first).unwrap();
        r.process(second).unwrap();

        let err = r
            .resolve_conflict(
                created.entity.unwrap(),
                "sector",
                &AttributeValue::text("agriculture"),
                "guesswork",
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CanonError::Merge(MergeError::ResolutionNotAmongCompeting { .. })
        ));
    }

    #[test]
    fn merge_duplicates_redirects_and_preserves() {
        let r = resolver();
        let store = Arc::clone(&r.store);
        let a = r
            .process(validated(
                EntityCategory::Organization,
                "Acme Widgets",
                "https://example.org/a",
            ))
            .unwrap()
            .entity
            .unwrap();
        let b = r
            .process(validated(
                EntityCategory::Organization,
                "Zenith Tools",
                "https://example.org/b",
            ))
            .unwrap()
            .entity
            .unwrap();

        let merged = r.merge_duplicates(a, b).unwrap();
        assert_eq!(merged.id, a);
        assert!(merged.aliases.contains("Zenith Tools"));

        // Reads of the loser redirect; the raw record survives.
        let via_loser = store.entity(b).unwrap().unwrap();
        assert_eq!(via_loser.id, a);
        assert!(store.entity_raw(b).unwrap().unwrap().is_superseded());

        // The loser's alias now resolves to the winner.
        assert_eq!(
            r.index.resolve(EntityCategory::Organization, "zenith tools"),
            Some(a)
        );
    }

    #[test]
    fn merge_duplicates_rejects_cross_category() {
        let r = resolver();
        let org = r
            .process(validated(
                EntityCategory::Organization,
                "Jordan Industries",
                "https://example.org/a",
            ))
            .unwrap()
            .entity
            .unwrap();
        let place = r
            .process(validated(
                EntityCategory::Location,
                "Jordan",
                "https://example.org/b",
            ))
            .unwrap()
            .entity
            .unwrap();
        let err = r.merge_duplicates(org, place).unwrap_err();
        assert!(matches!(
            err,
            CanonError::Merge(MergeError::CategoryMismatch { .. })
        ));
    }

    #[test]
    fn identical_resubmission_is_idempotent() {
        let r = resolver();
        let store = Arc::clone(&r.store);
        let candidate = || {
            SchemaValidator::new()
                .validate(
                    CandidateRecord::new(
                        EntityCategory::Organization,
                        "Example Corp",
                        "https://example.org/a",
                    )
                    .confidence(0.9)
                    .attribute("sector", "military", 0.8),
                )
                .unwrap()
        };

        let first = r.process(candidate()).unwrap();
        let second = r.process(candidate()).unwrap();
        assert_eq!(first.entity, second.entity);
        assert_eq!(second.outcome, MergeOutcome::Merged);

        let entity = store.entity(first.entity.unwrap()).unwrap().unwrap();
        // One source from creation, exactly one more from the resubmission.
        assert_eq!(entity.sources.len(), 2);
        assert!(entity.conflicts.is_empty());
        // No duplicate entity appeared.
        assert_eq!(
            store
                .entities_by_category(EntityCategory::Organization)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn relationship_decomposes_and_links() {
        let r = resolver();
        let store = Arc::clone(&r.store);
        let validator = SchemaValidator::new();
        let candidate = validator
            .validate(
                CandidateRecord::relationship(
                    crate::candidate::EndpointRef::new(
                        "Example Corp",
                        EntityCategory::Organization,
                    ),
                    "operates_in",
                    crate::candidate::EndpointRef::new("Gaza", EntityCategory::Location),
                    "https://example.org/a",
                )
                .confidence(0.9),
            )
            .unwrap();

        let receipt = r.process(candidate).unwrap();
        assert_eq!(receipt.outcome, MergeOutcome::Created);
        let link = store
            .relationship(receipt.relationship.unwrap())
            .unwrap()
            .unwrap();
        assert!(link.is_complete());
        assert_eq!(link.predicate, "operates_in");

        // Both endpoints exist as canonical entities.
        assert_eq!(
            store
                .entities_by_category(EntityCategory::Organization)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store
                .entities_by_category(EntityCategory::Location)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn repeated_relationship_adds_citation_not_record() {
        let r = resolver();
        let store = Arc::clone(&r.store);
        let validator = SchemaValidator::new();
        let make = |url: &str| {
            validator
                .validate(
                    CandidateRecord::relationship(
                        crate::candidate::EndpointRef::new(
                            "Example Corp",
                            EntityCategory::Organization,
                        ),
                        "operates_in",
                        crate::candidate::EndpointRef::new("Gaza", EntityCategory::Location),
                        url,
                    )
                    .confidence(0.9),
                )
                .unwrap()
        };

        let first = r.process(make("https://example.org/a")).unwrap();
        let second = r.process(make("https://example.org/b")).unwrap();
        assert_eq!(second.outcome, MergeOutcome::Merged);
        assert_eq!(first.relationship, second.relationship);

        let link = store
            .relationship(first.relationship.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(link.sources.len(), 2);
        assert_eq!(store.relationships().unwrap().len(), 1);
    }
}
