//! Replay determinism and no-data-loss guarantees.
//!
//! The provenance ledger must reproduce the live store bit-for-bit from
//! empty state, for any mix of creates, merges, conflicts, resolutions,
//! and duplicate redirects — and every superseded value must stay
//! retrievable.

use canonize::{
    AttributeValue, CandidateRecord, EndpointRef, EngineConfig, EntityCategory, LedgerOp,
    MergeEngine, ReplayState,
};

fn org(name: &str, url: &str) -> CandidateRecord {
    CandidateRecord::new(EntityCategory::Organization, name, url).confidence(0.9)
}

/// Drives the engine through every kind of mutation and returns it.
fn exercised_engine() -> MergeEngine {
    let e = MergeEngine::in_memory(EngineConfig::default());

    // Creates and strong merges.
    e.submit(org("Example Corp", "https://example.org/a").attribute("sector", "technology", 0.5))
        .unwrap();
    e.submit(org("Example Corp.", "https://one.example.net/b").attribute("sector", "military", 0.9))
        .unwrap();

    // A conflict and its resolution.
    let conflicted = e
        .submit(org("Example Corp", "https://two.example.io/c").attribute("sector", "energy", 0.9))
        .unwrap();
    let id = conflicted.entity.unwrap();
    e.resolve_conflict(
        id,
        "sector",
        &AttributeValue::text("military"),
        "defense contracts dominate revenue",
    )
    .unwrap();

    // A rejected lower-confidence observation.
    e.submit(org("Example Corp", "https://three.example.org/d").attribute("sector", "media", 0.2))
        .unwrap();

    // Relationships, including a repeat citation.
    let rel = |url: &str| {
        CandidateRecord::relationship(
            EndpointRef::new("Example Corp", EntityCategory::Organization),
            "operates_in",
            EndpointRef::new("Gaza", EntityCategory::Location),
            url,
        )
        .confidence(0.9)
    };
    e.submit(rel("https://example.org/r1")).unwrap();
    e.submit(rel("https://example.org/r2")).unwrap();

    // A post-hoc duplicate merge.
    let dup = e
        .submit(org("Globex Industrial Group", "https://example.org/e"))
        .unwrap();
    let winner = e
        .submit(org("Initech Holdings", "https://example.org/f"))
        .unwrap();
    e.merge_duplicates(winner.entity.unwrap(), dup.entity.unwrap())
        .unwrap();

    e
}

#[test]
fn full_replay_reproduces_live_state() {
    let e = exercised_engine();
    assert!(e.verify_replay().unwrap());

    // And the replayed state is structurally identical, not just
    // digest-equal.
    let replayed = e.full_replay().unwrap();
    let live_orgs = e
        .entities_by_category(EntityCategory::Organization)
        .unwrap();
    for entity in live_orgs {
        assert_eq!(replayed.entities.get(&entity.id), Some(&entity));
    }
}

#[test]
fn replay_is_deterministic_across_runs() {
    use canonize::{KnowledgeStore, MemoryStore};
    use std::sync::Arc;

    let store = Arc::new(MemoryStore::new());
    let e = MergeEngine::with_store(store.clone(), EngineConfig::default()).unwrap();
    e.submit(org("Example Corp", "https://example.org/a").attribute("sector", "military", 0.8))
        .unwrap();
    e.submit(org("Example Corp.", "https://one.example.net/b"))
        .unwrap();

    let entries = store.ledger().unwrap();
    let a = ReplayState::from_entries(&entries).unwrap();
    let b = ReplayState::from_entries(&entries).unwrap();
    assert_eq!(hex::encode(a.digest()), hex::encode(b.digest()));
    assert_eq!(a.digest(), store.state_digest().unwrap());
}

#[test]
fn superseded_values_stay_retrievable() {
    let e = MergeEngine::in_memory(EngineConfig::default());
    let created = e
        .submit(org("Example Corp", "https://example.org/a").attribute("employees", 1000_i64, 0.4))
        .unwrap();
    e.submit(org("Example Corp", "https://one.example.net/b").attribute("employees", 1800_i64, 0.9))
        .unwrap();

    let id = created.entity.unwrap();
    let entity = e.entity(id).unwrap().unwrap();
    assert_eq!(entity.attributes["employees"].value, AttributeValue::Int(1800));

    // The overwritten value is still in the entity's replay stream.
    let history = e.replay(id).unwrap();
    let superseded_visible = history.iter().any(|entry| {
        matches!(&entry.op, LedgerOp::UpdateField { before: Some(before), .. }
            if before.value == AttributeValue::Int(1000))
    });
    assert!(superseded_visible);
}

#[test]
fn rejected_observations_are_recorded_not_lost() {
    let e = MergeEngine::in_memory(EngineConfig::default());
    let created = e
        .submit(org("Example Corp", "https://example.org/a").attribute("sector", "military", 0.9))
        .unwrap();
    e.submit(org("Example Corp", "https://one.example.net/b").attribute("sector", "media", 0.3))
        .unwrap();

    let id = created.entity.unwrap();
    let history = e.replay(id).unwrap();
    let rejected_recorded = history.iter().any(|entry| {
        matches!(&entry.op, LedgerOp::RejectField { rejected, .. }
            if rejected.value == AttributeValue::text("media"))
    });
    assert!(rejected_recorded);

    // But the accepted value never moved.
    let entity = e.entity(id).unwrap().unwrap();
    assert_eq!(
        entity.attributes["sector"].value,
        AttributeValue::text("military")
    );
}

#[test]
fn redirect_survives_replay() {
    let e = MergeEngine::in_memory(EngineConfig::default());
    let winner = e
        .submit(org("Acme Widgets", "https://example.org/a"))
        .unwrap()
        .entity
        .unwrap();
    let loser = e
        .submit(org("Zenith Tools", "https://example.org/b"))
        .unwrap()
        .entity
        .unwrap();
    e.merge_duplicates(winner, loser).unwrap();

    let replayed = e.full_replay().unwrap();
    let replayed_loser = &replayed.entities[&loser];
    assert_eq!(replayed_loser.merged_into, Some(winner));
    assert!(replayed.entities[&winner].aliases.contains("Zenith Tools"));
    assert!(e.verify_replay().unwrap());
}
