//! The canonical index: category-scoped alias → entity ID lookup.
//!
//! Alias keys are normalized names (see [`crate::normalize`]), scoped by
//! category so cross-category name collisions can never merge. The index
//! is sharded with per-key compare-and-set semantics: the create path
//! claims a key atomically, so two concurrent candidates with the same
//! new name race on the claim instead of both creating an entity.
//!
//! The index is derived data — it can always be rebuilt from the entity
//! store — so it carries no provenance of its own.

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use crate::entity::{Entity, EntityCategory, EntityId};
use crate::normalize::normalize_name;

const SHARD_COUNT: usize = 16;

type AliasKey = (EntityCategory, String);

/// Outcome of an idempotent alias insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The alias was new and now points at the given entity.
    Inserted,
    /// The alias already pointed at the same entity; no-op.
    AlreadyMapped,
    /// The alias points at a different entity. The insert did not happen;
    /// the existing mapping wins until an explicit redirect.
    Collision(EntityId),
}

/// Sharded, category-scoped mapping from normalized alias to entity ID.
#[derive(Debug)]
pub struct CanonicalIndex {
    shards: Vec<RwLock<HashMap<AliasKey, EntityId>>>,
}

impl Default for CanonicalIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CanonicalIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    /// Rebuilds an index from existing entities (backend reopen).
    ///
    /// Aliases of superseded entities point at the surviving entity.
    #[must_use]
    pub fn rebuild<'a, I>(entities: I) -> Self
    where
        I: IntoIterator<Item = &'a Entity>,
    {
        let index = Self::new();
        for entity in entities {
            let target = entity.merged_into.unwrap_or(entity.id);
            for alias in &entity.aliases {
                let _ = index.insert(entity.category, &normalize_name(alias), target);
            }
        }
        index
    }

    fn shard(&self, key: &AliasKey) -> &RwLock<HashMap<AliasKey, EntityId>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Atomically claims an alias for an entity (compare-and-set).
    ///
    /// # Errors
    /// Returns the current owner if the alias is already claimed by a
    /// different entity. Claiming an alias the entity already owns is a
    /// no-op.
    pub fn claim(
        &self,
        category: EntityCategory,
        alias: &str,
        id: EntityId,
    ) -> Result<(), EntityId> {
        let key = (category, alias.to_string());
        let mut shard = self.shard(&key).write().unwrap();
        match shard.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok(())
            }
            Entry::Occupied(slot) if *slot.get() == id => Ok(()),
            Entry::Occupied(slot) => Err(*slot.get()),
        }
    }

    /// Releases a claim made by a create that failed to commit.
    ///
    /// Only removes the mapping if it still points at `id`.
    pub fn release(&self, category: EntityCategory, alias: &str, id: EntityId) -> bool {
        let key = (category, alias.to_string());
        let mut shard = self.shard(&key).write().unwrap();
        match shard.entry(key) {
            Entry::Occupied(slot) if *slot.get() == id => {
                slot.remove();
                true
            }
            _ => false,
        }
    }

    /// Idempotent insert: records an alias for an entity.
    pub fn insert(&self, category: EntityCategory, alias: &str, id: EntityId) -> InsertOutcome {
        let key = (category, alias.to_string());
        let mut shard = self.shard(&key).write().unwrap();
        match shard.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(id);
                InsertOutcome::Inserted
            }
            Entry::Occupied(slot) if *slot.get() == id => InsertOutcome::AlreadyMapped,
            Entry::Occupied(slot) => InsertOutcome::Collision(*slot.get()),
        }
    }

    /// Exact lookup of a normalized alias within a category.
    #[must_use]
    pub fn resolve(&self, category: EntityCategory, alias: &str) -> Option<EntityId> {
        let key = (category, alias.to_string());
        self.shard(&key).read().unwrap().get(&key).copied()
    }

    /// Re-points a set of aliases from a superseded entity to the
    /// survivor. Aliases that were since claimed by a third entity are
    /// left alone and returned.
    pub fn redirect(
        &self,
        category: EntityCategory,
        aliases: &[String],
        from: EntityId,
        to: EntityId,
    ) -> Vec<String> {
        let mut skipped = Vec::new();
        for alias in aliases {
            let key = (category, alias.clone());
            let mut shard = self.shard(&key).write().unwrap();
            match shard.get_mut(&key) {
                Some(current) if *current == from || *current == to => *current = to,
                Some(_) => skipped.push(alias.clone()),
                None => {
                    shard.insert(key, to);
                }
            }
        }
        skipped
    }

    /// Visits every (alias, entity) pair in a category.
    ///
    /// The matcher uses this to score a candidate against all indexed
    /// aliases of its category.
    pub fn for_each_in<F>(&self, category: EntityCategory, mut f: F)
    where
        F: FnMut(&str, EntityId),
    {
        for shard in &self.shards {
            let shard = shard.read().unwrap();
            for ((cat, alias), id) in shard.iter() {
                if *cat == category {
                    f(alias, *id);
                }
            }
        }
    }

    /// Total number of indexed aliases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().unwrap().len()).sum()
    }

    /// Returns true if no aliases are indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
