//! Token-aware fuzzy matching against the canonical index.
//!
//! Similarity is the maximum of two views of a name pair:
//! - a soft token-overlap score (order-insensitive; tokens pair up when
//!   their Jaro–Winkler similarity clears a cutoff), and
//! - normalized Levenshtein over the whole normalized strings, which
//!   catches punctuation-level and truncation-level variants the token
//!   view scores too harshly.
//!
//! Both inputs are normalized first, so matching is case- and
//! punctuation-insensitive. Matching is always scoped to one category:
//! a person and a country sharing a name must never merge.

use serde::{Deserialize, Serialize};
use strsim::{jaro_winkler, normalized_levenshtein};

use crate::entity::{EntityCategory, EntityId};
use crate::index::CanonicalIndex;
use crate::normalize::tokens;

/// Threshold policy for the matcher.
///
/// The defaults are a testable policy, not discovered constants; tune
/// them per corpus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Scores at or above this auto-match (single top candidate only).
    pub auto_merge: f32,
    /// Scores in `[corroborate, auto_merge)` take the probable-match
    /// path and require corroboration.
    pub corroborate: f32,
    /// Two candidates within this window of each other (both above
    /// `corroborate`) are an ambiguous conflict, never a guess.
    pub tie_window: f32,
    /// Maximum ranked candidates returned.
    pub max_candidates: usize,
    /// Minimum Jaro–Winkler similarity for two tokens to pair up in the
    /// token-overlap score.
    pub token_similarity: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            auto_merge: 0.92,
            corroborate: 0.75,
            tie_window: 0.02,
            max_candidates: 8,
            token_similarity: 0.9,
        }
    }
}

/// One scored match candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    /// The indexed entity.
    pub entity: EntityId,
    /// Similarity of the candidate name to this entity's closest alias.
    pub score: f32,
}

/// The matcher's verdict for one candidate name.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    /// Nothing scored above the corroboration threshold; create a new
    /// entity.
    NoMatch,
    /// A single candidate cleared the auto-match threshold.
    Strong(MatchCandidate),
    /// The top candidate is probable but needs corroboration.
    Weak(MatchCandidate),
    /// Two or more candidates are too close to call.
    Ambiguous(Vec<MatchCandidate>),
}

/// Scores candidate names against indexed aliases.
#[derive(Debug, Clone, Default)]
pub struct FuzzyMatcher {
    config: MatcherConfig,
}

impl FuzzyMatcher {
    /// Creates a matcher with the given thresholds.
    #[must_use]
    pub const fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// The active threshold policy.
    #[must_use]
    pub const fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Similarity of two normalized names in [0.0, 1.0].
    #[must_use]
    pub fn similarity(&self, a: &str, b: &str) -> f32 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a == b {
            return 1.0;
        }
        let token_score = self.token_overlap(a, b);
        #[allow(clippy::cast_possible_truncation)]
        let edit_score = normalized_levenshtein(a, b) as f32;
        token_score.max(edit_score)
    }

    /// Order-insensitive soft token overlap (Dice coefficient over
    /// greedily paired tokens).
    fn token_overlap(&self, a: &str, b: &str) -> f32 {
        let ta = tokens(a);
        let tb = tokens(b);
        if ta.is_empty() || tb.is_empty() {
            return 0.0;
        }

        let mut used = vec![false; tb.len()];
        let mut paired = 0.0f32;
        for token_a in &ta {
            let mut best: Option<(usize, f32)> = None;
            for (j, token_b) in tb.iter().enumerate() {
                if used[j] {
                    continue;
                }
                #[allow(clippy::cast_possible_truncation)]
                let sim = jaro_winkler(token_a, token_b) as f32;
                if sim >= self.config.token_similarity
                    && best.map_or(true, |(_, s)| sim > s)
                {
                    best = Some((j, sim));
                }
            }
            if let Some((j, sim)) = best {
                used[j] = true;
                paired += sim;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let total = (ta.len() + tb.len()) as f32;
        2.0 * paired / total
    }

    /// Ranks indexed entities of `category` by similarity to a
    /// normalized candidate name. Each entity scores as its best alias.
    #[must_use]
    pub fn rank(
        &self,
        normalized_name: &str,
        category: EntityCategory,
        index: &CanonicalIndex,
    ) -> Vec<MatchCandidate> {
        let mut best: std::collections::HashMap<EntityId, f32> =
            std::collections::HashMap::new();
        index.for_each_in(category, |alias, entity| {
            let score = self.similarity(normalized_name, alias);
            if score >= self.config.corroborate {
                let slot = best.entry(entity).or_insert(0.0);
                if score > *slot {
                    *slot = score;
                }
            }
        });

        let mut ranked: Vec<MatchCandidate> = best
            .into_iter()
            .map(|(entity, score)| MatchCandidate { entity, score })
            .collect();
        // Deterministic order: score descending, entity ID as tiebreak.
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entity.cmp(&b.entity))
        });
        ranked.truncate(self.config.max_candidates);
        ranked
    }

    /// Applies the threshold policy to a ranked candidate list.
    #[must_use]
    pub fn decide(&self, ranked: &[MatchCandidate]) -> MatchDecision {
        let Some(top) = ranked.first().copied() else {
            return MatchDecision::NoMatch;
        };
        if top.score < self.config.corroborate {
            return MatchDecision::NoMatch;
        }

        let rivals: Vec<MatchCandidate> = ranked
            .iter()
            .copied()
            .filter(|c| {
                c.score >= self.config.corroborate
                    && (top.score - c.score) < self.config.tie_window
            })
            .collect();
        if rivals.len() > 1 {
            return MatchDecision::Ambiguous(rivals);
        }

        if top.score >= self.config.auto_merge {
            MatchDecision::Strong(top)
        } else {
            MatchDecision::Weak(top)
        }
    }

    /// Convenience: rank then decide.
    #[must_use]
    pub fn matches(
        &self,
        normalized_name: &str,
        category: EntityCategory,
        index: &CanonicalIndex,
    ) -> (MatchDecision, Vec<MatchCandidate>) {
        let ranked = self.rank(normalized_name, category, index);
        (self.decide(&ranked), ranked)
    }
}
