//! Engine configuration.
//!
//! All merge policy knobs live here: matcher thresholds, the confidence
//! tie epsilon, the optimistic-concurrency retry budget, corroboration
//! holding bounds, and runtime sizing. Thresholds are configuration, not
//! constants.

use serde::{Deserialize, Serialize};

use crate::matcher::MatcherConfig;

/// Bounds on how long a weak match is held for corroboration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorroborationConfig {
    /// A held candidate proceeds to creation after this many subsequent
    /// submissions pass without corroboration.
    pub max_held_submissions: u32,
    /// Wall-clock cutoff for held candidates, in seconds.
    pub max_hold_seconds: i64,
}

impl Default for CorroborationConfig {
    fn default() -> Self {
        Self {
            max_held_submissions: 32,
            max_hold_seconds: 3600,
        }
    }
}

/// Sizing for the submission runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker threads processing submissions.
    pub workers: usize,
    /// Maximum queued submissions before backpressure kicks in.
    pub queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 1024,
        }
    }
}

/// Top-level engine configuration.
///
/// # Examples
///
/// ```
/// use canonize::EngineConfig;
///
/// let config: EngineConfig = serde_json::from_str(
///     r#"{ "matcher": { "auto_merge": 0.9, "corroborate": 0.7,
///          "tie_window": 0.02, "max_candidates": 8, "token_similarity": 0.9 } }"#,
/// ).unwrap();
/// assert_eq!(config.matcher.auto_merge, 0.9);
/// assert_eq!(config.retry_budget, 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fuzzy-matcher threshold policy.
    pub matcher: MatcherConfig,
    /// Confidences within this epsilon are a tie; tied disagreements
    /// become conflicts.
    pub confidence_epsilon: f32,
    /// Optimistic-concurrency retries before a merge surfaces a
    /// retryable failure.
    pub retry_budget: u32,
    /// Corroboration holding bounds for weak matches.
    pub corroboration: CorroborationConfig,
    /// Submission runtime sizing.
    pub runtime: RuntimeConfig,
}

impl EngineConfig {
    /// The default policy from the design: 0.92/0.75 thresholds,
    /// ±0.03 confidence ties, 5 retries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

// Manual Default so the epsilon and budget defaults are visible in one
// place instead of scattered through serde attributes.
impl EngineConfig {
    const DEFAULT_EPSILON: f32 = 0.03;
    const DEFAULT_RETRY_BUDGET: u32 = 5;
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            matcher: MatcherConfig::default(),
            confidence_epsilon: Self::DEFAULT_EPSILON,
            retry_budget: Self::DEFAULT_RETRY_BUDGET,
            corroboration: CorroborationConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}
