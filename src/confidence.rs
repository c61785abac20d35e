//! Confidence values with clamped range and tie semantics.
//!
//! Every observation entering the engine carries a confidence in [0, 1].
//! The merge policy compares confidences to decide overwrites, and two
//! values within a small epsilon are treated as a tie that must be
//! adjudicated rather than guessed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A confidence score in the closed interval [0.0, 1.0].
///
/// # Examples
///
/// ```
/// use canonize::Confidence;
///
/// let c = Confidence::new(0.8).unwrap();
/// assert_eq!(c.value(), 0.8);
/// assert!(Confidence::new(1.5).is_err());
/// assert_eq!(Confidence::clamped(1.5).value(), 1.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Confidence(f32);

impl Confidence {
    /// Creates a confidence value, rejecting out-of-range or non-finite input.
    ///
    /// # Errors
    /// Returns [`ValidationError::ConfidenceOutOfRange`] if `value` is not
    /// a finite number in [0.0, 1.0].
    pub fn new(value: f32) -> Result<Self, ValidationError> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ValidationError::ConfidenceOutOfRange { value })
        }
    }

    /// Creates a confidence value, clamping out-of-range input into [0.0, 1.0].
    ///
    /// Non-finite input clamps to 0.0. The schema validator uses this for
    /// normalization; strict callers use [`Confidence::new`].
    #[must_use]
    pub fn clamped(value: f32) -> Self {
        if value.is_finite() {
            Self(value.clamp(0.0, 1.0))
        } else {
            Self(0.0)
        }
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> f32 {
        self.0
    }

    /// Returns true if `self` and `other` are within `epsilon` of each other.
    ///
    /// Ties are the trigger for conflict flagging: a tie means neither
    /// observation is trustworthy enough to overwrite the other.
    #[must_use]
    pub fn ties_with(&self, other: Self, epsilon: f32) -> bool {
        (self.0 - other.0).abs() <= epsilon
    }

    /// Returns true if `self` strictly exceeds `other` beyond `epsilon`.
    #[must_use]
    pub fn beats(&self, other: Self, epsilon: f32) -> bool {
        self.0 > other.0 && !self.ties_with(other, epsilon)
    }
}

impl Default for Confidence {
    /// The default confidence is 0.0: an observation with no stated
    /// confidence never overwrites anything.
    fn default() -> Self {
        Self(0.0)
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}
