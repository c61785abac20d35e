//! Source references and provenance of observations.
//!
//! Every candidate carries the URL it was extracted from, the retrieval
//! time, and the extraction confidence. Knowing where information comes
//! from is what makes merges auditable and corrections possible.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::confidence::Confidence;
use crate::error::ValidationError;

/// http/https URL with a hostname, `localhost`, or an IPv4 address,
/// optional port and path.
fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)^https?://(?:(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,6}\.?|localhost|\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})(?::\d+)?(?:/?|[/?]\S+)$",
        )
        .expect("url pattern is valid")
    })
}

/// Where an observation came from.
///
/// A `SourceRef` is immutable once attached to an entity; corrections add
/// new sources rather than editing old ones.
///
/// # Examples
///
/// ```
/// use canonize::SourceRef;
///
/// let source = SourceRef::checked("https://example.org/articles/42", 0.9).unwrap();
/// assert_eq!(source.host(), Some("example.org"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    /// The article or document URL the observation was extracted from.
    pub url: String,

    /// When the document was retrieved.
    pub retrieved_at: DateTime<Utc>,

    /// Extraction confidence for the whole document.
    pub confidence: Confidence,
}

impl SourceRef {
    /// Creates a source reference after validating the URL.
    ///
    /// # Errors
    /// Returns [`ValidationError::MalformedSourceUrl`] if the URL is not a
    /// well-formed http/https URL.
    pub fn checked(url: impl Into<String>, confidence: f32) -> Result<Self, ValidationError> {
        let url = url.into();
        if !is_valid_url(&url) {
            return Err(ValidationError::MalformedSourceUrl { url });
        }
        Ok(Self {
            url,
            retrieved_at: Utc::now(),
            confidence: Confidence::clamped(confidence),
        })
    }

    /// Creates a source reference with an explicit retrieval time.
    ///
    /// Used by replay and by callers that carry their own timestamps.
    pub fn checked_at(
        url: impl Into<String>,
        retrieved_at: DateTime<Utc>,
        confidence: Confidence,
    ) -> Result<Self, ValidationError> {
        let url = url.into();
        if !is_valid_url(&url) {
            return Err(ValidationError::MalformedSourceUrl { url });
        }
        Ok(Self {
            url,
            retrieved_at,
            confidence,
        })
    }

    /// Returns the host portion of the URL, if it can be sliced out.
    ///
    /// Two observations sharing a host count as a corroboration signal for
    /// weak matches.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        let rest = self
            .url
            .strip_prefix("https://")
            .or_else(|| self.url.strip_prefix("http://"))?;
        let end = rest.find(['/', '?', ':']).unwrap_or(rest.len());
        let host = &rest[..end];
        if host.is_empty() {
            None
        } else {
            Some(host)
        }
    }

    /// Returns true if two references cite the same URL.
    #[must_use]
    pub fn same_document(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.url, self.retrieved_at.to_rfc3339())
    }
}

/// Checks a URL against the harvester's well-formedness rules.
#[must_use]
pub fn is_valid_url(url: &str) -> bool {
    url_pattern().is_match(url)
}
