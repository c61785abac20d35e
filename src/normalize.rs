//! Name normalization shared by the validator, the matcher, and the index.
//!
//! All alias keys are normalized the same way so that "Example Corp." and
//! "example corp" land on the same index entry.

/// Normalizes a name for use as an alias key: trims, casefolds, replaces
/// punctuation with spaces, and collapses whitespace runs.
///
/// # Examples
///
/// ```
/// use canonize::normalize::normalize_name;
///
/// assert_eq!(normalize_name("  Example Corp. "), "example corp");
/// assert_eq!(normalize_name("AT&T"), "at t");
/// ```
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_space = false;
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_space = true;
        }
    }
    out
}

/// Splits a normalized name into its tokens.
#[must_use]
pub fn tokens(normalized: &str) -> Vec<&str> {
    normalized.split(' ').filter(|t| !t.is_empty()).collect()
}
