//! Glob-style matching of event types against subscription patterns.
//!
//! Patterns are dot-segmented strings in which `*` matches any run of
//! characters, including dots: `agent.*` matches `agent.message.sent`,
//! and `*` alone matches everything. All other characters match literally.

use crate::error::BusError;
use regex::Regex;

/// A subscription pattern compiled once for repeated matching.
#[derive(Debug, Clone)]
pub struct TypePattern {
    raw: String,
    regex: Regex,
}

impl TypePattern {
    /// Compile a pattern. Literal characters are escaped, so the only
    /// metacharacter is `*`.
    pub fn new(pattern: &str) -> Result<Self, BusError> {
        let regex = Regex::new(&glob_to_regex(pattern)).map_err(|source| {
            BusError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;

        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    /// Check whether an event type matches this pattern.
    pub fn matches(&self, event_type: &str) -> bool {
        self.regex.is_match(event_type)
    }

    /// The original pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// One-shot match without keeping the compiled pattern around.
///
/// Used for history filtering, where the pattern lives only for the query.
/// An unparsable pattern matches nothing.
pub fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    TypePattern::new(pattern)
        .map(|p| p.matches(event_type))
        .unwrap_or(false)
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for segment in pattern.split('*') {
        // Segments between wildcards are literal text.
        out.push_str(&regex::escape(segment));
        out.push_str(".*");
    }
    // split() yields one trailing segment, so one ".*" too many.
    out.truncate(out.len() - 2);
    out.push('$');
    out
}
