//! Wildcard patterns over key namespaces.

use std::fmt;
use std::str::FromStr;

use crate::KeyError;

const SEPARATOR: char = '/';
const WILDCARD: &str = "*";

/// Validates a key namespace: non-empty, no empty segments, no wildcards.
pub fn validate_key(key: &str) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }

    for segment in key.split(SEPARATOR) {
        if segment.is_empty() {
            return Err(KeyError::EmptySegment {
                key: key.to_string(),
            });
        }
        if segment.contains('*') {
            return Err(KeyError::Wildcard {
                key: key.to_string(),
            });
        }
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Any,
}

/// A namespace pattern used for targeted invalidation.
///
/// - `users/42` matches exactly `users/42`
/// - `users/*/posts` matches `users/<anything>/posts`
/// - `users/*` matches `users/42`, `users/42/posts`, ... but not `users`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl KeyPattern {
    /// Parses a pattern.
    pub fn parse(pattern: &str) -> Result<Self, KeyError> {
        if pattern.is_empty() {
            return Err(KeyError::Empty);
        }

        let mut segments = Vec::new();
        for segment in pattern.split(SEPARATOR) {
            if segment.is_empty() {
                return Err(KeyError::EmptySegment {
                    key: pattern.to_string(),
                });
            }
            if segment == WILDCARD {
                segments.push(Segment::Any);
            } else if segment.contains('*') {
                return Err(KeyError::PartialWildcard {
                    pattern: pattern.to_string(),
                });
            } else {
                segments.push(Segment::Literal(segment.to_string()));
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// A pattern matching exactly one key namespace.
    pub fn exact(key: &str) -> Result<Self, KeyError> {
        validate_key(key)?;
        Self::parse(key)
    }

    /// Returns the pattern source string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns true if the pattern contains no wildcard.
    pub fn is_exact(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Tests a key namespace against this pattern.
    pub fn matches(&self, key: &str) -> bool {
        let parts: Vec<&str> = key.split(SEPARATOR).collect();
        let last = self.segments.len() - 1;

        for (i, segment) in self.segments.iter().enumerate() {
            let Some(part) = parts.get(i) else {
                return false;
            };
            match segment {
                Segment::Literal(lit) if lit != part => return false,
                Segment::Any if i == last => return true,
                _ => {}
            }
        }

        parts.len() == self.segments.len()
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for KeyPattern {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
