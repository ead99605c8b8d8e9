//! Path matching logic.
//!
//! # Responsibilities
//! - Match a route pattern against path segments
//! - Report how many segments were consumed (for best-match resolution)
//!
//! # Design Decisions
//! - Matching works on pre-split segments, never on raw strings
//! - Matching is case-sensitive
//! - No regex to guarantee O(n) matching

/// Trait for matching path segments against a route pattern.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Number of leading segments this pattern consumes, or `None` on no match.
    fn consumed(&self, segments: &[&str]) -> Option<usize>;
}

/// Split a request path into non-empty segments.
pub fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Matches when the pattern is a segment-wise prefix of the path.
///
/// `/api` matches `/api` and `/api/v1`, but not `/apiary`.
#[derive(Debug, Clone)]
pub struct PrefixMatcher {
    segments: Vec<String>,
}

impl PrefixMatcher {
    /// Create a new prefix matcher from a route pattern.
    pub fn new(pattern: &str) -> Self {
        Self {
            segments: split_segments(pattern).into_iter().map(String::from).collect(),
        }
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

impl Matcher for PrefixMatcher {
    fn consumed(&self, segments: &[&str]) -> Option<usize> {
        if segments.len() < self.segments.len() {
            return None;
        }
        self.segments
            .iter()
            .zip(segments)
            .all(|(expected, actual)| expected == actual)
            .then_some(self.segments.len())
    }
}

/// Matches only when the pattern consumes the whole path.
#[derive(Debug, Clone)]
pub struct ExactMatcher {
    prefix: PrefixMatcher,
}

impl ExactMatcher {
    pub fn new(pattern: &str) -> Self {
        Self {
            prefix: PrefixMatcher::new(pattern),
        }
    }
}

impl Matcher for ExactMatcher {
    fn consumed(&self, segments: &[&str]) -> Option<usize> {
        self.prefix
            .consumed(segments)
            .filter(|&n| n == segments.len())
    }
}
