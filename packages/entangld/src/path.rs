//! Dotted path type.
//!
//! Paths address nodes in a store's tree: segments separated by `.`, with
//! the empty string denoting the root. Segments are arbitrary nonempty
//! strings; parsing normalizes away empty segments, so it cannot fail.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A dotted path into a tree.
///
/// # Examples
///
/// ```rust
/// use entangld::Path;
///
/// let path = Path::parse("system.voltage");
/// assert_eq!(path.len(), 2);
///
/// // Empty segments are normalized away
/// assert_eq!(Path::parse("a..b."), Path::parse("a.b"));
/// ```
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Path {
    pub segments: Vec<String>,
}

impl Path {
    /// The root path (no segments).
    pub fn root() -> Self {
        Path {
            segments: Vec::new(),
        }
    }

    /// Parse a path string.
    ///
    /// Segments are separated by `.`; empty segments are dropped, which
    /// normalizes `a..b` and trailing dots. The empty string is the root.
    pub fn parse(s: &str) -> Self {
        Path {
            segments: s
                .split('.')
                .filter(|seg| !seg.is_empty())
                .map(|seg| seg.to_string())
                .collect(),
        }
    }

    /// Create a path from pre-split segments.
    pub fn from_segments(segments: Vec<String>) -> Self {
        Path {
            segments: segments.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    /// Check if this is the root path.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Get the number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Iterate over segments.
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.segments.iter()
    }

    /// Join this path with another.
    #[must_use]
    pub fn join(&self, other: &Path) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Path { segments }
    }

    /// Check if this path has the given prefix, segment-wise.
    ///
    /// `a.b` has prefix `a`, but `ab` does not: the test compares whole
    /// segments, never characters.
    pub fn has_prefix(&self, prefix: &Path) -> bool {
        prefix.segments.len() <= self.segments.len()
            && prefix.segments == self.segments[..prefix.segments.len()]
    }

    /// Check if this path is at or beneath `other`.
    ///
    /// True iff `other` is the root, iff the paths are equal, or iff this
    /// path extends `other` by one or more segments.
    pub fn is_beneath(&self, other: &Path) -> bool {
        self.has_prefix(other)
    }

    /// Strip a prefix from this path.
    ///
    /// Returns `None` if the prefix doesn't match.
    #[must_use]
    pub fn strip_prefix(&self, prefix: &Path) -> Option<Path> {
        if self.has_prefix(prefix) {
            Some(Path {
                segments: self.segments[prefix.segments.len()..].to_vec(),
            })
        } else {
            None
        }
    }

    /// The suffix starting at segment `start`.
    pub fn slice_from(&self, start: usize) -> Path {
        Path {
            segments: self.segments[start..].to_vec(),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Path::parse(s)
    }
}

impl std::ops::Index<usize> for Path {
    type Output = String;

    fn index(&self, i: usize) -> &Self::Output {
        &self.segments[i]
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Path::parse(&s))
    }
}

/// Macro for creating paths from literals.
///
/// # Example
///
/// ```rust
/// use entangld::path;
///
/// let p = path!("system.voltage");
/// assert_eq!(p.len(), 2);
/// ```
#[macro_export]
macro_rules! path {
    ($s:expr) => {
        $crate::Path::parse($s)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_paths() {
        assert_eq!(Path::parse("").len(), 0);
        assert_eq!(Path::parse("foo").len(), 1);
        assert_eq!(Path::parse("foo.bar").len(), 2);
        assert_eq!(Path::parse("foo.bar.baz").len(), 3);
    }

    #[test]
    fn empty_string_is_root() {
        assert!(Path::parse("").is_empty());
        assert_eq!(Path::parse(""), Path::root());
    }

    #[test]
    fn normalize_dots() {
        assert_eq!(Path::parse("foo.bar."), Path::parse("foo.bar"));
        assert_eq!(Path::parse("foo..bar"), Path::parse("foo.bar"));
        assert_eq!(Path::parse(".foo.bar"), Path::parse("foo.bar"));
    }

    #[test]
    fn is_beneath_is_segment_wise() {
        assert!(path!("a.b").is_beneath(&path!("a")));
        assert!(!path!("ab").is_beneath(&path!("a")));
    }

    #[test]
    fn is_beneath_reflexive() {
        for p in ["", "a", "a.b", "a.b.c"] {
            assert!(path!(p).is_beneath(&path!(p)));
        }
    }

    #[test]
    fn is_beneath_transitive() {
        let (a, b, c) = (path!("x.y.z"), path!("x.y"), path!("x"));
        assert!(a.is_beneath(&b));
        assert!(b.is_beneath(&c));
        assert!(a.is_beneath(&c));
    }

    #[test]
    fn everything_is_beneath_root() {
        assert!(path!("a.b.c").is_beneath(&Path::root()));
        assert!(Path::root().is_beneath(&Path::root()));
    }

    #[test]
    fn root_is_beneath_nothing_else() {
        assert!(!Path::root().is_beneath(&path!("a")));
    }

    #[test]
    fn has_prefix_works() {
        let p = path!("foo.bar.baz");
        assert!(p.has_prefix(&path!("")));
        assert!(p.has_prefix(&path!("foo")));
        assert!(p.has_prefix(&path!("foo.bar")));
        assert!(p.has_prefix(&path!("foo.bar.baz")));
        assert!(!p.has_prefix(&path!("bar")));
        assert!(!p.has_prefix(&path!("foo.bar.baz.qux")));
    }

    #[test]
    fn strip_prefix_works() {
        let p = path!("foo.bar.baz");
        assert_eq!(p.strip_prefix(&path!("foo")), Some(path!("bar.baz")));
        assert_eq!(p.strip_prefix(&path!("foo.bar")), Some(path!("baz")));
        assert_eq!(p.strip_prefix(&p), Some(Path::root()));
        assert_eq!(p.strip_prefix(&path!("other")), None);
    }

    #[test]
    fn slice_from_works() {
        let p = path!("a.b.c");
        assert_eq!(p.slice_from(0), p);
        assert_eq!(p.slice_from(1), path!("b.c"));
        assert_eq!(p.slice_from(3), Path::root());
    }

    #[test]
    fn join_works() {
        assert_eq!(path!("a").join(&path!("b.c")), path!("a.b.c"));
        assert_eq!(Path::root().join(&path!("x")), path!("x"));
        assert_eq!(path!("x").join(&Path::root()), path!("x"));
    }

    #[test]
    fn display_round_trips() {
        let p = path!("system.rapid.data");
        assert_eq!(Path::parse(&p.to_string()), p);
        assert_eq!(Path::root().to_string(), "");
    }

    #[test]
    fn serde_as_string() {
        let p = path!("a.b.c");
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"a.b.c\"");
        let back: Path = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
