//! Absolute node paths.

use std::fmt;
use std::ops::Index;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// A segment is not acceptable as a node name.
    #[error("invalid segment {segment:?} at depth {depth}: {reason}")]
    InvalidSegment {
        segment: String,
        depth: usize,
        reason: String,
    },

    /// The path is well formed but not valid for the requested operation.
    #[error("invalid path: {message}")]
    InvalidPath { message: String },
}

/// An absolute path in a node tree.
///
/// Segments are case-sensitive and separated by `/`. The root path has no
/// segments and displays as `/`; every other path displays with a leading
/// separator and no trailing one.
///
/// The same type is used for paths in the logical namespace and for paths
/// relative to a mount point: a relative path is simply absolute with respect
/// to the root of the mounted database.
///
/// Paths order segment by segment, so a path sorts directly before
/// everything below it.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<String>,
}

fn check_segment(segment: &str, depth: usize) -> Result<(), PathError> {
    let reason = if segment.is_empty() {
        "empty segment".to_string()
    } else if segment == "." || segment == ".." {
        "relative segments are not allowed".to_string()
    } else if let Some(c) = segment.chars().find(|c| matches!(c, '/' | '\\' | '\0')) {
        format!("invalid character {:?}", c)
    } else {
        return Ok(());
    };
    Err(PathError::InvalidSegment {
        segment: segment.to_string(),
        depth,
        reason,
    })
}

impl Path {
    /// The root path (`/`).
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a path string.
    ///
    /// Repeated separators collapse, and a missing leading `/` is tolerated,
    /// so `"a//b/"`, `"/a/b"` and `"a/b"` all parse to `/a/b`.
    ///
    /// ```rust
    /// use mountdb_core::Path;
    ///
    /// let path = Path::parse("/Volumes/Host/file.xml").unwrap();
    /// assert_eq!(path.len(), 3);
    /// assert_eq!(path.to_string(), "/Volumes/Host/file.xml");
    /// assert!(Path::parse("/a/../b").is_err());
    /// ```
    pub fn parse(s: &str) -> Result<Self, PathError> {
        s.split('/')
            .filter(|segment| !segment.is_empty())
            .enumerate()
            .map(|(depth, segment)| check_segment(segment, depth).map(|()| segment.to_string()))
            .collect::<Result<Vec<_>, _>>()
            .map(|segments| Path { segments })
    }

    /// Check a single segment as a node name.
    pub fn validate_name(name: &str) -> Result<(), PathError> {
        check_segment(name, 0)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments; zero for the root.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.is_root()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.segments.iter()
    }

    /// The last segment, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        let (_, init) = self.segments.split_last()?;
        Some(Path {
            segments: init.to_vec(),
        })
    }

    #[must_use]
    pub fn join(&self, other: &Path) -> Path {
        Path {
            segments: self.segments.iter().chain(&other.segments).cloned().collect(),
        }
    }

    /// Append one checked segment.
    pub fn child(&self, name: &str) -> Result<Path, PathError> {
        check_segment(name, self.len())?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Path { segments })
    }

    /// Segment-wise prefix test: `/Volumes/HostData` is not below
    /// `/Volumes/Host`.
    pub fn has_prefix(&self, prefix: &Path) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// The rest of this path below `prefix`, or `None` if `prefix` is not an
    /// ancestor (or the path itself).
    #[must_use]
    pub fn strip_prefix(&self, prefix: &Path) -> Option<Path> {
        self.segments
            .strip_prefix(prefix.segments.as_slice())
            .map(|rest| Path {
                segments: rest.to_vec(),
            })
    }

    /// Segments `start..end` as a path.
    pub fn slice(&self, start: usize, end: usize) -> Path {
        Path {
            segments: self.segments[start..end].to_vec(),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        self.segments
            .iter()
            .try_for_each(|segment| write!(f, "/{}", segment))
    }
}

impl Index<usize> for Path {
    type Output = str;

    fn index(&self, depth: usize) -> &str {
        &self.segments[depth]
    }
}

impl FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::parse(s)
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Path::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Build a path from a literal, panicking if it is malformed.
///
/// ```rust
/// use mountdb_core::path;
///
/// assert_eq!(path!("/a/b/c").len(), 3);
/// ```
#[macro_export]
macro_rules! path {
    ($s:expr) => {
        $crate::Path::parse($s).expect("invalid path literal")
    };
}
