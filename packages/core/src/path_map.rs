//! An ordered map from paths to values with longest-prefix lookup.
//!
//! Paths order segment-wise, so every entry below a path sits in one
//! contiguous key range starting at that path. The mount table relies on this
//! for listing and nesting checks.

use std::collections::BTreeMap;

use crate::Path;

/// Values keyed by path.
///
/// ```rust
/// use mountdb_core::{path, PathMap};
///
/// let mut mounts = PathMap::new();
/// mounts.insert(&path!("/"), "root");
/// mounts.insert(&path!("/Volumes/Host"), "host");
///
/// let (owner, rest) = mounts.longest_prefix(&path!("/Volumes/Host/file.xml")).unwrap();
/// assert_eq!(*owner, "host");
/// assert_eq!(rest, path!("/file.xml"));
/// ```
#[derive(Debug, Clone)]
pub struct PathMap<T> {
    entries: BTreeMap<Path, T>,
}

impl<T> Default for PathMap<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> PathMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the value previously stored at `path`.
    pub fn insert(&mut self, path: &Path, value: T) -> Option<T> {
        self.entries.insert(path.clone(), value)
    }

    /// Entries below `path` are untouched.
    pub fn remove(&mut self, path: &Path) -> Option<T> {
        self.entries.remove(path)
    }

    pub fn get(&self, path: &Path) -> Option<&T> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// The value at the deepest stored ancestor of `path` (or `path`
    /// itself), with the remainder of `path` below it.
    pub fn longest_prefix(&self, path: &Path) -> Option<(&T, Path)> {
        (0..=path.len()).rev().find_map(|depth| {
            self.entries
                .get(&path.slice(0, depth))
                .map(|value| (value, path.slice(depth, path.len())))
        })
    }

    /// Entries strictly below `path`, in path order.
    fn below<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = (&'a Path, &'a T)> + 'a {
        self.entries
            .range(path.clone()..)
            .take_while(move |(key, _)| key.has_prefix(path))
            .filter(move |(key, _)| key.len() > path.len())
    }

    /// Paths stored strictly below `path`, deepest first.
    pub fn descendants(&self, path: &Path) -> Vec<Path> {
        let mut found: Vec<Path> = self.below(path).map(|(key, _)| key.clone()).collect();
        found.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        found
    }

    /// Names of the direct children of `path` with at least one entry at or
    /// below them.
    pub fn child_names(&self, path: &Path) -> Vec<String> {
        let mut names: Vec<String> = self
            .below(path)
            .map(|(key, _)| key[path.len()].to_string())
            .collect();
        names.dedup();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &T)> {
        self.entries.iter()
    }
}
