//! Stream type identifiers and the supertype table used to match them.
//!
//! A stream registered for type `T` with `allow_derived` set also satisfies
//! requests for any type whose supertype chain reaches `T`. The relation is an
//! explicit table, never runtime reflection.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node::StreamInfo;
use crate::path::Path;

/// Identity of a typed stream.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamType(String);

impl StreamType {
    pub const BINARY: &'static str = "Binary";
    pub const TEXT: &'static str = "Text";
    pub const XML: &'static str = "Xml";
    pub const JSON: &'static str = "Json";
    pub const CONFIG: &'static str = "Config";

    pub fn new(name: impl Into<String>) -> Self {
        StreamType(name.into())
    }

    pub fn binary() -> Self {
        Self::new(Self::BINARY)
    }

    pub fn text() -> Self {
        Self::new(Self::TEXT)
    }

    pub fn xml() -> Self {
        Self::new(Self::XML)
    }

    pub fn json() -> Self {
        Self::new(Self::JSON)
    }

    pub fn config() -> Self {
        Self::new(Self::CONFIG)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamType {
    fn from(s: &str) -> Self {
        StreamType::new(s)
    }
}

/// Table of declared supertypes.
///
/// Types that were never registered are valid leaf types with no supertypes.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    supertypes: BTreeMap<StreamType, Vec<StreamType>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// A registry holding the built-in hierarchy:
    /// `Binary <- Text <- {Xml, Json, Config}`.
    pub fn new() -> Self {
        let mut supertypes = BTreeMap::new();
        supertypes.insert(StreamType::binary(), Vec::new());
        supertypes.insert(StreamType::text(), vec![StreamType::binary()]);
        supertypes.insert(StreamType::xml(), vec![StreamType::text()]);
        supertypes.insert(StreamType::json(), vec![StreamType::text()]);
        supertypes.insert(StreamType::config(), vec![StreamType::text()]);
        Self { supertypes }
    }

    /// A registry with no types at all.
    pub fn empty() -> Self {
        Self {
            supertypes: BTreeMap::new(),
        }
    }

    /// Declare `stream_type` with the given direct supertypes.
    ///
    /// Re-registering replaces the previous declaration. Declarations that
    /// would make a type its own ancestor are rejected.
    pub fn register(&mut self, stream_type: StreamType, supertypes: Vec<StreamType>) -> Result<()> {
        for sup in &supertypes {
            if sup == &stream_type || self.distance(sup, &stream_type).is_some() {
                return Err(Error::not_supported(format!(
                    "registering {} under {} would create a cycle",
                    stream_type, sup
                )));
            }
        }
        self.supertypes.insert(stream_type, supertypes);
        Ok(())
    }

    pub fn is_registered(&self, stream_type: &StreamType) -> bool {
        self.supertypes.contains_key(stream_type)
    }

    pub fn supertypes(&self, stream_type: &StreamType) -> &[StreamType] {
        self.supertypes
            .get(stream_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Length of the shortest supertype chain from `sub` up to `sup`.
    ///
    /// `Some(0)` when the types are equal, `None` when `sup` is not an
    /// ancestor of `sub`.
    pub fn distance(&self, sub: &StreamType, sup: &StreamType) -> Option<usize> {
        let mut queue = VecDeque::from([(sub, 0usize)]);
        let mut seen = BTreeSet::new();
        while let Some((current, depth)) = queue.pop_front() {
            if current == sup {
                return Some(depth);
            }
            if !seen.insert(current) {
                continue;
            }
            for parent in self.supertypes(current) {
                queue.push_back((parent, depth + 1));
            }
        }
        None
    }

    pub fn is_subtype(&self, sub: &StreamType, sup: &StreamType) -> bool {
        self.distance(sub, sup).is_some()
    }

    /// Pick the registered stream that best satisfies `requested`.
    ///
    /// An exact match always wins. Otherwise only streams whose options allow
    /// derived types are considered, and the most specific (closest)
    /// supertype is chosen. Several equally close candidates are an error.
    pub fn resolve(
        &self,
        path: &Path,
        requested: &StreamType,
        available: &[StreamInfo],
    ) -> Result<StreamType> {
        if available.iter().any(|s| &s.stream_type == requested) {
            return Ok(requested.clone());
        }

        let mut best: Option<usize> = None;
        let mut candidates: Vec<StreamType> = Vec::new();
        for stream in available.iter().filter(|s| s.options.allow_derived) {
            let Some(d) = self.distance(requested, &stream.stream_type) else {
                continue;
            };
            match best {
                Some(b) if d > b => {}
                Some(b) if d == b => candidates.push(stream.stream_type.clone()),
                _ => {
                    best = Some(d);
                    candidates = vec![stream.stream_type.clone()];
                }
            }
        }

        match candidates.len() {
            0 => Err(Error::StreamNotFound {
                path: path.clone(),
                stream_type: requested.clone(),
            }),
            1 => Ok(candidates.remove(0)),
            _ => Err(Error::AmbiguousStreamType {
                path: path.clone(),
                requested: requested.clone(),
                candidates,
            }),
        }
    }
}
