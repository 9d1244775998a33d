//! Nodes and their typed streams.
//!
//! A [`NodeTree`] is the plain in-process representation of a database: every
//! node owns its children by name and a set of independently typed streams.
//! A node's path is never stored; it is the chain of names from the root, so
//! moving a node moves its whole subtree in a single re-link.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path::Path;
use crate::stream_type::StreamType;
use crate::traits::Driver;

/// Whether a node can hold children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Holds children and streams.
    #[default]
    Directory,
    /// Holds streams only.
    Leaf,
}

/// Options fixed when a stream is added to a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Let requests for subtypes of this stream's type resolve to it.
    #[serde(default)]
    pub allow_derived: bool,
}

impl StreamOptions {
    pub fn derived() -> Self {
        Self {
            allow_derived: true,
        }
    }
}

/// Description of one stream on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub stream_type: StreamType,
    pub options: StreamOptions,
    pub len: u64,
}

/// Description of a node, as returned by `stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub path: Path,
    pub kind: NodeKind,
    pub children: usize,
    pub streams: Vec<StreamInfo>,
}

impl NodeInfo {
    pub fn name(&self) -> Option<&str> {
        self.path.name()
    }

    pub fn stream(&self, stream_type: &StreamType) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| &s.stream_type == stream_type)
    }
}

/// What a driver should create at a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub kind: NodeKind,
    /// Stream attached to the node as part of the same creation.
    pub stream: Option<(StreamType, StreamOptions)>,
    /// Create missing ancestors as directories instead of failing with
    /// `MissingParent`.
    pub implicit_parents: bool,
}

/// Caller-facing creation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOptions {
    pub kind: NodeKind,
    pub implicit_parents: bool,
    pub stream: StreamOptions,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            kind: NodeKind::Directory,
            implicit_parents: true,
            stream: StreamOptions::default(),
        }
    }
}

impl CreateOptions {
    /// Fail with `MissingParent` instead of creating ancestors.
    pub fn strict() -> Self {
        Self {
            implicit_parents: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn leaf(mut self) -> Self {
        self.kind = NodeKind::Leaf;
        self
    }

    #[must_use]
    pub fn allow_derived(mut self) -> Self {
        self.stream.allow_derived = true;
        self
    }

    /// The driver-level spec for creating a node with these options.
    pub fn spec(&self, stream_type: Option<&StreamType>) -> NodeSpec {
        NodeSpec {
            kind: self.kind,
            stream: stream_type.map(|t| (t.clone(), self.stream)),
            implicit_parents: self.implicit_parents,
        }
    }
}

/// Stored contents of one typed stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamData {
    pub options: StreamOptions,
    pub data: Bytes,
}

/// One node of a [`NodeTree`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    kind: NodeKind,
    children: BTreeMap<String, Node>,
    streams: BTreeMap<StreamType, StreamData>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            children: BTreeMap::new(),
            streams: BTreeMap::new(),
        }
    }

    pub fn directory() -> Self {
        Self::new(NodeKind::Directory)
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn children(&self) -> &BTreeMap<String, Node> {
        &self.children
    }

    pub fn streams(&self) -> &BTreeMap<StreamType, StreamData> {
        &self.streams
    }

    /// Attach a child. Fails on leaves and duplicate names.
    pub fn insert_child(&mut self, name: String, child: Node) -> Result<()> {
        Path::validate_name(&name)?;
        if self.kind == NodeKind::Leaf {
            return Err(Error::not_supported("children on a leaf node"));
        }
        match self.children.entry(name) {
            Entry::Occupied(e) => Err(Error::AlreadyExists {
                path: Path::root().child(e.key())?,
                stream_type: None,
            }),
            Entry::Vacant(v) => {
                v.insert(child);
                Ok(())
            }
        }
    }

    /// Attach a stream. Fails on duplicate types.
    pub fn insert_stream(&mut self, stream_type: StreamType, stream: StreamData) -> Result<()> {
        match self.streams.entry(stream_type) {
            Entry::Occupied(e) => Err(Error::AlreadyExists {
                path: Path::root(),
                stream_type: Some(e.key().clone()),
            }),
            Entry::Vacant(v) => {
                v.insert(stream);
                Ok(())
            }
        }
    }

    /// Total stream bytes in this subtree.
    pub fn used_bytes(&self) -> u64 {
        let own: u64 = self.streams.values().map(|s| s.data.len() as u64).sum();
        own + self.children.values().map(Node::used_bytes).sum::<u64>()
    }

    fn info(&self, path: &Path) -> NodeInfo {
        NodeInfo {
            path: path.clone(),
            kind: self.kind,
            children: self.children.len(),
            streams: self
                .streams
                .iter()
                .map(|(stream_type, s)| StreamInfo {
                    stream_type: stream_type.clone(),
                    options: s.options,
                    len: s.data.len() as u64,
                })
                .collect(),
        }
    }

    fn stream_mut(&mut self, path: &Path, stream_type: &StreamType) -> Result<&mut StreamData> {
        self.streams
            .get_mut(stream_type)
            .ok_or_else(|| Error::StreamNotFound {
                path: path.clone(),
                stream_type: stream_type.clone(),
            })
    }
}

/// A rooted tree of nodes held entirely in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeTree {
    root: Node,
}

impl NodeTree {
    /// An empty tree holding only the root directory.
    pub fn new() -> Self {
        Self {
            root: Node::directory(),
        }
    }

    /// Wrap an already built root. The root must be a directory.
    pub fn from_root(root: Node) -> Result<Self> {
        if root.kind != NodeKind::Directory {
            return Err(Error::invalid_path("the root node must be a directory"));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Walk from the root to `path`.
    pub fn resolve(&self, path: &Path) -> Result<&Node> {
        let mut current = &self.root;
        for (depth, segment) in path.iter().enumerate() {
            if current.kind == NodeKind::Leaf {
                return Err(Error::NotADirectory {
                    path: path.slice(0, depth),
                });
            }
            current = current
                .children
                .get(segment)
                .ok_or_else(|| Error::NotFound {
                    path: path.slice(0, depth + 1),
                })?;
        }
        Ok(current)
    }

    fn resolve_mut(&mut self, path: &Path) -> Result<&mut Node> {
        let mut current = &mut self.root;
        for (depth, segment) in path.iter().enumerate() {
            if current.kind == NodeKind::Leaf {
                return Err(Error::NotADirectory {
                    path: path.slice(0, depth),
                });
            }
            current = current
                .children
                .get_mut(segment)
                .ok_or_else(|| Error::NotFound {
                    path: path.slice(0, depth + 1),
                })?;
        }
        Ok(current)
    }

    /// Walk to the directory that should own `path`, optionally creating
    /// missing ancestors.
    fn parent_for_insert(&mut self, path: &Path, implicit: bool) -> Result<&mut Node> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::invalid_path("the root node cannot be created"))?;
        let mut current = &mut self.root;
        for (depth, segment) in parent.iter().enumerate() {
            if current.kind == NodeKind::Leaf {
                return Err(Error::NotADirectory {
                    path: parent.slice(0, depth),
                });
            }
            current = match current.children.entry(segment.clone()) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(v) => {
                    if !implicit {
                        return Err(Error::MissingParent {
                            path: parent.slice(0, depth + 1),
                        });
                    }
                    v.insert(Node::directory())
                }
            };
        }
        if current.kind == NodeKind::Leaf {
            return Err(Error::NotADirectory { path: parent });
        }
        Ok(current)
    }

    fn detach(&mut self, path: &Path) -> Result<Node> {
        let (parent, name) = match (path.parent(), path.name()) {
            (Some(parent), Some(name)) => (parent, name),
            _ => return Err(Error::invalid_path("the root node cannot be removed")),
        };
        self.resolve_mut(&parent)?
            .children
            .remove(name)
            .ok_or_else(|| Error::NotFound { path: path.clone() })
    }
}

impl Driver for NodeTree {
    fn kind(&self) -> &'static str {
        "tree"
    }

    fn stat(&self, path: &Path) -> Result<NodeInfo> {
        Ok(self.resolve(path)?.info(path))
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        let node = self.resolve(path)?;
        if node.kind == NodeKind::Leaf {
            return Err(Error::NotADirectory { path: path.clone() });
        }
        Ok(node.children.keys().cloned().collect())
    }

    fn create(&mut self, path: &Path, spec: &NodeSpec) -> Result<()> {
        let parent = self.parent_for_insert(path, spec.implicit_parents)?;
        let name = path
            .name()
            .ok_or_else(|| Error::invalid_path("the root node cannot be created"))?;
        if parent.children.contains_key(name) {
            return Err(Error::AlreadyExists {
                path: path.clone(),
                stream_type: None,
            });
        }
        let mut node = Node::new(spec.kind);
        if let Some((stream_type, options)) = &spec.stream {
            node.streams.insert(
                stream_type.clone(),
                StreamData {
                    options: *options,
                    data: Bytes::new(),
                },
            );
        }
        parent.children.insert(name.to_string(), node);
        Ok(())
    }

    fn delete(&mut self, path: &Path) -> Result<()> {
        self.detach(path).map(|_| ())
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        if from.is_root() || to.is_root() {
            return Err(Error::invalid_path("the root node cannot be moved"));
        }
        if to.has_prefix(from) {
            return Err(Error::invalid_path(format!(
                "cannot move {} into its own subtree {}",
                from, to
            )));
        }
        self.resolve(from)?;
        // Validate the destination before detaching so a failure leaves the
        // tree untouched.
        let parent = to
            .parent()
            .ok_or_else(|| Error::invalid_path("the root node cannot be replaced"))?;
        match self.resolve(&parent) {
            Ok(node) if node.kind == NodeKind::Leaf => {
                return Err(Error::NotADirectory { path: parent })
            }
            Ok(node) => {
                if to.name().is_some_and(|n| node.children.contains_key(n)) {
                    return Err(Error::AlreadyExists {
                        path: to.clone(),
                        stream_type: None,
                    });
                }
            }
            Err(Error::NotFound { .. }) => return Err(Error::MissingParent { path: parent }),
            Err(e) => return Err(e),
        }

        let node = self.detach(from)?;
        let name = to
            .name()
            .ok_or_else(|| Error::invalid_path("the root node cannot be replaced"))?;
        self.resolve_mut(&parent)?
            .children
            .insert(name.to_string(), node);
        Ok(())
    }

    fn add_stream(
        &mut self,
        path: &Path,
        stream_type: &StreamType,
        options: StreamOptions,
    ) -> Result<()> {
        let node = self.resolve_mut(path)?;
        if node.streams.contains_key(stream_type) {
            return Err(Error::AlreadyExists {
                path: path.clone(),
                stream_type: Some(stream_type.clone()),
            });
        }
        node.streams.insert(
            stream_type.clone(),
            StreamData {
                options,
                data: Bytes::new(),
            },
        );
        Ok(())
    }

    fn remove_stream(&mut self, path: &Path, stream_type: &StreamType) -> Result<bool> {
        Ok(self.resolve_mut(path)?.streams.remove(stream_type).is_some())
    }

    fn read_stream(&self, path: &Path, stream_type: &StreamType) -> Result<Bytes> {
        self.resolve(path)?
            .streams
            .get(stream_type)
            .map(|s| s.data.clone())
            .ok_or_else(|| Error::StreamNotFound {
                path: path.clone(),
                stream_type: stream_type.clone(),
            })
    }

    fn write_stream(&mut self, path: &Path, stream_type: &StreamType, data: Bytes) -> Result<()> {
        self.resolve_mut(path)?.stream_mut(path, stream_type)?.data = data;
        Ok(())
    }
}
