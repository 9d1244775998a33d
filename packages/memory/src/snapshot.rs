//! Full-tree snapshot format.
//!
//! ```text
//! +----------------+-------------+---------------------------+
//! | "MDBSNAP\0"    | version u16 | JSON body                 |
//! | 8 bytes        | LE          | (stream bytes in base64)  |
//! +----------------+-------------+---------------------------+
//! ```
//!
//! The body is a flat list of node records in pre-order, the root first, so
//! its nesting does not grow with the depth of the tree. It is parsed and
//! checked in full into a detached tree; only a complete, valid tree is ever
//! handed back, so a bad snapshot can never half-populate a database.

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use mountdb_core::{
    Error, Node, NodeKind, NodeTree, Path, Result, StreamData, StreamOptions, StreamType,
};

pub const MAGIC: &[u8; 8] = b"MDBSNAP\0";
pub const VERSION: u16 = 1;

const HEADER_LEN: usize = MAGIC.len() + 2;

#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    nodes: Vec<SnapshotRecord>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    path: Path,
    kind: NodeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    streams: Vec<SnapshotStream>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotStream {
    stream_type: StreamType,
    #[serde(default)]
    options: StreamOptions,
    data: String,
}

fn corrupt(message: impl Into<String>) -> Error {
    Error::CorruptSnapshot {
        message: message.into(),
    }
}

impl SnapshotRecord {
    fn from_node(path: Path, node: &Node) -> Self {
        Self {
            path,
            kind: node.kind(),
            streams: node
                .streams()
                .iter()
                .map(|(stream_type, stream)| SnapshotStream {
                    stream_type: stream_type.clone(),
                    options: stream.options,
                    data: STANDARD.encode(&stream.data),
                })
                .collect(),
        }
    }

    /// The node without its children, rejecting anything the live model
    /// would not allow.
    fn into_node(self) -> Result<(Path, Node)> {
        let mut node = Node::new(self.kind);
        for stream in self.streams {
            let data = STANDARD.decode(stream.data.as_bytes()).map_err(|e| {
                corrupt(format!(
                    "{}: stream {} is not valid base64: {}",
                    self.path, stream.stream_type, e
                ))
            })?;
            let stream_type = stream.stream_type.clone();
            node.insert_stream(
                stream.stream_type,
                StreamData {
                    options: stream.options,
                    data: Bytes::from(data),
                },
            )
            .map_err(|_| corrupt(format!("{}: duplicate stream {}", self.path, stream_type)))?;
        }
        Ok((self.path, node))
    }
}

/// Serialize a whole tree.
pub fn encode(tree: &NodeTree) -> Result<Bytes> {
    let mut nodes = Vec::new();
    let mut pending = vec![(Path::root(), tree.root())];
    while let Some((path, node)) = pending.pop() {
        for (name, child) in node.children().iter().rev() {
            pending.push((path.child(name)?, child));
        }
        nodes.push(SnapshotRecord::from_node(path, node));
    }

    let body = serde_json::to_vec(&SnapshotBody { nodes })
        .map_err(|e| Error::internal(format!("snapshot encoding failed: {}", e)))?;
    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    out.put_slice(MAGIC);
    out.put_u16_le(VERSION);
    out.put_slice(&body);
    Ok(out.freeze())
}

/// Attach the innermost open node to its parent, which is the next one down.
fn close_innermost(open: &mut Vec<(Path, Node)>) -> Result<()> {
    let Some((path, node)) = open.pop() else {
        return Ok(());
    };
    let (_, parent) = open
        .last_mut()
        .ok_or_else(|| corrupt(format!("{}: no parent record", path)))?;
    let name = path.name().unwrap_or_default().to_string();
    parent
        .insert_child(name, node)
        .map_err(|e| corrupt(format!("{}: {}", path, e)))
}

/// Parse a snapshot produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<NodeTree> {
    if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(corrupt("missing snapshot header"));
    }
    let version = u16::from_le_bytes([bytes[MAGIC.len()], bytes[MAGIC.len() + 1]]);
    if version != VERSION {
        return Err(corrupt(format!("unsupported snapshot version {}", version)));
    }
    let body: SnapshotBody = serde_json::from_slice(&bytes[HEADER_LEN..])
        .map_err(|e| corrupt(format!("malformed body: {}", e)))?;

    let mut records = body.nodes.into_iter();
    let (root_path, root) = records
        .next()
        .ok_or_else(|| corrupt("no root record"))?
        .into_node()?;
    if !root_path.is_root() {
        return Err(corrupt(format!("first record is {}, not the root", root_path)));
    }
    if root.kind() != NodeKind::Directory {
        return Err(corrupt("root node must be a directory"));
    }

    // Ancestors of the current record, root first.
    let mut open = vec![(root_path, root)];
    for record in records {
        let (path, node) = record.into_node()?;
        let parent = path
            .parent()
            .ok_or_else(|| corrupt("the root appears twice"))?;
        while open.last().is_some_and(|(p, _)| *p != parent) {
            if open.len() == 1 {
                return Err(corrupt(format!("{}: parent record missing or out of order", path)));
            }
            close_innermost(&mut open)?;
        }
        open.push((path, node));
    }
    while open.len() > 1 {
        close_innermost(&mut open)?;
    }

    let (_, root) = open.pop().ok_or_else(|| corrupt("no root record"))?;
    NodeTree::from_root(root)
}
