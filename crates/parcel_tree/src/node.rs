//! The in-memory model of a package: nested groups whose leaves reference
//! tables and files stored as objects.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use parcel_digest::{serde::SerializableHash, Sha256Hash};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// Arbitrary key/value metadata attached to a node, e.g. the original source
/// path (`q_path`) or the source extension (`q_ext`).
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// An error that can occur while modifying or deserializing a content tree.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TreeError {
    /// A child with the same name already exists in the group.
    #[error("a child named '{0}' already exists in this group")]
    DuplicateName(String),

    /// The name cannot be used as a child name.
    #[error("'{0}' is not a valid node name")]
    InvalidName(String),

    /// A file node must reference exactly one object.
    #[error("a file node must reference exactly one object, found {0}")]
    FileObjectCount(usize),
}

/// The serialization format of the objects behind a [`TableNode`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PackageFormat {
    /// Apache Parquet.
    #[default]
    Parquet,
    /// HDF5.
    Hdf5,
}

impl PackageFormat {
    /// Returns the tag used for this format on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageFormat::Parquet => "PARQUET",
            PackageFormat::Hdf5 => "HDF5",
        }
    }
}

/// A node in a content tree.
///
/// The wire representation is internally tagged by a `type` field with the
/// values `GROUP`, `TABLE` and `FILE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ContentNode {
    /// A directory-like namespace.
    Group(GroupNode),
    /// A leaf that references tabular data.
    Table(TableNode),
    /// A leaf that references an opaque file.
    File(FileNode),
}

impl ContentNode {
    /// Returns the metadata of the node.
    pub fn metadata(&self) -> &Metadata {
        match self {
            ContentNode::Group(group) => &group.metadata,
            ContentNode::Table(table) => &table.metadata,
            ContentNode::File(file) => &file.metadata,
        }
    }

    /// Returns true if this node is a leaf (a table or a file).
    pub fn is_leaf(&self) -> bool {
        !matches!(self, ContentNode::Group(_))
    }

    /// Returns the objects referenced directly by this node. Groups reference
    /// no objects themselves.
    pub fn object_hashes(&self) -> &[Sha256Hash] {
        match self {
            ContentNode::Group(_) => &[],
            ContentNode::Table(table) => &table.hashes,
            ContentNode::File(file) => std::slice::from_ref(&file.hash),
        }
    }

    /// Returns the group if this node is one.
    pub fn as_group(&self) -> Option<&GroupNode> {
        match self {
            ContentNode::Group(group) => Some(group),
            _ => None,
        }
    }
}

impl From<GroupNode> for ContentNode {
    fn from(value: GroupNode) -> Self {
        ContentNode::Group(value)
    }
}

impl From<TableNode> for ContentNode {
    fn from(value: TableNode) -> Self {
        ContentNode::Table(value)
    }
}

impl From<FileNode> for ContentNode {
    fn from(value: FileNode) -> Self {
        ContentNode::File(value)
    }
}

/// An ordered mapping from child name to child node.
///
/// Insertion order is preserved for display and iteration. It does not
/// influence the hash of the group. Deserialization enforces the same naming
/// rules as [`GroupNode::insert`].
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GroupNodeRepr")]
pub struct GroupNode {
    /// The children of this group in insertion order.
    #[serde(default)]
    children: IndexMap<String, ContentNode>,

    /// Metadata of the group.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
}

impl GroupNode {
    /// Constructs an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a child to the group. Fails if a child with the same name already
    /// exists or if the name is not usable as a path component.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        node: impl Into<ContentNode>,
    ) -> Result<(), TreeError> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(TreeError::InvalidName(name));
        }
        match self.children.entry(name) {
            indexmap::map::Entry::Occupied(entry) => {
                Err(TreeError::DuplicateName(entry.key().clone()))
            }
            indexmap::map::Entry::Vacant(entry) => {
                entry.insert(node.into());
                Ok(())
            }
        }
    }

    /// Builder style variant of [`Self::insert`].
    pub fn with_child(
        mut self,
        name: impl Into<String>,
        node: impl Into<ContentNode>,
    ) -> Result<Self, TreeError> {
        self.insert(name, node)?;
        Ok(self)
    }

    /// Returns the child with the given name.
    pub fn child(&self, name: &str) -> Option<&ContentNode> {
        self.children.get(name)
    }

    /// Iterates over the children in insertion order.
    pub fn children(&self) -> impl ExactSizeIterator<Item = (&str, &ContentNode)> + '_ {
        self.children.iter().map(|(name, node)| (name.as_str(), node))
    }

    /// Returns the number of direct children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Returns true if the group has no children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Returns the node at the given slash separated path. Empty components are
    /// ignored, so `""` and `"/"` both return `None` because the root itself
    /// is not a child.
    pub fn get(&self, path: &str) -> Option<&ContentNode> {
        let mut components = path.split('/').filter(|c| !c.is_empty());
        let mut current = self.children.get(components.next()?)?;
        for component in components {
            current = current.as_group()?.children.get(component)?;
        }
        Some(current)
    }

    /// Returns a copy of the tree that only keeps the branch leading to
    /// `path`. Groups along the way keep their metadata; everything below
    /// the node at `path` is kept as is. Returns `None` if `path` does not
    /// exist. An empty path returns a copy of the whole tree.
    pub fn subtree<S: AsRef<str>>(&self, path: &[S]) -> Option<GroupNode> {
        let Some((first, rest)) = path.split_first() else {
            return Some(self.clone());
        };
        let child = self.children.get(first.as_ref())?;
        let child = match (child, rest.is_empty()) {
            (node, true) => node.clone(),
            (ContentNode::Group(group), false) => ContentNode::Group(group.subtree(rest)?),
            (_, false) => return None,
        };
        let mut children = IndexMap::with_capacity(1);
        children.insert(first.as_ref().to_string(), child);
        Some(GroupNode {
            children,
            metadata: self.metadata.clone(),
        })
    }

    /// Returns an iterator over every leaf in the tree together with its
    /// slash joined path. Leaves are yielded depth-first in insertion order,
    /// which is stable for a given tree.
    pub fn leaves(&self) -> Leaves<'_> {
        Leaves {
            stack: vec![(String::new(), self.children.iter())],
        }
    }
}

/// Children are read as a list of pairs so repeated names reach
/// [`GroupNode::insert`] instead of overwriting each other.
#[serde_as]
#[derive(Deserialize)]
struct GroupNodeRepr {
    #[serde_as(as = "serde_with::Map<_, _>")]
    #[serde(default)]
    children: Vec<(String, ContentNode)>,
    #[serde(default)]
    metadata: Metadata,
}

impl TryFrom<GroupNodeRepr> for GroupNode {
    type Error = TreeError;

    fn try_from(value: GroupNodeRepr) -> Result<Self, Self::Error> {
        let mut group = GroupNode {
            children: IndexMap::with_capacity(value.children.len()),
            metadata: value.metadata,
        };
        for (name, node) in value.children {
            group.insert(name, node)?;
        }
        Ok(group)
    }
}

/// Iterator returned by [`GroupNode::leaves`].
pub struct Leaves<'a> {
    stack: Vec<(String, indexmap::map::Iter<'a, String, ContentNode>)>,
}

impl<'a> Iterator for Leaves<'a> {
    type Item = (String, &'a ContentNode);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (prefix, iter) = self.stack.last_mut()?;
            let Some((name, node)) = iter.next() else {
                self.stack.pop();
                continue;
            };
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            match node {
                ContentNode::Group(group) => self.stack.push((path, group.children.iter())),
                leaf => return Some((path, leaf)),
            }
        }
    }
}

/// A leaf referencing serialized tabular data.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableNode {
    /// The objects holding the serialized table, in order.
    #[serde_as(as = "Vec<SerializableHash>")]
    pub hashes: Vec<Sha256Hash>,

    /// The serialization format of the objects.
    #[serde(default)]
    pub format: PackageFormat,

    /// Metadata of the table.
    #[serde(default)]
    pub metadata: Metadata,
}

impl TableNode {
    /// Constructs a table node referencing the given objects.
    pub fn new(hashes: Vec<Sha256Hash>, format: PackageFormat, metadata: Metadata) -> Self {
        Self {
            hashes,
            format,
            metadata,
        }
    }
}

/// A leaf referencing an opaque file stored as a single object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FileNodeRepr", into = "FileNodeRepr")]
pub struct FileNode {
    /// The object holding the file contents.
    pub hash: Sha256Hash,

    /// Metadata of the file.
    pub metadata: Metadata,
}

impl FileNode {
    /// Constructs a file node referencing the given object.
    pub fn new(hash: Sha256Hash, metadata: Metadata) -> Self {
        Self { hash, metadata }
    }
}

/// Files share the `hashes` list representation of tables on the wire.
#[serde_as]
#[derive(Serialize, Deserialize)]
struct FileNodeRepr {
    #[serde_as(as = "Vec<SerializableHash>")]
    hashes: Vec<Sha256Hash>,
    #[serde(default)]
    metadata: Metadata,
}

impl TryFrom<FileNodeRepr> for FileNode {
    type Error = TreeError;

    fn try_from(value: FileNodeRepr) -> Result<Self, Self::Error> {
        match value.hashes.as_slice() {
            [hash] => Ok(FileNode::new(*hash, value.metadata)),
            other => Err(TreeError::FileObjectCount(other.len())),
        }
    }
}

impl From<FileNode> for FileNodeRepr {
    fn from(value: FileNode) -> Self {
        FileNodeRepr {
            hashes: vec![value.hash],
            metadata: value.metadata,
        }
    }
}
