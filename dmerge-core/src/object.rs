//! Object model for the divergence computation
//!
//! Mirrors the toolchain's object namespace: fixed-length content
//! identifiers, blob/tree/commit kinds, flattened tree entries, and the
//! deduplicated accumulator of objects selected for transfer.

use std::collections::HashSet;
use std::str::FromStr;

/// Unique identifier for any version-control object (40-char hex digest).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        if hex_str.len() != 40 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let bytes = hex::decode(hex_str)?;
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

/// Object type discriminator.
///
/// `Submodule` is a commit object referenced from within a tree (a nested
/// repository boundary). It is detected and rejected during the varying-path
/// walk, never resolved further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
    Submodule,
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            "commit" => Ok(ObjectKind::Commit),
            other => Err(format!("unexpected object type: {}", other)),
        }
    }
}

/// One entry of a recursively flattened tree listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Slash-separated path relative to the tree root.
    pub path: String,
    /// Entry type.
    pub kind: ObjectKind,
    /// Object ID (points to a blob, subtree, or submodule commit).
    pub id: ObjectId,
}

impl TreeEntry {
    /// Create a new tree entry
    pub fn new(path: impl Into<String>, kind: ObjectKind, id: ObjectId) -> Self {
        Self {
            path: path.into(),
            kind,
            id,
        }
    }
}

/// Deduplicated accumulator of objects selected for transfer.
///
/// Preserves insertion order so repeated runs hand the toolchain the same
/// list, but callers must not depend on any particular ordering.
#[derive(Debug, Default)]
pub struct ObjectSet {
    order: Vec<ObjectId>,
    seen: HashSet<ObjectId>,
}

impl ObjectSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an id; returns true if it was not already present.
    pub fn insert(&mut self, id: ObjectId) -> bool {
        if self.seen.insert(id) {
            self.order.push(id);
            true
        } else {
            false
        }
    }

    /// Check membership
    pub fn contains(&self, id: ObjectId) -> bool {
        self.seen.contains(&id)
    }

    /// Number of distinct ids
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The ids in insertion order
    pub fn ids(&self) -> &[ObjectId] {
        &self.order
    }
}

impl Extend<ObjectId> for ObjectSet {
    fn extend<T: IntoIterator<Item = ObjectId>>(&mut self, iter: T) {
        for id in iter {
            self.insert(id);
        }
    }
}

impl IntoIterator for ObjectSet {
    type Item = ObjectId;
    type IntoIter = std::vec::IntoIter<ObjectId>;

    fn into_iter(self) -> Self::IntoIter {
        self.order.into_iter()
    }
}
