//! Core object model for packfs
//!
//! Every stored payload is identified by a content hash and described by a
//! fixed-width ObjectInfo record. Commits, trees and large-blob chunk lists
//! are themselves payloads serialized with bincode.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{Result, StoreError};

/// Content hash identifying any stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash([u8; 32]);

impl ObjectHash {
    pub const SIZE: usize = 32;

    /// Sentinel value for "no object"
    pub const EMPTY: ObjectHash = ObjectHash([0u8; 32]);

    /// Create an ObjectHash from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the hash of a raw (pre-compression) payload
    pub fn from_payload(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| StoreError::Corruption(format!("invalid hash hex: {}", e)))?;
        if bytes.len() != Self::SIZE {
            return Err(StoreError::Corruption(format!(
                "hash must be {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True for the sentinel value
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl std::fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Object type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    LargeBlob,
    Chunk,
    Purged,
}

impl ObjectKind {
    pub fn to_u8(self) -> u8 {
        match self {
            ObjectKind::Commit => 0,
            ObjectKind::Tree => 1,
            ObjectKind::Blob => 2,
            ObjectKind::LargeBlob => 3,
            ObjectKind::Chunk => 4,
            ObjectKind::Purged => 5,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => ObjectKind::Commit,
            1 => ObjectKind::Tree,
            2 => ObjectKind::Blob,
            3 => ObjectKind::LargeBlob,
            4 => ObjectKind::Chunk,
            5 => ObjectKind::Purged,
            _ => return Err(StoreError::Corruption(format!("unknown object kind {}", v))),
        })
    }
}

/// Payload is stored zstd-compressed
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Fixed-width descriptor for a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub hash: ObjectHash,
    pub kind: ObjectKind,
    pub flags: u8,
    /// Size of the raw payload, before compression
    pub payload_size: u32,
}

impl ObjectInfo {
    /// Serialized size: hash | kind u8 | flags u8 | payload_size u32 LE
    pub const SIZE: usize = ObjectHash::SIZE + 1 + 1 + 4;

    pub fn new(kind: ObjectKind, hash: ObjectHash, payload_size: u32) -> Self {
        Self {
            hash,
            kind,
            flags: 0,
            payload_size,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..32].copy_from_slice(self.hash.as_bytes());
        buf[32] = self.kind.to_u8();
        buf[33] = self.flags;
        buf[34..38].copy_from_slice(&self.payload_size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(StoreError::Corruption(format!(
                "object info record truncated: {} bytes",
                buf.len()
            )));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&buf[..32]);
        Ok(Self {
            hash: ObjectHash::new(hash),
            kind: ObjectKind::from_u8(buf[32])?,
            flags: buf[33],
            payload_size: u32::from_le_bytes(buf[34..38].try_into().unwrap()),
        })
    }
}

/// File attributes carried by a tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attrs {
    /// Unix permission bits
    pub mode: u32,
    /// Modification time (Unix seconds)
    pub mtime: i64,
}

impl Default for Attrs {
    fn default() -> Self {
        Self {
            mode: 0o644,
            mtime: 0,
        }
    }
}

impl Attrs {
    pub fn dir() -> Self {
        Self {
            mode: 0o755,
            mtime: 0,
        }
    }

    /// Apply an override: fields set on the patch replace the base
    pub fn merge_from(&mut self, patch: &AttrPatch) {
        if let Some(mode) = patch.mode {
            self.mode = mode;
        }
        if let Some(mtime) = patch.mtime {
            self.mtime = mtime;
        }
    }
}

/// Partial attribute override
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrPatch {
    pub mode: Option<u32>,
    pub mtime: Option<i64>,
}

impl AttrPatch {
    /// Layer another patch on top of this one
    pub fn merge_from(&mut self, other: &AttrPatch) {
        if other.mode.is_some() {
            self.mode = other.mode;
        }
        if other.mtime.is_some() {
            self.mtime = other.mtime;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mode.is_none() && self.mtime.is_none()
    }
}

/// Directory tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Object ID (points to a Blob, LargeBlob or Tree)
    pub hash: ObjectHash,
    /// Entry type
    pub kind: ObjectKind,
    /// File attributes
    pub attrs: Attrs,
}

impl TreeEntry {
    pub fn new(hash: ObjectHash, kind: ObjectKind, attrs: Attrs) -> Self {
        Self { hash, kind, attrs }
    }

    pub fn is_tree(&self) -> bool {
        self.kind == ObjectKind::Tree
    }
}

/// Directory object
///
/// Sorted entries for deterministic hashing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: String, entry: TreeEntry) {
        self.entries.insert(name, entry);
    }

    pub fn remove(&mut self, name: &str) -> Option<TreeEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Commit object: a root tree hash plus metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    /// Root tree for this commit
    pub tree: ObjectHash,
    /// Parent commits (empty for the initial commit)
    pub parents: Vec<ObjectHash>,
    /// Author name
    pub author: String,
    /// Commit message
    pub message: String,
    /// Commit timestamp (Unix seconds)
    pub timestamp: i64,
}

impl Commit {
    pub fn new(tree: ObjectHash, parents: Vec<ObjectHash>, author: &str, message: &str) -> Self {
        Self {
            tree,
            parents,
            author: author.to_string(),
            message: message.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn is_initial(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Chunk list behind a LargeBlob object
///
/// Large file contents are split into Chunk objects; the LargeBlob payload
/// records their hashes and sizes in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LargeBlob {
    pub chunks: Vec<(ObjectHash, u32)>,
}

impl LargeBlob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hash: ObjectHash, size: u32) {
        self.chunks.push((hash, size));
    }

    /// Total reconstructed size
    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|(_, s)| *s as u64).sum()
    }

    /// Chunk covering the given byte offset, with the chunk's start offset
    pub fn chunk_at(&self, offset: u64) -> Option<(ObjectHash, u64)> {
        let mut start = 0u64;
        for (hash, size) in &self.chunks {
            let end = start + *size as u64;
            if offset < end {
                return Some((*hash, start));
            }
            start = end;
        }
        None
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_roundtrip() {
        let bytes = [42u8; 32];
        let hash = ObjectHash::new(bytes);
        let hex = hash.to_hex();
        let hash2 = ObjectHash::from_hex(&hex).unwrap();
        assert_eq!(hash, hash2);
    }

    #[test]
    fn test_hash_from_payload() {
        let h = ObjectHash::from_payload(b"hello world");
        assert_eq!(h.to_hex().len(), 64);
        assert!(!h.is_empty());
        assert!(ObjectHash::EMPTY.is_empty());
    }

    #[test]
    fn test_object_info_roundtrip() {
        let hash = ObjectHash::from_payload(b"payload");
        let mut info = ObjectInfo::new(ObjectKind::Blob, hash, 7);
        info.flags |= FLAG_COMPRESSED;

        let bytes = info.to_bytes();
        assert_eq!(bytes.len(), ObjectInfo::SIZE);
        let info2 = ObjectInfo::from_bytes(&bytes).unwrap();
        assert_eq!(info, info2);
        assert!(info2.is_compressed());
    }

    #[test]
    fn test_object_info_truncated() {
        let buf = [0u8; ObjectInfo::SIZE - 1];
        assert!(ObjectInfo::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_attrs_merge() {
        let mut attrs = Attrs::default();
        attrs.merge_from(&AttrPatch {
            mode: Some(0o755),
            mtime: None,
        });
        assert_eq!(attrs.mode, 0o755);
        assert_eq!(attrs.mtime, 0);

        let mut patch = AttrPatch {
            mode: Some(0o600),
            mtime: None,
        };
        patch.merge_from(&AttrPatch {
            mode: None,
            mtime: Some(99),
        });
        assert_eq!(patch.mode, Some(0o600));
        assert_eq!(patch.mtime, Some(99));
    }

    #[test]
    fn test_tree_deterministic_hash() {
        let mut t1 = Tree::new();
        let mut t2 = Tree::new();
        let e = TreeEntry::new(ObjectHash::new([1u8; 32]), ObjectKind::Blob, Attrs::default());
        t1.insert("a".to_string(), e);
        t1.insert("b".to_string(), e);
        t2.insert("b".to_string(), e);
        t2.insert("a".to_string(), e);

        assert_eq!(t1.to_bytes().unwrap(), t2.to_bytes().unwrap());
    }

    #[test]
    fn test_commit_serialization() {
        let commit = Commit::new(
            ObjectHash::new([1u8; 32]),
            vec![ObjectHash::new([2u8; 32])],
            "tester",
            "message",
        );
        let bytes = commit.to_bytes().unwrap();
        let commit2 = Commit::from_bytes(&bytes).unwrap();
        assert_eq!(commit.tree, commit2.tree);
        assert_eq!(commit.parents, commit2.parents);
        assert!(!commit2.is_initial());
    }

    #[test]
    fn test_large_blob_chunk_lookup() {
        let mut lb = LargeBlob::new();
        lb.push(ObjectHash::new([1u8; 32]), 10);
        lb.push(ObjectHash::new([2u8; 32]), 20);

        assert_eq!(lb.total_size(), 30);
        assert_eq!(lb.chunk_at(0).unwrap().1, 0);
        assert_eq!(lb.chunk_at(9).unwrap().1, 0);
        assert_eq!(lb.chunk_at(10).unwrap().0, ObjectHash::new([2u8; 32]));
        assert!(lb.chunk_at(30).is_none());
    }
}
