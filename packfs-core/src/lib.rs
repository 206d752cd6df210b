//! packfs core library
//!
//! A content-addressed object repository:
//! - Object model (hash, info, Commit/Tree/LargeBlob payloads)
//! - Append-only packfiles with a transactional write path
//! - In-memory index with rebuildable persistence
//! - Refcount metadata log and per-object key-value side table
//! - Packfile manager with a persistent free-list
//! - Repo facade used by the mount layer
//! - Mutation staging (TreeDiff + per-session temp sink)

pub mod config;
pub mod error;
pub mod index;
pub mod manager;
pub mod metadata;
pub mod object;
pub mod packfile;
pub mod repo;
pub mod staging;
pub mod stream;

pub use config::RepoConfig;
pub use error::{Result, StoreError};
pub use index::{Index, IndexEntry};
pub use manager::PackfileManager;
pub use metadata::{MdTransaction, MetaKvLog, MetadataLog};
pub use object::{
    AttrPatch, Attrs, Commit, LargeBlob, ObjectHash, ObjectInfo, ObjectKind, Tree, TreeEntry,
    FLAG_COMPRESSED,
};
pub use packfile::{PackOptions, PackTransaction, Packfile};
pub use repo::Repo;
pub use staging::{normalize_path, DiffKind, TempDir, TreeDiff, TreeDiffEntry};
