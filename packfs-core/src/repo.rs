//! Repository facade
//!
//! Glues the packfile manager, index, and metadata logs behind a single
//! reader-writer lock: readers share it, writers and compaction take it
//! exclusively. A second mutex guards the manager's open-handle cache so
//! lookups can stay shared. Index entries and refcounts are only written
//! after the packfile bytes they describe.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::config::RepoConfig;
use crate::error::{Result, StoreError};
use crate::index::Index;
use crate::manager::PackfileManager;
use crate::metadata::{MetaKvLog, MetadataLog};
use crate::object::{Commit, ObjectHash, ObjectInfo, ObjectKind, Tree, TreeEntry};
use crate::packfile::Packfile;
use crate::staging::TempDir;

struct RepoInner {
    index: Index,
    refcounts: MetadataLog,
    kv: MetaKvLog,
    head: ObjectHash,
    /// Id of the packfile receiving new objects, once one is known non-full
    current_pack: Option<u32>,
}

/// A content-addressed object repository rooted at one directory
pub struct Repo {
    root: PathBuf,
    uuid: String,
    config: RepoConfig,
    inner: RwLock<RepoInner>,
    manager: Mutex<PackfileManager>,
}

impl Repo {
    /// Open or create a repository. Refcount log corruption aborts the
    /// open, since refcounts are required for safe purging.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        fs::create_dir_all(root.join("refs"))?;
        fs::create_dir_all(root.join("tmp"))?;

        let config = RepoConfig::load(root)?;

        let uuid_path = root.join("uuid");
        let uuid = if uuid_path.exists() {
            fs::read_to_string(&uuid_path)?.trim().to_string()
        } else {
            let u = uuid::Uuid::new_v4().to_string();
            fs::write(&uuid_path, &u)?;
            u
        };

        let manager = PackfileManager::new(root, (&config).into(), config.open_pack_cache)?;
        let index = Index::open(root.join("index"), root)?;
        let refcounts = MetadataLog::open(&root.join("metadata.log"))?;
        let kv = MetaKvLog::open(&root.join("objmeta.log"))?;

        let head_path = root.join("refs").join("head");
        let head = if head_path.exists() {
            ObjectHash::from_hex(fs::read_to_string(&head_path)?.trim())?
        } else {
            ObjectHash::EMPTY
        };

        info!(uuid = %uuid, objects = index.len(), "opened repository");

        Ok(Self {
            root: root.to_path_buf(),
            uuid,
            config,
            inner: RwLock::new(RepoInner {
                index,
                refcounts,
                kv,
                head,
                current_pack: None,
            }),
            manager: Mutex::new(manager),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn has_object(&self, hash: &ObjectHash) -> bool {
        !hash.is_empty() && self.inner.read().index.contains(hash)
    }

    pub fn object_info(&self, hash: &ObjectHash) -> Result<ObjectInfo> {
        self.inner
            .read()
            .index
            .get(hash)
            .map(|e| e.info)
            .ok_or(StoreError::NotFound(*hash))
    }

    /// Number of indexed objects
    pub fn object_count(&self) -> usize {
        self.inner.read().index.len()
    }

    /// Every indexed hash
    pub fn object_hashes(&self) -> Vec<ObjectHash> {
        self.inner.read().index.iter().map(|(h, _)| *h).collect()
    }

    /// Full decompressed payload of an object
    pub fn payload(&self, hash: &ObjectHash) -> Result<Bytes> {
        let inner = self.inner.read();
        let entry = inner
            .index
            .get(hash)
            .ok_or(StoreError::NotFound(*hash))?
            .clone();

        let pack = self.manager.lock().get_packfile(entry.packfile_id)?;
        let pack = pack.lock();
        let mut reader = pack.payload(&entry)?;
        let mut buf = Vec::with_capacity(entry.info.payload_size as usize);
        reader.read_to_end(&mut buf).map_err(|e| {
            if entry.info.is_compressed() {
                StoreError::Corruption(format!("object {} failed to decompress: {}", hash, e))
            } else {
                StoreError::Io(e)
            }
        })?;

        if buf.len() as u32 != entry.info.payload_size {
            return Err(StoreError::Corruption(format!(
                "object {} decoded to {} bytes, expected {}",
                hash,
                buf.len(),
                entry.info.payload_size
            )));
        }
        Ok(Bytes::from(buf))
    }

    /// Store a payload under its content hash; storing existing content is
    /// a no-op.
    pub fn put(&self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectHash> {
        let hash = ObjectHash::from_payload(payload);
        if self.has_object(&hash) {
            return Ok(hash);
        }
        self.add_object(ObjectInfo::new(kind, hash, payload.len() as u32), payload)
    }

    /// Stage one object into the current writable packfile and commit the
    /// transaction before returning.
    pub fn add_object(&self, info: ObjectInfo, payload: &[u8]) -> Result<ObjectHash> {
        let mut inner = self.inner.write();
        let mut mgr = self.manager.lock();

        let (id, pack_arc) = Self::writable_pack(inner.current_pack, &mut mgr)?;
        inner.current_pack = Some(id);
        {
            let mut pack = pack_arc.lock();
            let mut tx = pack.begin(&mut inner.index);
            tx.add(info, payload)?;
            tx.commit()?;
        }
        Ok(info.hash)
    }

    fn writable_pack(
        current: Option<u32>,
        mgr: &mut PackfileManager,
    ) -> Result<(u32, Arc<Mutex<Packfile>>)> {
        if let Some(id) = current {
            let pack = mgr.get_packfile(id)?;
            if !pack.lock().full() {
                return Ok((id, pack));
            }
        }
        mgr.new_packfile()
    }

    /// Serialize and store a commit for the given root tree, import every
    /// staged object from the session sink, and increment refcounts for all
    /// of them. The metadata write happens only after the packfile writes,
    /// so a crash between the two leaves at worst an under-counted
    /// refcount. `parent` is EMPTY for an initial commit.
    pub fn commit_from_objects(
        &self,
        root_tree: ObjectHash,
        sink: &TempDir,
        message: &str,
        author: &str,
        parent: ObjectHash,
    ) -> Result<ObjectHash> {
        let mut inner = self.inner.write();
        let mut mgr = self.manager.lock();

        let parents = if parent.is_empty() {
            Vec::new()
        } else {
            vec![parent]
        };
        let commit = Commit::new(root_tree, parents, author, message);
        let cbytes = commit.to_bytes()?;
        let chash = ObjectHash::from_payload(&cbytes);

        let mut pending: Vec<(ObjectInfo, Vec<u8>)> = Vec::new();
        for (i, (info, _)) in sink.objects().iter().enumerate() {
            if !inner.index.contains(&info.hash) {
                pending.push((*info, sink.payload(i)?));
            }
        }
        if !inner.index.contains(&chash) {
            pending.push((
                ObjectInfo::new(ObjectKind::Commit, chash, cbytes.len() as u32),
                cbytes,
            ));
        }

        let mut iter = pending.into_iter().peekable();
        while iter.peek().is_some() {
            let (id, pack_arc) = Self::writable_pack(inner.current_pack, &mut mgr)?;
            inner.current_pack = Some(id);

            let mut pack = pack_arc.lock();
            let mut tx = pack.begin(&mut inner.index);
            while !tx.full() {
                match iter.next() {
                    Some((info, data)) => tx.add(info, &data)?,
                    None => break,
                }
            }
            tx.commit()?;
        }

        let mut tx = inner.refcounts.begin();
        for (info, _) in sink.objects() {
            tx.add_ref(info.hash);
        }
        tx.add_ref(chash);
        tx.commit()?;

        info!(commit = %chash, objects = sink.len(), "committed session objects");
        Ok(chash)
    }

    /// The durable head commit hash, or EMPTY in a fresh repo
    pub fn head(&self) -> ObjectHash {
        self.inner.read().head
    }

    pub fn update_head(&self, hash: ObjectHash) -> Result<()> {
        let mut inner = self.inner.write();
        fs::write(self.root.join("refs").join("head"), hash.to_hex())?;
        inner.head = hash;
        Ok(())
    }

    /// Current refcount for an object; unknown hashes are 0
    pub fn ref_count(&self, hash: &ObjectHash) -> u32 {
        self.inner.read().refcounts.ref_count(hash)
    }

    /// Set one per-object metadata key
    pub fn set_meta(&self, hash: ObjectHash, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let mut tx = inner.kv.begin();
        tx.set_meta(hash, key, value);
        tx.commit()
    }

    pub fn meta(&self, hash: &ObjectHash, key: &str) -> Option<String> {
        self.inner.read().kv.meta(hash, key).map(String::from)
    }

    /// Load a commit object
    pub fn commit(&self, hash: &ObjectHash) -> Result<Commit> {
        Commit::from_bytes(&self.payload(hash)?)
    }

    /// Load a tree object
    pub fn tree(&self, hash: &ObjectHash) -> Result<Tree> {
        Tree::from_bytes(&self.payload(hash)?)
    }

    /// Expand a tree recursively into a map of slash-prefixed full paths
    pub fn flatten_tree(&self, tree: &Tree) -> Result<BTreeMap<String, TreeEntry>> {
        let mut flat = BTreeMap::new();
        let mut stack: Vec<(String, Tree)> = vec![(String::new(), tree.clone())];
        while let Some((prefix, t)) = stack.pop() {
            for (name, entry) in &t.entries {
                let path = format!("{}/{}", prefix, name);
                flat.insert(path.clone(), *entry);
                if entry.is_tree() && !entry.hash.is_empty() {
                    stack.push((path, self.tree(&entry.hash)?));
                }
            }
        }
        Ok(flat)
    }

    /// Remove the given objects from their packfiles, the index, and the
    /// metadata logs. Packfiles left empty are deleted and their ids freed.
    pub fn purge_objects(&self, hashes: &HashSet<ObjectHash>) -> Result<()> {
        let mut inner = self.inner.write();
        let mut mgr = self.manager.lock();

        let mut by_pack: HashMap<u32, HashSet<ObjectHash>> = HashMap::new();
        for h in hashes {
            if let Some(e) = inner.index.get(h) {
                by_pack.entry(e.packfile_id).or_default().insert(*h);
            }
        }

        for (id, hset) in by_pack {
            let pack_arc = mgr.get_packfile(id)?;
            let empty = pack_arc.lock().purge(&hset, &mut inner.index)?;
            for h in &hset {
                inner.index.remove(h);
            }
            if empty {
                mgr.free_packfile(id)?;
                if inner.current_pack == Some(id) {
                    inner.current_pack = None;
                }
            }
        }

        let mut counts = inner.refcounts.counts().clone();
        let before = counts.len();
        for h in hashes {
            counts.remove(h);
        }
        if counts.len() != before {
            inner.refcounts.rewrite(Some(&counts))?;
        }

        let kept: HashMap<(ObjectHash, String), String> = inner
            .kv
            .values()
            .iter()
            .filter(|((h, _), _)| !hashes.contains(h))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if kept.len() != inner.kv.values().len() {
            inner.kv.rewrite(Some(&kept))?;
        }

        info!(purged = hashes.len(), "purged objects");
        Ok(())
    }

    /// Purge every indexed object whose refcount is 0, sparing the current
    /// head. Returns how many were dropped.
    pub fn purge_unreferenced(&self) -> Result<usize> {
        let doomed: HashSet<ObjectHash> = {
            let inner = self.inner.read();
            inner
                .index
                .iter()
                .filter(|(h, _)| inner.refcounts.ref_count(h) == 0 && **h != inner.head)
                .map(|(h, _)| *h)
                .collect()
        };
        if doomed.is_empty() {
            return Ok(0);
        }
        self.purge_objects(&doomed)?;
        Ok(doomed.len())
    }

    /// Fresh per-session object sink under the repo's temp area
    pub fn new_temp_dir(&self) -> Result<TempDir> {
        TempDir::new(&self.root.join("tmp"))
    }

    /// Remove leftover session directories from crashed mounts
    pub fn cleanup_temp(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(self.root.join("tmp"))? {
            let entry = entry?;
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!(path = %entry.path().display(), error = %e, "failed to remove temp dir");
            } else {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Flush the index and free-list to disk
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.write();
        inner.index.save()?;
        self.manager.lock().write_free_list()?;
        Ok(())
    }
}

impl Drop for Repo {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            error!(error = %e, "failed to sync repository on close");
        }
    }
}
