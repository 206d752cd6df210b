//! Mount-session layer for packfs
//!
//! The filesystem front-end drives this crate. A session exposes the
//! latest committed tree as a mutable view: reads resolve paths against
//! the head tree overlaid with the session's staged diff, writes
//! accumulate in the diff, and flushes turn the diff into new commits.
//! Promoting a session commit rewrites the durable head.
//!
//! The VFS callbacks themselves (path parsing, POSIX attribute mapping)
//! live outside this crate; everything here is callable from them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

use packfs_core::{
    normalize_path, AttrPatch, Attrs, Commit, DiffKind, LargeBlob, ObjectHash, ObjectInfo,
    ObjectKind, Repo, TempDir, Tree, TreeDiff, TreeDiffEntry, TreeEntry,
};

/// A tree entry overlaid with the session's pending mutation for its path
#[derive(Debug, Clone)]
pub struct ExtendedTreeEntry {
    pub entry: TreeEntry,
    pub staged: Option<TreeDiffEntry>,
    /// True when staged data (not just attributes) replaces the contents
    pub changed_data: bool,
}

struct SessionState {
    /// Latest session commit (may be ahead of the durable head)
    head: ObjectHash,
    head_commit: Option<Commit>,
    head_tree: Tree,
    tree_cache: HashMap<ObjectHash, Tree>,
    info_cache: HashMap<ObjectHash, ObjectInfo>,
    lb_cache: HashMap<ObjectHash, LargeBlob>,
    ete_cache: HashMap<String, Option<ExtendedTreeEntry>>,
    diff: Option<TreeDiff>,
    temp: Option<TempDir>,
}

/// One mounted view over a repository
pub struct MountSession {
    repo: Repo,
    state: Mutex<SessionState>,
}

impl MountSession {
    pub fn open(repo_path: &Path) -> Result<Self> {
        let repo = Repo::open(repo_path)
            .with_context(|| format!("failed to open repository at {}", repo_path.display()))?;
        info!(path = %repo_path.display(), "mounting repository");

        let session = Self {
            repo,
            state: Mutex::new(SessionState {
                head: ObjectHash::EMPTY,
                head_commit: None,
                head_tree: Tree::new(),
                tree_cache: HashMap::new(),
                info_cache: HashMap::new(),
                lb_cache: HashMap::new(),
                ete_cache: HashMap::new(),
                diff: None,
                temp: None,
            }),
        };
        {
            let mut state = session.state.lock();
            session.reset_head(&mut state, ObjectHash::EMPTY)?;
        }
        Ok(session)
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    /// Latest session commit hash (EMPTY before the first write flush on a
    /// fresh repo)
    pub fn head(&self) -> ObjectHash {
        self.state.lock().head
    }

    /// Point the session at a commit; EMPTY means the repo's durable head.
    fn reset_head(&self, state: &mut SessionState, chash: ObjectHash) -> Result<()> {
        let target = if chash.is_empty() {
            self.repo.head()
        } else {
            chash
        };

        if target.is_empty() {
            state.head = ObjectHash::EMPTY;
            state.head_commit = None;
            state.head_tree = Tree::new();
            return Ok(());
        }

        let commit = self.repo.commit(&target)?;
        state.head_tree = if commit.tree.is_empty() {
            Tree::new()
        } else {
            self.repo.tree(&commit.tree)?
        };
        state.head = target;
        state.head_commit = Some(commit);
        Ok(())
    }

    fn cached_tree(&self, state: &mut SessionState, hash: &ObjectHash) -> Result<Tree> {
        if let Some(t) = state.tree_cache.get(hash) {
            return Ok(t.clone());
        }
        let t = self.repo.tree(hash)?;
        state.tree_cache.insert(*hash, t.clone());
        Ok(t)
    }

    /// Cached object descriptor lookup
    pub fn object_info(&self, hash: &ObjectHash) -> Result<ObjectInfo> {
        let mut state = self.state.lock();
        if let Some(info) = state.info_cache.get(hash) {
            return Ok(*info);
        }
        let info = self.repo.object_info(hash)?;
        state.info_cache.insert(*hash, info);
        Ok(info)
    }

    /// Cached chunk list for a large blob
    pub fn large_blob(&self, hash: &ObjectHash) -> Result<LargeBlob> {
        let mut state = self.state.lock();
        if let Some(lb) = state.lb_cache.get(hash) {
            return Ok(lb.clone());
        }
        let lb = LargeBlob::from_bytes(&self.repo.payload(hash)?)?;
        state.lb_cache.insert(*hash, lb.clone());
        Ok(lb)
    }

    /// Entry in the committed head tree, before any staged overlay
    fn base_tree_entry(&self, state: &mut SessionState, norm: &str) -> Result<Option<TreeEntry>> {
        let comps: Vec<String> = norm
            .split('/')
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();

        if comps.is_empty() {
            // The root directory itself
            let tree_hash = state
                .head_commit
                .as_ref()
                .map(|c| c.tree)
                .unwrap_or(ObjectHash::EMPTY);
            return Ok(Some(TreeEntry::new(tree_hash, ObjectKind::Tree, Attrs::dir())));
        }
        if state.head_tree.is_empty() {
            return Ok(None);
        }

        let mut tree = state.head_tree.clone();
        for (i, comp) in comps.iter().enumerate() {
            let entry = match tree.get(comp) {
                Some(e) => *e,
                None => return Ok(None),
            };
            if i + 1 == comps.len() {
                return Ok(Some(entry));
            }
            if !entry.is_tree() {
                // Components remain but the walk hit a file
                debug!(path = norm, "path leaf is a file");
                return Ok(None);
            }
            tree = self.cached_tree(state, &entry.hash)?;
        }
        Ok(None)
    }

    /// Resolve a path against the head tree overlaid with the staged diff.
    /// Deleted paths resolve to None.
    pub fn extended_entry(&self, path: &str) -> Result<Option<ExtendedTreeEntry>> {
        let norm = normalize_path(path);
        let mut state = self.state.lock();
        if let Some(cached) = state.ete_cache.get(&norm) {
            return Ok(cached.clone());
        }

        let base = self.base_tree_entry(&mut state, &norm)?;
        let staged = state
            .diff
            .as_ref()
            .and_then(|d| d.latest_entry(&norm))
            .cloned();

        let result = match (&base, &staged) {
            (None, None) => None,
            (_, Some(tde))
                if matches!(
                    tde.kind,
                    DiffKind::DeletedFile | DiffKind::DeletedDir | DiffKind::Noop
                ) =>
            {
                None
            }
            _ => {
                let mut entry = base.unwrap_or_else(|| {
                    TreeEntry::new(ObjectHash::EMPTY, ObjectKind::Blob, Attrs::default())
                });
                let mut changed_data = false;
                if let Some(tde) = &staged {
                    if tde.staged_file.is_some() || tde.diff.is_some() {
                        changed_data = true;
                    }
                    if tde.kind == DiffKind::NewDir {
                        entry.kind = ObjectKind::Tree;
                        entry.attrs = Attrs::dir();
                    }
                    entry.attrs.merge_from(&tde.attrs);
                }
                Some(ExtendedTreeEntry {
                    entry,
                    staged,
                    changed_data,
                })
            }
        };

        state.ete_cache.insert(norm, result.clone());
        Ok(result)
    }

    /// Prepare the session for writes: allocate the diff and temp sink
    pub fn start_write(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.diff.is_none() {
            state.diff = Some(TreeDiff::new());
        }
        if state.temp.is_none() {
            state.temp = Some(self.repo.new_temp_dir()?);
        }
        Ok(())
    }

    /// Fresh path for staging new file contents; requires `start_write`
    pub fn stage_path(&self) -> Result<PathBuf> {
        self.state
            .lock()
            .temp
            .as_ref()
            .map(|t| t.stage_path())
            .ok_or_else(|| anyhow!("call start_write before staging data"))
    }

    /// Merge one mutation into the staged diff. When the merge grows a
    /// layer the accumulated diff is flushed first; returns whether that
    /// happened.
    pub fn merge_and_commit(&self, entry: TreeDiffEntry) -> Result<bool> {
        {
            let mut state = self.state.lock();
            if state.diff.is_none() || state.temp.is_none() {
                return Err(anyhow!("call start_write before merge_and_commit"));
            }
            state.ete_cache.remove(&entry.path);

            let grows = state.diff.as_mut().unwrap().merge_into(entry);
            if !grows {
                return Ok(false);
            }
        }
        self.fuse_commit()?;
        Ok(true)
    }

    /// Flush the staged diff into a new commit and reset the session to it
    pub fn fuse_commit(&self) -> Result<Option<ObjectHash>> {
        let mut state = self.state.lock();
        let diff = match state.diff.take() {
            Some(d) => d,
            None => {
                debug!("nothing to commit");
                return Ok(None);
            }
        };
        let mut temp = match state.temp.take() {
            Some(t) => t,
            None => self.repo.new_temp_dir()?,
        };

        let flat = self.repo.flatten_tree(&state.head_tree)?;
        let (_, root_hash) = diff.apply_to(flat, &mut temp)?;
        let chash = self.repo.commit_from_objects(
            root_hash,
            &temp,
            "Commit from mount.",
            "mount",
            state.head,
        )?;

        self.reset_head(&mut state, chash)?;
        debug_assert!(self.repo.has_object(&chash));
        state.ete_cache.clear();
        info!(commit = %chash, "session commit");
        Ok(Some(chash))
    }

    /// Flush the session and promote its commit to the durable head,
    /// marking the commit's status as normal.
    pub fn commit_perm(&self) -> Result<Option<ObjectHash>> {
        self.fuse_commit()?;
        self.repo.sync()?;

        let head = self.head();
        if head.is_empty() {
            debug!("nothing to commit permanently");
            return Ok(None);
        }
        debug_assert!(self.repo.has_object(&head));

        self.repo.set_meta(head, "status", "normal")?;
        self.repo.update_head(head)?;
        info!(commit = %head, "promoted session commit to durable head");
        Ok(Some(head))
    }

    /// Attributes of a path through the staged overlay
    pub fn attrs(&self, path: &str) -> Result<Option<Attrs>> {
        Ok(self.extended_entry(path)?.map(|ete| ete.entry.attrs))
    }

    /// Stage an attribute change for a path
    pub fn set_attrs(&self, path: &str, patch: AttrPatch) -> Result<bool> {
        if patch.is_empty() {
            return Ok(false);
        }
        self.start_write()?;
        self.merge_and_commit(TreeDiffEntry::new(DiffKind::Modified, path).with_attrs(patch))
    }
}
