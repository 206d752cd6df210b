//! Mutation staging for the mount front-end
//!
//! Writes against the mounted view accumulate in an in-memory TreeDiff and
//! a per-session temporary object sink. Applying the diff to a flattened
//! prior tree synthesizes the new subtree objects into the sink and yields
//! the new root, which the repo facade then commits.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Result, StoreError};
use crate::object::{AttrPatch, Attrs, ObjectHash, ObjectInfo, ObjectKind, Tree, TreeEntry};

/// Normalize to a slash-prefixed path with no empty or `.` components
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for comp in path.split('/') {
        if comp.is_empty() || comp == "." {
            continue;
        }
        out.push('/');
        out.push_str(comp);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Parent directory of a normalized path (`/` is its own parent)
pub(crate) fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

/// Final component of a normalized path
pub(crate) fn name_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Kind of a staged mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    /// Placeholder left behind when a later entry cancels an earlier one
    Noop,
    NewFile,
    NewDir,
    DeletedFile,
    DeletedDir,
    Modified,
    Renamed,
}

/// One staged mutation
#[derive(Debug, Clone)]
pub struct TreeDiffEntry {
    pub kind: DiffKind,
    /// Slash-prefixed, normalized path
    pub path: String,
    /// File holding the new contents, when data changed
    pub staged_file: Option<PathBuf>,
    /// Attribute overrides
    pub attrs: AttrPatch,
    /// Literal new contents, for small in-line updates
    pub diff: Option<Vec<u8>>,
    /// Rename destination
    pub rename_target: Option<String>,
}

impl TreeDiffEntry {
    pub fn new(kind: DiffKind, path: &str) -> Self {
        Self {
            kind,
            path: normalize_path(path),
            staged_file: None,
            attrs: AttrPatch::default(),
            diff: None,
            rename_target: None,
        }
    }

    pub fn with_staged_file(mut self, file: PathBuf) -> Self {
        self.staged_file = Some(file);
        self
    }

    pub fn with_attrs(mut self, attrs: AttrPatch) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn with_diff(mut self, data: Vec<u8>) -> Self {
        self.diff = Some(data);
        self
    }
}

/// Ordered set of staged mutations with a path → latest-entry side map
#[derive(Default)]
pub struct TreeDiff {
    pub entries: Vec<TreeDiffEntry>,
    latest: HashMap<String, usize>,
}

impl TreeDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent entry for the path, if any
    pub fn latest_entry(&self, path: &str) -> Option<&TreeDiffEntry> {
        self.latest
            .get(&normalize_path(path))
            .map(|&i| &self.entries[i])
    }

    pub fn append(&mut self, entry: TreeDiffEntry) {
        self.latest.insert(entry.path.clone(), self.entries.len());
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.kind == DiffKind::Noop)
    }

    /// Combine a new mutation with the latest entry for the same path.
    ///
    /// Returns true when the combination grows a layer (a delete followed
    /// by a recreate across the file/dir boundary), which callers treat as
    /// a signal to flush the accumulated diff before continuing.
    pub fn merge_into(&mut self, entry: TreeDiffEntry) -> bool {
        use DiffKind::*;

        let idx = match self.latest.get(&entry.path) {
            Some(&i) => i,
            None => {
                self.append(entry);
                return false;
            }
        };

        match (self.entries[idx].kind, entry.kind) {
            // Delete-then-recreate across the type boundary
            (DeletedFile, NewDir) | (DeletedDir, NewFile) => {
                self.append(entry);
                true
            }
            // Recreating a deleted file collapses to a modification
            (DeletedFile, NewFile) => {
                let prev = &mut self.entries[idx];
                prev.kind = Modified;
                prev.staged_file = entry.staged_file;
                prev.diff = entry.diff;
                prev.attrs = entry.attrs;
                false
            }
            // A deleted directory recreated as a directory: both stand, so
            // the delete still wipes the old children
            (DeletedDir, NewDir) => {
                self.append(entry);
                false
            }
            // In-place updates fold into the creating or modifying entry
            (NewFile, Modified) | (Modified, Modified) | (NewDir, Modified) => {
                let prev = &mut self.entries[idx];
                if entry.staged_file.is_some() {
                    prev.staged_file = entry.staged_file;
                }
                if entry.diff.is_some() {
                    prev.diff = entry.diff;
                }
                prev.attrs.merge_from(&entry.attrs);
                false
            }
            // Created in this diff and deleted again: net nothing
            (NewFile, DeletedFile) | (NewDir, DeletedDir) => {
                let prev = &mut self.entries[idx];
                prev.kind = Noop;
                prev.staged_file = None;
                prev.diff = None;
                prev.attrs = AttrPatch::default();
                self.latest.remove(&entry.path);
                false
            }
            // A modified pre-existing file deleted afterwards
            (Modified, DeletedFile) => {
                let prev = &mut self.entries[idx];
                prev.kind = DeletedFile;
                prev.staged_file = None;
                prev.diff = None;
                prev.attrs = AttrPatch::default();
                false
            }
            (prev_kind, kind) => {
                if prev_kind == kind {
                    warn!(path = %entry.path, kind = ?kind, "repeated diff entry");
                }
                self.append(entry);
                false
            }
        }
    }

    /// Replay the diff against a flattened tree, synthesizing blob and
    /// subtree objects into the sink. Returns the new root tree and the
    /// hash under which its object was stored.
    pub fn apply_to(
        &self,
        mut flat: BTreeMap<String, TreeEntry>,
        sink: &mut TempDir,
    ) -> Result<(Tree, ObjectHash)> {
        use DiffKind::*;

        for e in &self.entries {
            match e.kind {
                Noop => {}
                NewFile | Modified => {
                    let mut te = flat.get(&e.path).copied().unwrap_or_else(|| {
                        TreeEntry::new(ObjectHash::EMPTY, ObjectKind::Blob, Attrs::default())
                    });
                    let data = match (&e.staged_file, &e.diff) {
                        (Some(staged), _) => Some(fs::read(staged)?),
                        (None, Some(diff)) => Some(diff.clone()),
                        (None, None) => None,
                    };
                    if let Some(data) = data {
                        let hash = ObjectHash::from_payload(&data);
                        sink.add_object(
                            ObjectInfo::new(ObjectKind::Blob, hash, data.len() as u32),
                            &data,
                        )?;
                        te.hash = hash;
                        te.kind = ObjectKind::Blob;
                    }
                    te.attrs.merge_from(&e.attrs);
                    flat.insert(e.path.clone(), te);
                }
                NewDir => {
                    let mut attrs = Attrs::dir();
                    attrs.merge_from(&e.attrs);
                    flat.insert(
                        e.path.clone(),
                        TreeEntry::new(ObjectHash::EMPTY, ObjectKind::Tree, attrs),
                    );
                }
                DeletedFile => {
                    flat.remove(&e.path);
                }
                DeletedDir => {
                    flat.remove(&e.path);
                    remove_subtree(&mut flat, &e.path);
                }
                Renamed => {
                    let target = match &e.rename_target {
                        Some(t) => normalize_path(t),
                        None => {
                            warn!(path = %e.path, "rename entry without target");
                            continue;
                        }
                    };
                    if let Some(te) = flat.remove(&e.path) {
                        flat.insert(target.clone(), te);
                    }
                    let prefix = format!("{}/", e.path);
                    let moved: Vec<(String, TreeEntry)> = flat
                        .range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .map(|(k, v)| (format!("{}/{}", target, &k[prefix.len()..]), *v))
                        .collect();
                    remove_subtree(&mut flat, &e.path);
                    for (k, v) in moved {
                        flat.insert(k, v);
                    }
                }
            }
        }

        build_tree(&flat, sink)
    }
}

fn remove_subtree(flat: &mut BTreeMap<String, TreeEntry>, path: &str) {
    let prefix = format!("{}/", path);
    let doomed: Vec<String> = flat
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .map(|(k, _)| k.clone())
        .collect();
    for k in doomed {
        flat.remove(&k);
    }
}

/// Assemble nested trees from a flat path map, deepest directories first,
/// storing every subtree object (root included) into the sink.
fn build_tree(
    flat: &BTreeMap<String, TreeEntry>,
    sink: &mut TempDir,
) -> Result<(Tree, ObjectHash)> {
    enum Child {
        File(TreeEntry),
        Dir(String),
    }

    let mut dir_attrs: HashMap<String, Attrs> = HashMap::new();
    let mut dirs: Vec<String> = vec!["/".to_string()];
    let mut children: HashMap<String, Vec<(String, Child)>> = HashMap::new();
    children.insert("/".to_string(), Vec::new());

    // Every ancestor is a directory, explicit entry or not
    for (path, entry) in flat {
        let mut dir = parent_of(path);
        while !children.contains_key(&dir) {
            children.insert(dir.clone(), Vec::new());
            dirs.push(dir.clone());
            dir = parent_of(&dir);
        }
        if entry.kind == ObjectKind::Tree {
            dir_attrs.insert(path.clone(), entry.attrs);
            if !children.contains_key(path) {
                children.insert(path.clone(), Vec::new());
                dirs.push(path.clone());
            }
        }
    }

    for (path, entry) in flat {
        if entry.kind == ObjectKind::Tree {
            continue;
        }
        children
            .get_mut(&parent_of(path))
            .unwrap()
            .push((name_of(path).to_string(), Child::File(*entry)));
    }
    for dir in dirs.clone() {
        if dir == "/" {
            continue;
        }
        children
            .get_mut(&parent_of(&dir))
            .unwrap()
            .push((name_of(&dir).to_string(), Child::Dir(dir.clone())));
    }

    // Deepest first, so every subdirectory hash exists before its parent
    dirs.sort_by_key(|d| {
        std::cmp::Reverse(d.split('/').filter(|c| !c.is_empty()).count())
    });

    let mut built: HashMap<String, (ObjectHash, Attrs)> = HashMap::new();
    let mut root = None;
    for dir in &dirs {
        let mut tree = Tree::new();
        for (name, child) in children.remove(dir).unwrap_or_default() {
            match child {
                Child::File(entry) => tree.insert(name, entry),
                Child::Dir(path) => {
                    let (hash, attrs) = built[&path];
                    tree.insert(name, TreeEntry::new(hash, ObjectKind::Tree, attrs));
                }
            }
        }

        let bytes = tree.to_bytes()?;
        let hash = ObjectHash::from_payload(&bytes);
        sink.add_object(
            ObjectInfo::new(ObjectKind::Tree, hash, bytes.len() as u32),
            &bytes,
        )?;
        let attrs = dir_attrs.get(dir).copied().unwrap_or_else(Attrs::dir);
        built.insert(dir.clone(), (hash, attrs));

        if dir == "/" {
            root = Some((tree, hash));
        }
    }

    root.ok_or_else(|| StoreError::Corruption("tree build produced no root".to_string()))
}

/// Per-session temporary object sink
///
/// Staged objects live as one file each (info header followed by payload)
/// under `<root>/tmp/<session>`, until the repo facade imports them at
/// commit time. The directory is removed when the sink is dropped.
pub struct TempDir {
    path: PathBuf,
    objects: Vec<(ObjectInfo, PathBuf)>,
    by_hash: HashMap<ObjectHash, usize>,
}

impl TempDir {
    pub fn new(tmp_root: &Path) -> Result<Self> {
        let path = tmp_root.join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            objects: Vec::new(),
            by_hash: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fresh path for staging new file contents before they become objects
    pub fn stage_path(&self) -> PathBuf {
        self.path.join(format!("stage-{}", uuid::Uuid::new_v4()))
    }

    /// Store one object; duplicate hashes are a no-op
    pub fn add_object(&mut self, info: ObjectInfo, payload: &[u8]) -> Result<()> {
        if self.by_hash.contains_key(&info.hash) {
            return Ok(());
        }

        let file_path = self.path.join(info.hash.to_hex());
        let mut buf = Vec::with_capacity(ObjectInfo::SIZE + payload.len());
        buf.extend_from_slice(&info.to_bytes());
        buf.extend_from_slice(payload);
        fs::write(&file_path, buf)?;

        self.by_hash.insert(info.hash, self.objects.len());
        self.objects.push((info, file_path));
        Ok(())
    }

    pub fn contains(&self, hash: &ObjectHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn objects(&self) -> &[(ObjectInfo, PathBuf)] {
        &self.objects
    }

    /// Payload bytes of the i-th staged object
    pub fn payload(&self, i: usize) -> Result<Vec<u8>> {
        let (_, path) = &self.objects[i];
        let data = fs::read(path)?;
        if data.len() < ObjectInfo::SIZE {
            return Err(StoreError::Corruption(format!(
                "staged object {} truncated",
                path.display()
            )));
        }
        Ok(data[ObjectInfo::SIZE..].to_vec())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_tree_of(
        entries: &[(&str, ObjectKind)],
    ) -> BTreeMap<String, TreeEntry> {
        entries
            .iter()
            .map(|(path, kind)| {
                let attrs = if *kind == ObjectKind::Tree {
                    Attrs::dir()
                } else {
                    Attrs::default()
                };
                (
                    normalize_path(path),
                    TreeEntry::new(ObjectHash::from_payload(path.as_bytes()), *kind, attrs),
                )
            })
            .collect()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("/a//b/"), "/a/b");
        assert_eq!(normalize_path("./a"), "/a");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(parent_of("/a/b"), "/a");
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(name_of("/a/b"), "b");
    }

    #[test]
    fn test_latest_entry_tracks_appends() {
        let mut diff = TreeDiff::new();
        assert!(diff.latest_entry("/f").is_none());

        diff.append(TreeDiffEntry::new(DiffKind::NewFile, "/f"));
        assert_eq!(diff.latest_entry("/f").unwrap().kind, DiffKind::NewFile);

        diff.append(TreeDiffEntry::new(DiffKind::NewDir, "/d"));
        assert_eq!(diff.latest_entry("/d").unwrap().kind, DiffKind::NewDir);
        assert_eq!(diff.latest_entry("/f").unwrap().kind, DiffKind::NewFile);
    }

    #[test]
    fn test_merge_grows_layer_across_type_boundary() {
        let mut diff = TreeDiff::new();
        assert!(!diff.merge_into(TreeDiffEntry::new(DiffKind::DeletedFile, "/x")));
        assert!(diff.merge_into(TreeDiffEntry::new(DiffKind::NewDir, "/x")));

        let mut diff = TreeDiff::new();
        assert!(!diff.merge_into(TreeDiffEntry::new(DiffKind::DeletedDir, "/y")));
        assert!(diff.merge_into(TreeDiffEntry::new(DiffKind::NewFile, "/y")));
    }

    #[test]
    fn test_merge_recreate_same_type_is_modify() {
        let mut diff = TreeDiff::new();
        diff.merge_into(TreeDiffEntry::new(DiffKind::DeletedFile, "/x"));
        assert!(!diff.merge_into(
            TreeDiffEntry::new(DiffKind::NewFile, "/x").with_diff(b"data".to_vec())
        ));
        let latest = diff.latest_entry("/x").unwrap();
        assert_eq!(latest.kind, DiffKind::Modified);
        assert_eq!(latest.diff.as_deref(), Some(b"data".as_ref()));
    }

    #[test]
    fn test_merge_create_then_delete_cancels() {
        let mut diff = TreeDiff::new();
        diff.merge_into(TreeDiffEntry::new(DiffKind::NewFile, "/x"));
        assert!(!diff.merge_into(TreeDiffEntry::new(DiffKind::DeletedFile, "/x")));
        assert!(diff.latest_entry("/x").is_none());
        assert!(diff.is_empty());
    }

    #[test]
    fn test_merge_folds_modifications() {
        let mut diff = TreeDiff::new();
        diff.merge_into(TreeDiffEntry::new(DiffKind::NewFile, "/x").with_diff(b"v1".to_vec()));
        diff.merge_into(TreeDiffEntry::new(DiffKind::Modified, "/x").with_diff(b"v2".to_vec()));

        assert_eq!(diff.entries.iter().filter(|e| e.kind != DiffKind::Noop).count(), 1);
        let latest = diff.latest_entry("/x").unwrap();
        assert_eq!(latest.kind, DiffKind::NewFile);
        assert_eq!(latest.diff.as_deref(), Some(b"v2".as_ref()));
    }

    #[test]
    fn test_apply_to_builds_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = TempDir::new(dir.path()).unwrap();

        let mut diff = TreeDiff::new();
        diff.append(TreeDiffEntry::new(DiffKind::NewFile, "/top.txt").with_diff(b"top".to_vec()));
        diff.append(TreeDiffEntry::new(DiffKind::NewDir, "/sub"));
        diff.append(
            TreeDiffEntry::new(DiffKind::NewFile, "/sub/inner.txt").with_diff(b"inner".to_vec()),
        );

        let (root, root_hash) = diff.apply_to(BTreeMap::new(), &mut sink).unwrap();
        assert!(sink.contains(&root_hash));
        assert_eq!(root.len(), 2);
        assert!(root.get("top.txt").is_some());
        assert_eq!(root.get("sub").unwrap().kind, ObjectKind::Tree);

        // Root tree, subtree, and two blobs
        assert_eq!(sink.len(), 4);
    }

    #[test]
    fn test_apply_to_delete_dir_removes_children() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = TempDir::new(dir.path()).unwrap();

        let flat = flat_tree_of(&[
            ("/keep.txt", ObjectKind::Blob),
            ("/gone", ObjectKind::Tree),
            ("/gone/a.txt", ObjectKind::Blob),
            ("/gone/b.txt", ObjectKind::Blob),
        ]);

        let mut diff = TreeDiff::new();
        diff.append(TreeDiffEntry::new(DiffKind::DeletedDir, "/gone"));

        let (root, _) = diff.apply_to(flat, &mut sink).unwrap();
        assert_eq!(root.len(), 1);
        assert!(root.get("keep.txt").is_some());
    }

    #[test]
    fn test_apply_is_idempotent_for_add_delete_diffs() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = TempDir::new(dir.path()).unwrap();

        let flat = flat_tree_of(&[("/old.txt", ObjectKind::Blob)]);

        let mut diff = TreeDiff::new();
        diff.append(TreeDiffEntry::new(DiffKind::NewFile, "/new.txt").with_diff(b"n".to_vec()));
        diff.append(TreeDiffEntry::new(DiffKind::DeletedFile, "/old.txt"));

        let (first, first_hash) = diff.apply_to(flat, &mut sink).unwrap();

        // Re-flatten the result and apply the same diff again
        let mut reflat = BTreeMap::new();
        for (name, entry) in &first.entries {
            reflat.insert(format!("/{}", name), *entry);
        }
        let (second, second_hash) = diff.apply_to(reflat, &mut sink).unwrap();

        assert_eq!(first, second);
        assert_eq!(first_hash, second_hash);
    }

    #[test]
    fn test_apply_rename_moves_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = TempDir::new(dir.path()).unwrap();

        let flat = flat_tree_of(&[
            ("/src", ObjectKind::Tree),
            ("/src/f.txt", ObjectKind::Blob),
        ]);

        let mut diff = TreeDiff::new();
        let mut entry = TreeDiffEntry::new(DiffKind::Renamed, "/src");
        entry.rename_target = Some("/dst".to_string());
        diff.append(entry);

        let (root, _) = diff.apply_to(flat, &mut sink).unwrap();
        assert!(root.get("src").is_none());
        let dst = root.get("dst").unwrap();
        assert_eq!(dst.kind, ObjectKind::Tree);
    }

    #[test]
    fn test_temp_dir_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let mut sink = TempDir::new(dir.path()).unwrap();
            path = sink.path().to_path_buf();

            let data = b"staged payload";
            let hash = ObjectHash::from_payload(data);
            let info = ObjectInfo::new(ObjectKind::Blob, hash, data.len() as u32);
            sink.add_object(info, data).unwrap();
            sink.add_object(info, data).unwrap();

            assert_eq!(sink.len(), 1);
            assert!(sink.contains(&hash));
            assert_eq!(sink.payload(0).unwrap(), data);
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
