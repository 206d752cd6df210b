//! Packfile set management
//!
//! Owns the packfiles under a repo root: allocates ids from a persistent
//! free-list and keeps a bounded cache of open handles. The free-list is
//! never empty; its last element is always one greater than the highest
//! allocated id, so allocation cannot exhaust it.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::packfile::{PackOptions, Packfile};
use crate::stream::{ReadExt, WriteExt};

/// Free-list filename under the repo root
pub const FREELIST_FILE: &str = "freelist";

/// Path of the packfile with the given id
pub fn pack_path(root: &Path, id: u32) -> PathBuf {
    root.join(format!("pack{}.pak", id))
}

/// Sorted ids of the packfiles present under the root. Zero-length files
/// are leftovers from a crashed allocation and do not count.
pub(crate) fn existing_pack_ids(root: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        let stem = match name.strip_prefix("pack").and_then(|s| s.strip_suffix(".pak")) {
            Some(s) => s,
            None => continue,
        };
        let id = match stem.parse::<u32>() {
            Ok(id) => id,
            Err(_) => continue,
        };
        if entry.metadata()?.len() == 0 {
            continue;
        }
        ids.push(id);
    }
    ids.sort_unstable();
    Ok(ids)
}

struct CacheSlot {
    pack: Arc<Mutex<Packfile>>,
    last_used: u64,
}

/// Allocates packfile ids and caches open handles
pub struct PackfileManager {
    root: PathBuf,
    opts: PackOptions,
    capacity: usize,
    free_list: VecDeque<u32>,
    cache: HashMap<u32, CacheSlot>,
    clock: u64,
}

impl PackfileManager {
    pub fn new(root: &Path, opts: PackOptions, capacity: usize) -> Result<Self> {
        let mut mgr = Self {
            root: root.to_path_buf(),
            opts,
            capacity: capacity.max(1),
            free_list: VecDeque::new(),
            cache: HashMap::new(),
            clock: 0,
        };

        if !mgr.load_free_list() {
            mgr.recompute_free_list()?;
            mgr.write_free_list()?;
        }
        Ok(mgr)
    }

    /// Fetch an open handle, opening and caching it if needed
    pub fn get_packfile(&mut self, id: u32) -> Result<Arc<Mutex<Packfile>>> {
        self.clock += 1;
        if let Some(slot) = self.cache.get_mut(&id) {
            slot.last_used = self.clock;
            return Ok(slot.pack.clone());
        }

        let pack = Arc::new(Mutex::new(Packfile::open(
            &pack_path(&self.root, id),
            id,
            self.opts,
        )?));
        self.insert_cached(id, pack.clone());
        Ok(pack)
    }

    /// Allocate the next free id and create its packfile
    pub fn new_packfile(&mut self) -> Result<(u32, Arc<Mutex<Packfile>>)> {
        debug_assert!(!self.free_list.is_empty());
        let id = self.free_list[0];
        if self.free_list.len() == 1 {
            self.free_list[0] += 1;
        } else {
            self.free_list.pop_front();
        }

        let pack = Arc::new(Mutex::new(Packfile::open(
            &pack_path(&self.root, id),
            id,
            self.opts,
        )?));
        self.clock += 1;
        self.insert_cached(id, pack.clone());
        self.write_free_list()?;

        debug!(pack = id, "allocated packfile");
        Ok((id, pack))
    }

    /// Delete an emptied packfile and return its id to the free pool
    pub fn free_packfile(&mut self, id: u32) -> Result<()> {
        self.cache.remove(&id);
        match fs::remove_file(pack_path(&self.root, id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.recompute_free_list()?;
        self.write_free_list()?;
        info!(pack = id, "freed packfile");
        Ok(())
    }

    pub fn free_list(&self) -> &VecDeque<u32> {
        &self.free_list
    }

    fn insert_cached(&mut self, id: u32, pack: Arc<Mutex<Packfile>>) {
        while self.cache.len() >= self.capacity {
            // Evict the least recently used handle; dropping it closes the
            // descriptor once outstanding readers finish.
            let victim = self
                .cache
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(id, _)| *id);
            match victim {
                Some(v) => {
                    self.cache.remove(&v);
                }
                None => break,
            }
        }
        self.cache.insert(
            id,
            CacheSlot {
                pack,
                last_used: self.clock,
            },
        );
    }

    /// Derive the free-list from the directory: the gaps below the highest
    /// existing id, then highest + 1.
    fn recompute_free_list(&mut self) -> Result<()> {
        let ids = existing_pack_ids(&self.root)?;
        self.free_list.clear();

        if ids.is_empty() {
            self.free_list.push_back(0);
        } else {
            let mut expected = 0u32;
            for &id in &ids {
                while expected < id {
                    self.free_list.push_back(expected);
                    expected += 1;
                }
                expected = id + 1;
            }
            self.free_list.push_back(ids[ids.len() - 1] + 1);
        }

        debug!(free = self.free_list.len(), "recomputed free list");
        Ok(())
    }

    /// Load the persisted free-list; any failure falls back to recompute
    fn load_free_list(&mut self) -> bool {
        let path = self.root.join(FREELIST_FILE);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => return false,
        };

        let mut reader = BufReader::new(file);
        let num = match reader.read_u32_le() {
            Ok(n) => n,
            Err(_) => return false,
        };

        self.free_list.clear();
        for _ in 0..num {
            match reader.read_u32_le() {
                Ok(id) => self.free_list.push_back(id),
                Err(e) => {
                    warn!(error = %e, "truncated free list, recomputing");
                    return false;
                }
            }
        }

        !self.free_list.is_empty()
    }

    pub fn write_free_list(&self) -> Result<()> {
        let mut buf = Vec::with_capacity(4 + self.free_list.len() * 4);
        buf.write_u32_le(self.free_list.len() as u32)?;
        for &id in &self.free_list {
            buf.write_u32_le(id)?;
        }
        fs::write(self.root.join(FREELIST_FILE), buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;
    use crate::object::{ObjectHash, ObjectInfo, ObjectKind};
    use tempfile::TempDir;

    fn manager(root: &Path) -> PackfileManager {
        PackfileManager::new(root, PackOptions::default(), 4).unwrap()
    }

    fn write_pack_with_object(root: &Path, id: u32) {
        let mut index = Index::new(root.join("scratch_index"));
        let mut pack = Packfile::open(&pack_path(root, id), id, PackOptions::default()).unwrap();
        let data = format!("object {}", id).into_bytes();
        let mut tx = pack.begin(&mut index);
        tx.add(
            ObjectInfo::new(
                ObjectKind::Blob,
                ObjectHash::from_payload(&data),
                data.len() as u32,
            ),
            &data,
        )
        .unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_empty_repo_free_list() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(dir.path());
        assert_eq!(mgr.free_list().iter().copied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_allocation_extends_list() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(dir.path());

        let (id0, _) = mgr.new_packfile().unwrap();
        assert_eq!(id0, 0);
        assert_eq!(mgr.free_list().iter().copied().collect::<Vec<_>>(), vec![1]);

        let (id1, _) = mgr.new_packfile().unwrap();
        assert_eq!(id1, 1);
        assert_eq!(mgr.free_list().iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_recompute_finds_gaps() {
        let dir = TempDir::new().unwrap();
        for id in [0u32, 2, 5] {
            write_pack_with_object(dir.path(), id);
        }
        // No free-list file: recomputed from the directory
        let mgr = manager(dir.path());
        assert_eq!(
            mgr.free_list().iter().copied().collect::<Vec<_>>(),
            vec![1, 3, 4, 6]
        );
    }

    #[test]
    fn test_zero_length_pack_counts_as_free() {
        let dir = TempDir::new().unwrap();
        write_pack_with_object(dir.path(), 0);
        fs::write(pack_path(dir.path(), 1), b"").unwrap();

        let mgr = manager(dir.path());
        assert_eq!(mgr.free_list().iter().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_free_list_persists() {
        let dir = TempDir::new().unwrap();
        {
            let mut mgr = manager(dir.path());
            mgr.new_packfile().unwrap();
            mgr.new_packfile().unwrap();
        }
        let mgr = manager(dir.path());
        assert_eq!(mgr.free_list().iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_free_packfile_returns_id() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(dir.path());
        for _ in 0..3 {
            let (id, pack) = mgr.new_packfile().unwrap();
            write_pack_with_object(dir.path(), id);
            drop(pack);
        }

        mgr.free_packfile(1).unwrap();
        assert_eq!(
            mgr.free_list().iter().copied().collect::<Vec<_>>(),
            vec![1, 3]
        );
        let (next, _) = mgr.new_packfile().unwrap();
        assert_eq!(next, 1);
    }

    #[test]
    fn test_cache_is_bounded() {
        let dir = TempDir::new().unwrap();
        let mut mgr = PackfileManager::new(dir.path(), PackOptions::default(), 2).unwrap();
        for _ in 0..5 {
            mgr.new_packfile().unwrap();
        }
        assert!(mgr.cache.len() <= 2);

        // Evicted handles reopen transparently
        let pack = mgr.get_packfile(0).unwrap();
        assert_eq!(pack.lock().id(), 0);
    }
}
