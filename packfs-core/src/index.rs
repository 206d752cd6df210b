//! Per-repo object index
//!
//! Maps object hash to the packfile and byte range holding its stored
//! payload. The map lives in memory; the persisted file is a convenience
//! carrying a checksum, and is rebuilt from the packfiles themselves when
//! missing or damaged.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::manager;
use crate::object::{ObjectHash, ObjectInfo};
use crate::packfile;
use crate::stream::{ReadExt, WriteExt};

/// Locates one object within a specific packfile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub info: ObjectInfo,
    pub offset: u32,
    pub packed_size: u32,
    pub packfile_id: u32,
}

impl IndexEntry {
    const SIZE: usize = ObjectInfo::SIZE + 4 + 4 + 4;
}

/// hash → IndexEntry map with checksummed persistence
pub struct Index {
    path: PathBuf,
    entries: HashMap<ObjectHash, IndexEntry>,
}

impl Index {
    /// Fresh, empty index persisted at the given path
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            entries: HashMap::new(),
        }
    }

    /// Load the index file, or rebuild it by scanning every packfile under
    /// the repo root when the file is missing or fails its checksum.
    pub fn open(path: PathBuf, repo_root: &Path) -> Result<Self> {
        match Self::load(&path) {
            Ok(index) => Ok(index),
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut index = Self::new(path);
                index.rebuild(repo_root)?;
                Ok(index)
            }
            Err(e) => {
                warn!(error = %e, "index load failed, rebuilding from packfiles");
                let mut index = Self::new(path);
                index.rebuild(repo_root)?;
                Ok(index)
            }
        }
    }

    fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        if data.len() < 4 + 32 {
            return Err(StoreError::Corruption("index file truncated".to_string()));
        }

        let (body, checksum) = data.split_at(data.len() - 32);
        if Sha256::digest(body).as_slice() != checksum {
            return Err(StoreError::Corruption(
                "index checksum mismatch".to_string(),
            ));
        }

        let mut cur = std::io::Cursor::new(body);
        let num = cur.read_u32_le()?;
        if num as usize * IndexEntry::SIZE != body.len() - 4 {
            return Err(StoreError::Corruption(
                "index record count mismatch".to_string(),
            ));
        }

        let mut entries = HashMap::with_capacity(num as usize);
        for _ in 0..num {
            let info_buf = cur.read_vec(ObjectInfo::SIZE)?;
            let info = ObjectInfo::from_bytes(&info_buf)?;
            let offset = cur.read_u32_le()?;
            let packed_size = cur.read_u32_le()?;
            let packfile_id = cur.read_u32_le()?;
            entries.insert(
                info.hash,
                IndexEntry {
                    info,
                    offset,
                    packed_size,
                    packfile_id,
                },
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Repopulate by walking every group of every packfile in the repo.
    /// Groups with an unwritten tail are skipped at the first short read.
    pub fn rebuild(&mut self, repo_root: &Path) -> Result<()> {
        self.entries.clear();

        for id in manager::existing_pack_ids(repo_root)? {
            let pack_path = manager::pack_path(repo_root, id);
            let mut file = BufReader::new(File::open(&pack_path)?);

            loop {
                let headers = match packfile::read_group_headers(&mut file)? {
                    Some(h) => h,
                    None => break,
                };

                let payload_bytes: u64 = headers.iter().map(|h| h.packed_size as u64).sum();
                let skipped =
                    std::io::copy(&mut (&mut file).take(payload_bytes), &mut std::io::sink())?;
                if skipped < payload_bytes {
                    break;
                }

                for h in headers {
                    self.entries.insert(
                        h.info.hash,
                        IndexEntry {
                            info: h.info,
                            offset: h.offset,
                            packed_size: h.packed_size,
                            packfile_id: id,
                        },
                    );
                }
            }
        }

        info!(objects = self.entries.len(), "rebuilt index");
        Ok(())
    }

    pub fn get(&self, hash: &ObjectHash) -> Option<&IndexEntry> {
        self.entries.get(hash)
    }

    pub fn contains(&self, hash: &ObjectHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn update_entry(&mut self, hash: ObjectHash, entry: IndexEntry) {
        self.entries.insert(hash, entry);
    }

    pub fn remove(&mut self, hash: &ObjectHash) -> Option<IndexEntry> {
        self.entries.remove(hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectHash, &IndexEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the map atomically: body, then a SHA-256 of the body.
    pub fn save(&self) -> Result<()> {
        let mut body = Vec::with_capacity(4 + self.entries.len() * IndexEntry::SIZE);
        body.write_u32_le(self.entries.len() as u32)?;
        for entry in self.entries.values() {
            body.write_all(&entry.info.to_bytes())?;
            body.write_u32_le(entry.offset)?;
            body.write_u32_le(entry.packed_size)?;
            body.write_u32_le(entry.packfile_id)?;
        }
        let checksum = Sha256::digest(&body);

        let tmp_path = self.path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(&body)?;
        file.write_all(&checksum)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;
    use crate::packfile::{PackOptions, Packfile};
    use tempfile::TempDir;

    fn entry(hash: ObjectHash, pack: u32) -> IndexEntry {
        IndexEntry {
            info: ObjectInfo::new(ObjectKind::Blob, hash, 3),
            offset: 50,
            packed_size: 3,
            packfile_id: pack,
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index");

        let mut index = Index::new(path.clone());
        let h1 = ObjectHash::from_payload(b"one");
        let h2 = ObjectHash::from_payload(b"two");
        index.update_entry(h1, entry(h1, 0));
        index.update_entry(h2, entry(h2, 1));
        index.save().unwrap();

        let loaded = Index::open(path, dir.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&h1), index.get(&h1));
        assert_eq!(loaded.get(&h2), index.get(&h2));
    }

    #[test]
    fn test_corrupt_file_triggers_rebuild() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index");

        // A real packfile to rebuild from
        let mut scratch = Index::new(path.clone());
        let mut pack =
            Packfile::open(&dir.path().join("pack0.pak"), 0, PackOptions::default()).unwrap();
        let data = b"rebuild me";
        let hash = ObjectHash::from_payload(data);
        let mut tx = pack.begin(&mut scratch);
        tx.add(
            ObjectInfo::new(ObjectKind::Blob, hash, data.len() as u32),
            data,
        )
        .unwrap();
        tx.commit().unwrap();
        let expected = scratch.get(&hash).unwrap().clone();

        // Garbage index file
        fs::write(&path, b"not an index at all").unwrap();

        let rebuilt = Index::open(path, dir.path()).unwrap();
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt.get(&hash), Some(&expected));
    }

    #[test]
    fn test_missing_file_rebuilds_empty() {
        let dir = TempDir::new().unwrap();
        let index = Index::open(dir.path().join("index"), dir.path()).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let mut index = Index::new(dir.path().join("index"));
        let h = ObjectHash::from_payload(b"gone");
        index.update_entry(h, entry(h, 0));
        assert!(index.remove(&h).is_some());
        assert!(index.get(&h).is_none());
        assert!(index.remove(&h).is_none());
    }
}
