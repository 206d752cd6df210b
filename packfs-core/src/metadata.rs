//! Refcount metadata log and per-object key-value side table
//!
//! Both files are append-only sequences of groups replayed at open with
//! last-write-wins semantics. The refcount log records absolute values, not
//! deltas, so replay needs no history. Transactions accumulate changes and
//! commit on scope exit unless already committed.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::Path;

use tracing::{debug, error, warn};

use crate::error::{Result, StoreError};
use crate::object::ObjectHash;
use crate::stream::{ReadExt, WriteExt};

/// Bytes per refcount pair: hash | refcount u32
const PAIR_SIZE: u64 = ObjectHash::SIZE as u64 + 4;

/// Append-only log of object refcounts
pub struct MetadataLog {
    file: File,
    refcounts: HashMap<ObjectHash, u32>,
}

impl MetadataLog {
    /// Open (creating if missing) and replay the log. A short read at a
    /// group boundary ends replay cleanly; a group whose declared size
    /// overruns the file is a corruption error.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let mut refcounts = HashMap::new();
        let mut reader = BufReader::new(file.try_clone()?);
        let mut read_so_far = 0u64;
        loop {
            let num = match reader.read_u32_le() {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            read_so_far += 4;

            if num as u64 * PAIR_SIZE + read_so_far > file_len {
                return Err(StoreError::Corruption(format!(
                    "refcount group of {} entries overruns log", num
                )));
            }

            debug!(entries = num, "replaying refcount group");
            for _ in 0..num {
                let hash = reader.read_hash()?;
                let refcount = reader.read_u32_le()?;
                refcounts.insert(hash, refcount);
                read_so_far += PAIR_SIZE;
            }
        }

        Ok(Self { file, refcounts })
    }

    /// Start a scoped refcount transaction
    pub fn begin(&mut self) -> MdTransaction<'_> {
        MdTransaction {
            log: self,
            counts: HashMap::new(),
            committed: false,
        }
    }

    /// Current refcount; absent hashes are 0
    pub fn ref_count(&self, hash: &ObjectHash) -> u32 {
        self.refcounts.get(hash).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &HashMap<ObjectHash, u32> {
        &self.refcounts
    }

    /// Truncate and write the given map (or the current one) as one group
    pub fn rewrite(&mut self, snapshot: Option<&HashMap<ObjectHash, u32>>) -> Result<()> {
        let map = match snapshot {
            Some(s) => s.clone(),
            None => self.refcounts.clone(),
        };

        self.file.set_len(0)?;

        let mut group = Vec::with_capacity(4 + map.len() * PAIR_SIZE as usize);
        group.write_u32_le(map.len() as u32)?;
        for (hash, count) in &map {
            group.write_hash(hash)?;
            group.write_u32_le(*count)?;
        }
        self.file.write_all(&group)?;

        self.refcounts = map;
        Ok(())
    }

    fn commit_counts(&mut self, counts: &HashMap<ObjectHash, u32>) -> Result<()> {
        if counts.is_empty() {
            return Ok(());
        }

        debug!(entries = counts.len(), "committing refcount group");
        let mut group = Vec::with_capacity(4 + counts.len() * PAIR_SIZE as usize);
        group.write_u32_le(counts.len() as u32)?;

        let mut finals = Vec::with_capacity(counts.len());
        for (hash, delta) in counts {
            debug_assert!(!hash.is_empty());
            let final_count = self.ref_count(hash) + delta;
            group.write_hash(hash)?;
            group.write_u32_le(final_count)?;
            finals.push((*hash, final_count));
        }

        self.file.write_all(&group)?;
        for (hash, count) in finals {
            self.refcounts.insert(hash, count);
        }
        Ok(())
    }
}

/// Scoped accumulator of refcount increments
pub struct MdTransaction<'a> {
    log: &'a mut MetadataLog,
    counts: HashMap<ObjectHash, u32>,
    committed: bool,
}

impl<'a> MdTransaction<'a> {
    /// Bump the transaction's delta for this hash by one
    pub fn add_ref(&mut self, hash: ObjectHash) {
        *self.counts.entry(hash).or_insert(0) += 1;
    }

    /// Discard accumulated deltas so scope exit commits nothing
    pub fn clear(&mut self) {
        self.counts.clear();
    }

    pub fn commit(mut self) -> Result<()> {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> Result<()> {
        if !self.committed {
            let counts = std::mem::take(&mut self.counts);
            self.log.commit_counts(&counts)?;
            self.committed = true;
        }
        Ok(())
    }
}

impl Drop for MdTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.counts.is_empty() {
            if let Err(e) = self.commit_inner() {
                error!(error = %e, "refcount transaction commit failed on drop");
            }
        }
    }
}

/// Per-object key-value side table, framed like the refcount log:
/// groups of `num` then `num × (hash | key_len u16 | key | val_len u32 |
/// val)`. An empty value removes the key.
pub struct MetaKvLog {
    file: File,
    values: HashMap<(ObjectHash, String), String>,
}

impl MetaKvLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut values = HashMap::new();
        let mut reader = BufReader::new(file.try_clone()?);
        'replay: loop {
            let num = match reader.read_u32_le() {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };

            for _ in 0..num {
                let entry = (|| -> std::io::Result<(ObjectHash, String, String)> {
                    let hash = reader.read_hash()?;
                    let key_len = reader.read_u16_le()? as usize;
                    let key = String::from_utf8_lossy(&reader.read_vec(key_len)?).into_owned();
                    let val_len = reader.read_u32_le()? as usize;
                    let val = String::from_utf8_lossy(&reader.read_vec(val_len)?).into_owned();
                    Ok((hash, key, val))
                })();
                match entry {
                    Ok((hash, key, val)) => {
                        if val.is_empty() {
                            values.remove(&(hash, key));
                        } else {
                            values.insert((hash, key), val);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        // Partially written trailing group; keep what replayed.
                        warn!("object metadata log ends mid-group");
                        break 'replay;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(Self { file, values })
    }

    pub fn begin(&mut self) -> KvTransaction<'_> {
        KvTransaction {
            log: self,
            values: HashMap::new(),
            committed: false,
        }
    }

    pub fn meta(&self, hash: &ObjectHash, key: &str) -> Option<&str> {
        self.values
            .get(&(*hash, key.to_string()))
            .map(|s| s.as_str())
    }

    /// Truncate and write the given map (or the current one) as one group
    pub fn rewrite(
        &mut self,
        snapshot: Option<&HashMap<(ObjectHash, String), String>>,
    ) -> Result<()> {
        let map = match snapshot {
            Some(s) => s.clone(),
            None => self.values.clone(),
        };

        self.file.set_len(0)?;
        let mut group = Vec::new();
        group.write_u32_le(map.len() as u32)?;
        for ((hash, key), val) in &map {
            write_kv_entry(&mut group, hash, key, val)?;
        }
        self.file.write_all(&group)?;

        self.values = map;
        Ok(())
    }

    pub fn values(&self) -> &HashMap<(ObjectHash, String), String> {
        &self.values
    }

    fn commit_values(&mut self, values: &HashMap<(ObjectHash, String), String>) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }

        let mut group = Vec::new();
        group.write_u32_le(values.len() as u32)?;
        for ((hash, key), val) in values {
            write_kv_entry(&mut group, hash, key, val)?;
        }
        self.file.write_all(&group)?;

        for ((hash, key), val) in values {
            if val.is_empty() {
                self.values.remove(&(*hash, key.clone()));
            } else {
                self.values.insert((*hash, key.clone()), val.clone());
            }
        }
        Ok(())
    }
}

fn write_kv_entry(out: &mut Vec<u8>, hash: &ObjectHash, key: &str, val: &str) -> Result<()> {
    out.write_hash(hash)?;
    out.write_u16_le(key.len() as u16)?;
    out.write_all(key.as_bytes())?;
    out.write_u32_le(val.len() as u32)?;
    out.write_all(val.as_bytes())?;
    Ok(())
}

/// Scoped accumulator of key-value writes
pub struct KvTransaction<'a> {
    log: &'a mut MetaKvLog,
    values: HashMap<(ObjectHash, String), String>,
    committed: bool,
}

impl<'a> KvTransaction<'a> {
    pub fn set_meta(&mut self, hash: ObjectHash, key: &str, value: &str) {
        self.values
            .insert((hash, key.to_string()), value.to_string());
    }

    /// Tombstone a key
    pub fn remove_meta(&mut self, hash: ObjectHash, key: &str) {
        self.values.insert((hash, key.to_string()), String::new());
    }

    pub fn commit(mut self) -> Result<()> {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> Result<()> {
        if !self.committed {
            let values = std::mem::take(&mut self.values);
            self.log.commit_values(&values)?;
            self.committed = true;
        }
        Ok(())
    }
}

impl Drop for KvTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.values.is_empty() {
            if let Err(e) = self.commit_inner() {
                error!(error = %e, "metadata transaction commit failed on drop");
            }
        }
    }
}
