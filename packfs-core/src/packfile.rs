//! Append-only packfile storage
//!
//! A packfile is a sequence of groups. Each group is a `u32` object count,
//! that many fixed-width headers (ObjectInfo | packed_size | offset), then
//! the payload byte ranges in header order. Offsets are absolute within the
//! file, so the index can point straight at stored bytes. The file is never
//! scanned at open; the index is authoritative for lookup.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::config::RepoConfig;
use crate::error::{Result, StoreError};
use crate::index::{Index, IndexEntry};
use crate::object::{ObjectHash, ObjectInfo, FLAG_COMPRESSED};
use crate::stream::{compress, payload_reader, FileRange, ReadExt, WriteExt};

/// Header record size: ObjectInfo | packed_size:u32 | offset:u32
pub const ENTRY_SIZE: usize = ObjectInfo::SIZE + 4 + 4;

/// Sample length for the compressibility check
pub const COMPCHECK_BYTES: usize = 8192;

/// Compress only when the sampled ratio is at or below this
pub const COMPCHECK_RATIO: f32 = 0.9;

/// Per-packfile tunables, derived from the repo config
#[derive(Debug, Clone, Copy)]
pub struct PackOptions {
    pub max_objects: usize,
    pub max_size: u64,
    pub compression: bool,
    pub zip_minimum_size: usize,
}

impl From<&RepoConfig> for PackOptions {
    fn from(cfg: &RepoConfig) -> Self {
        Self {
            max_objects: cfg.pack_max_objects,
            max_size: cfg.pack_max_size,
            compression: cfg.compression,
            zip_minimum_size: cfg.zip_minimum_size,
        }
    }
}

impl Default for PackOptions {
    fn default() -> Self {
        (&RepoConfig::default()).into()
    }
}

/// One group header as stored on disk
#[derive(Debug, Clone, Copy)]
pub(crate) struct GroupEntry {
    pub info: ObjectInfo,
    pub packed_size: u32,
    pub offset: u32,
}

/// Read one group's headers. `Ok(None)` means a clean end: either EOF at a
/// group boundary or a short read in the tail, which is treated as unwritten.
pub(crate) fn read_group_headers<R: Read>(r: &mut R) -> Result<Option<Vec<GroupEntry>>> {
    let num = match r.read_u32_le() {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::with_capacity(num as usize);
    for _ in 0..num {
        let mut buf = [0u8; ENTRY_SIZE];
        match r.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let info = ObjectInfo::from_bytes(&buf[..ObjectInfo::SIZE])?;
        let packed_size =
            u32::from_le_bytes(buf[ObjectInfo::SIZE..ObjectInfo::SIZE + 4].try_into().unwrap());
        let offset =
            u32::from_le_bytes(buf[ObjectInfo::SIZE + 4..ENTRY_SIZE].try_into().unwrap());
        entries.push(GroupEntry {
            info,
            packed_size,
            offset,
        });
    }
    Ok(Some(entries))
}

/// Append-only container of object payloads
pub struct Packfile {
    id: u32,
    path: PathBuf,
    file: File,
    file_size: u64,
    num_objects: u32,
    opts: PackOptions,
}

impl Packfile {
    /// Open or create a packfile. The contents are not scanned.
    pub fn open(path: &Path, id: u32, opts: PackOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let file_size = file.metadata()?.len();

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file,
            file_size,
            num_objects: 0,
            opts,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Objects appended through this handle (the file is not scanned at open)
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    pub fn full(&self) -> bool {
        self.num_objects as usize >= self.opts.max_objects || self.file_size >= self.opts.max_size
    }

    /// Start a staging transaction against this packfile
    pub fn begin<'a>(&'a mut self, index: &'a mut Index) -> PackTransaction<'a> {
        PackTransaction {
            pack: self,
            index,
            infos: Vec::new(),
            payloads: Vec::new(),
            total_size: 0,
            by_hash: HashMap::new(),
            committed: false,
        }
    }

    /// Lazy stream over one stored object, decompressed per its flags
    pub fn payload(&self, entry: &IndexEntry) -> Result<Box<dyn Read>> {
        debug_assert_eq!(entry.packfile_id, self.id);
        let stored = FileRange::new(
            self.file.try_clone()?,
            entry.offset as u64,
            entry.packed_size as u64,
        );
        Ok(payload_reader(stored, entry.info.is_compressed())?)
    }

    /// Append a group and publish its index entries.
    ///
    /// Payloads must already be in stored form; index entries become visible
    /// only after the bytes are written.
    fn commit_records(
        &mut self,
        infos: &[ObjectInfo],
        payloads: &[Vec<u8>],
        index: &mut Index,
    ) -> Result<()> {
        debug_assert_eq!(infos.len(), payloads.len());
        if infos.is_empty() {
            return Ok(());
        }

        let n = infos.len();
        let headers_size = n * ENTRY_SIZE;
        let mut off = self.file_size + 4 + headers_size as u64;

        let mut headers = Vec::with_capacity(4 + headers_size);
        headers.write_u32_le(n as u32)?;
        let mut offsets = Vec::with_capacity(n);
        for (info, payload) in infos.iter().zip(payloads) {
            if off + payload.len() as u64 > u32::MAX as u64 {
                return Err(StoreError::Corruption(format!(
                    "pack{} offset overflow",
                    self.id
                )));
            }
            headers.write_all(&info.to_bytes())?;
            headers.write_u32_le(payload.len() as u32)?;
            headers.write_u32_le(off as u32)?;
            offsets.push(off as u32);
            off += payload.len() as u64;
        }

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&headers)?;
        self.file_size += headers.len() as u64;

        for (i, payload) in payloads.iter().enumerate() {
            self.file.write_all(payload)?;
            self.file_size += payload.len() as u64;
            self.num_objects += 1;

            index.update_entry(
                infos[i].hash,
                IndexEntry {
                    info: infos[i],
                    offset: offsets[i],
                    packed_size: payload.len() as u32,
                    packfile_id: self.id,
                },
            );
        }

        Ok(())
    }

    /// Rewrite the packfile excluding the given hashes.
    ///
    /// Kept objects carry their stored bytes over verbatim and get fresh
    /// index entries. Returns true when nothing is left; the caller removes
    /// the dropped hashes from the index and may free the id.
    pub fn purge(&mut self, hset: &HashSet<ObjectHash>, index: &mut Index) -> Result<bool> {
        let mut kept_infos = Vec::new();
        let mut kept_payloads = Vec::new();

        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(self.file.try_clone()?);
        'groups: loop {
            let headers = match read_group_headers(&mut reader)? {
                Some(h) => h,
                None => break,
            };

            let mut group_payloads = Vec::with_capacity(headers.len());
            for h in &headers {
                let mut payload = vec![0u8; h.packed_size as usize];
                match reader.read_exact(&mut payload) {
                    Ok(()) => group_payloads.push(payload),
                    // Unwritten tail; the whole group is discarded.
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break 'groups,
                    Err(e) => return Err(e.into()),
                }
            }

            for (h, payload) in headers.iter().zip(group_payloads) {
                if !hset.contains(&h.info.hash) {
                    kept_infos.push(h.info);
                    kept_payloads.push(payload);
                }
            }
        }

        // Swap in a fresh file and rename it over the original; the handle
        // stays valid across the rename.
        let tmp_path = self.path.with_file_name(format!(
            "{}.tmp",
            self.path.file_name().unwrap_or_default().to_string_lossy()
        ));
        let tmp_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        std::fs::rename(&tmp_path, &self.path)?;

        self.file = tmp_file;
        self.file_size = 0;
        self.num_objects = 0;

        let empty = kept_infos.is_empty();
        debug!(
            pack = self.id,
            kept = kept_infos.len(),
            "purged packfile"
        );
        self.commit_records(&kept_infos, &kept_payloads, index)?;

        Ok(empty)
    }

    /// Stream selected objects: count, then (info, packed_size) per object,
    /// then the raw stored bytes as maximal contiguous runs. Offsets are
    /// reconstructed on the receiving side, so none are sent.
    pub fn transmit(&self, out: &mut dyn Write, entries: &[IndexEntry]) -> Result<()> {
        let mut objects = entries.to_vec();
        objects.sort_by_key(|e| e.offset);

        out.write_u32_le(objects.len() as u32)?;
        for e in &objects {
            out.write_all(&e.info.to_bytes())?;
            out.write_u32_le(e.packed_size)?;
        }

        // Coalesce adjacent ranges into [start, end) blocks
        let mut blocks: Vec<(u32, u32)> = Vec::new();
        for e in &objects {
            if e.packed_size == 0 {
                continue;
            }
            let end = e.offset + e.packed_size;
            match blocks.last_mut() {
                Some((_, last_end)) if *last_end == e.offset => *last_end = end,
                _ => blocks.push((e.offset, end)),
            }
        }
        debug!(pack = self.id, blocks = blocks.len(), "transmitting runs");

        for (start, end) in blocks {
            let mut stored = FileRange::new(
                self.file.try_clone()?,
                start as u64,
                (end - start) as u64,
            );
            std::io::copy(&mut stored, out)?;
        }

        Ok(())
    }

    /// Receive a transmitted object stream into this packfile. Offsets are
    /// assigned locally. Returns false on an empty stream.
    pub fn receive(&mut self, src: &mut dyn Read, index: &mut Index) -> Result<bool> {
        let num = src.read_u32_le()?;
        if num == 0 {
            return Ok(false);
        }

        let headers_size = num as usize * ENTRY_SIZE;
        let mut off = self.file_size + 4 + headers_size as u64;

        let mut headers = Vec::with_capacity(4 + headers_size);
        headers.write_u32_le(num)?;
        let mut incoming = Vec::with_capacity(num as usize);
        for _ in 0..num {
            let info_buf = src.read_vec(ObjectInfo::SIZE)?;
            let info = ObjectInfo::from_bytes(&info_buf)?;
            let packed_size = src.read_u32_le()?;
            if off + packed_size as u64 > u32::MAX as u64 {
                return Err(StoreError::Corruption(format!(
                    "pack{} offset overflow on receive",
                    self.id
                )));
            }

            headers.write_all(&info_buf)?;
            headers.write_u32_le(packed_size)?;
            headers.write_u32_le(off as u32)?;

            incoming.push((info, packed_size, off as u32));
            off += packed_size as u64;
        }

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&headers)?;
        self.file_size += headers.len() as u64;

        for (info, packed_size, offset) in incoming {
            let data = src.read_vec(packed_size as usize)?;
            self.file.write_all(&data)?;
            self.file_size += data.len() as u64;
            self.num_objects += 1;

            index.update_entry(
                info.hash,
                IndexEntry {
                    info,
                    offset,
                    packed_size,
                    packfile_id: self.id,
                },
            );
        }

        Ok(true)
    }
}

/// Staging buffer for one group of appends.
///
/// Commits on scope exit unless already committed; callers who want to
/// discard must `clear` it first.
pub struct PackTransaction<'a> {
    pack: &'a mut Packfile,
    index: &'a mut Index,
    infos: Vec<ObjectInfo>,
    payloads: Vec<Vec<u8>>,
    total_size: u64,
    by_hash: HashMap<ObjectHash, usize>,
    committed: bool,
}

impl<'a> PackTransaction<'a> {
    /// Stage a payload, deciding compression with a bounded-cost sample.
    pub fn add(&mut self, mut info: ObjectInfo, payload: &[u8]) -> Result<()> {
        if self.by_hash.contains_key(&info.hash) {
            warn!(hash = %info.hash, "duplicate payload in transaction");
        }

        let opts = self.pack.opts;
        let stored = if opts.compression && payload.len() >= opts.zip_minimum_size {
            let sample_len = payload.len().min(COMPCHECK_BYTES);
            let sample = compress(&payload[..sample_len])?;
            let ratio = sample.len() as f32 / sample_len as f32;
            debug!(hash = %info.hash, ratio, "compression check");
            if ratio <= COMPCHECK_RATIO {
                info.flags |= FLAG_COMPRESSED;
                if sample_len == payload.len() {
                    // The sample covered the whole payload; reuse it.
                    sample
                } else {
                    compress(payload)?
                }
            } else {
                payload.to_vec()
            }
        } else {
            payload.to_vec()
        };

        self.total_size += stored.len() as u64;
        self.infos.push(info);
        self.payloads.push(stored);
        self.by_hash.insert(info.hash, self.infos.len() - 1);
        Ok(())
    }

    pub fn contains(&self, hash: &ObjectHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn full(&self) -> bool {
        self.infos.len() >= self.pack.opts.max_objects || self.total_size >= self.pack.opts.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Discard staged contents so scope exit commits nothing
    pub fn clear(&mut self) {
        self.infos.clear();
        self.payloads.clear();
        self.by_hash.clear();
        self.total_size = 0;
    }

    pub fn commit(mut self) -> Result<()> {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> Result<()> {
        if !self.committed {
            self.pack
                .commit_records(&self.infos, &self.payloads, self.index)?;
            self.committed = true;
        }
        Ok(())
    }
}

impl Drop for PackTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.infos.is_empty() {
            if let Err(e) = self.commit_inner() {
                error!(pack = self.pack.id, error = %e, "transaction commit failed on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn small_opts() -> PackOptions {
        PackOptions {
            max_objects: 4,
            max_size: 1024 * 1024,
            compression: true,
            zip_minimum_size: 512,
        }
    }

    fn add_payload(pack: &mut Packfile, index: &mut Index, data: &[u8]) -> ObjectHash {
        let hash = ObjectHash::from_payload(data);
        let info = ObjectInfo::new(ObjectKind::Blob, hash, data.len() as u32);
        let mut tx = pack.begin(index);
        tx.add(info, data).unwrap();
        tx.commit().unwrap();
        hash
    }

    fn read_back(pack: &Packfile, index: &Index, hash: &ObjectHash) -> Vec<u8> {
        let entry = index.get(hash).unwrap().clone();
        let mut out = Vec::new();
        pack.payload(&entry).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_add_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut index = Index::new(dir.path().join("index"));
        let mut pack = Packfile::open(&dir.path().join("pack0.pak"), 0, small_opts()).unwrap();

        let h = add_payload(&mut pack, &mut index, b"hello");
        assert_eq!(read_back(&pack, &index, &h), b"hello");
        assert_eq!(index.len(), 1);
        assert!(pack.file_size() > 0);
    }

    #[test]
    fn test_empty_transaction_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut index = Index::new(dir.path().join("index"));
        let mut pack = Packfile::open(&dir.path().join("pack0.pak"), 0, small_opts()).unwrap();

        let tx = pack.begin(&mut index);
        drop(tx);
        assert_eq!(pack.file_size(), 0);
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_drop_commits_staged_objects() {
        let dir = TempDir::new().unwrap();
        let mut index = Index::new(dir.path().join("index"));
        let mut pack = Packfile::open(&dir.path().join("pack0.pak"), 0, small_opts()).unwrap();

        let data = b"auto committed";
        let hash = ObjectHash::from_payload(data);
        {
            let mut tx = pack.begin(&mut index);
            tx.add(
                ObjectInfo::new(ObjectKind::Blob, hash, data.len() as u32),
                data,
            )
            .unwrap();
        }
        assert_eq!(read_back(&pack, &index, &hash), data);
    }

    #[test]
    fn test_cleared_transaction_commits_nothing() {
        let dir = TempDir::new().unwrap();
        let mut index = Index::new(dir.path().join("index"));
        let mut pack = Packfile::open(&dir.path().join("pack0.pak"), 0, small_opts()).unwrap();

        {
            let mut tx = pack.begin(&mut index);
            tx.add(
                ObjectInfo::new(ObjectKind::Blob, ObjectHash::from_payload(b"x"), 1),
                b"x",
            )
            .unwrap();
            tx.clear();
        }
        assert_eq!(pack.file_size(), 0);
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_compression_heuristic() {
        let dir = TempDir::new().unwrap();
        let mut index = Index::new(dir.path().join("index"));
        let mut pack = Packfile::open(&dir.path().join("pack0.pak"), 0, small_opts()).unwrap();

        // Highly compressible payload
        let compressible = vec![b'a'; 64 * 1024];
        let h1 = add_payload(&mut pack, &mut index, &compressible);
        let e1 = index.get(&h1).unwrap();
        assert!(e1.info.is_compressed());
        assert!((e1.packed_size as usize) < compressible.len());
        assert_eq!(read_back(&pack, &index, &h1), compressible);

        // Too small to bother
        let tiny = b"tiny";
        let h2 = add_payload(&mut pack, &mut index, tiny);
        assert!(!index.get(&h2).unwrap().info.is_compressed());
        assert_eq!(read_back(&pack, &index, &h2), tiny);
    }

    #[test]
    fn test_transaction_full() {
        let dir = TempDir::new().unwrap();
        let mut index = Index::new(dir.path().join("index"));
        let mut pack = Packfile::open(&dir.path().join("pack0.pak"), 0, small_opts()).unwrap();

        let mut tx = pack.begin(&mut index);
        let mut last = ObjectHash::EMPTY;
        for i in 0u32..4 {
            let data = i.to_le_bytes();
            last = ObjectHash::from_payload(&data);
            tx.add(ObjectInfo::new(ObjectKind::Blob, last, 4), &data).unwrap();
        }
        assert!(tx.full());
        assert!(tx.contains(&last));
        tx.commit().unwrap();
        assert!(pack.full());
        assert_eq!(pack.num_objects(), 4);
    }

    #[test]
    fn test_purge_keeps_and_drops() {
        let dir = TempDir::new().unwrap();
        let mut index = Index::new(dir.path().join("index"));
        let mut pack = Packfile::open(&dir.path().join("pack0.pak"), 0, small_opts()).unwrap();

        let payloads: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 16]).collect();
        let hashes: Vec<ObjectHash> = payloads
            .iter()
            .map(|p| add_payload(&mut pack, &mut index, p))
            .collect();
        let size_before = pack.file_size();

        let mut drop_set = HashSet::new();
        drop_set.insert(hashes[1]);
        let empty = pack.purge(&drop_set, &mut index).unwrap();
        assert!(!empty);
        assert!(pack.file_size() < size_before);

        index.remove(&hashes[1]);
        for (i, h) in hashes.iter().enumerate() {
            if i == 1 {
                assert!(index.get(h).is_none());
            } else {
                assert_eq!(read_back(&pack, &index, h), payloads[i]);
            }
        }
    }

    #[test]
    fn test_purge_to_empty() {
        let dir = TempDir::new().unwrap();
        let mut index = Index::new(dir.path().join("index"));
        let mut pack = Packfile::open(&dir.path().join("pack0.pak"), 0, small_opts()).unwrap();

        let h = add_payload(&mut pack, &mut index, b"only one");
        let mut drop_set = HashSet::new();
        drop_set.insert(h);
        assert!(pack.purge(&drop_set, &mut index).unwrap());
        assert_eq!(pack.file_size(), 0);
    }

    #[test]
    fn test_transmit_receive_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut src_index = Index::new(dir.path().join("src_index"));
        let mut src = Packfile::open(&dir.path().join("pack0.pak"), 0, small_opts()).unwrap();

        let payloads: Vec<Vec<u8>> = vec![b"aa".to_vec(), vec![b'z'; 2048], b"cc".to_vec()];
        let hashes: Vec<ObjectHash> = payloads
            .iter()
            .map(|p| add_payload(&mut src, &mut src_index, p))
            .collect();

        let entries: Vec<IndexEntry> = hashes
            .iter()
            .map(|h| src_index.get(h).unwrap().clone())
            .collect();

        let mut wire = Vec::new();
        src.transmit(&mut wire, &entries).unwrap();

        let mut dst_index = Index::new(dir.path().join("dst_index"));
        let mut dst = Packfile::open(&dir.path().join("pack7.pak"), 7, small_opts()).unwrap();
        assert!(dst.receive(&mut Cursor::new(wire), &mut dst_index).unwrap());

        for (i, h) in hashes.iter().enumerate() {
            let entry = dst_index.get(h).unwrap().clone();
            assert_eq!(entry.packfile_id, 7);
            assert_eq!(entry.info, src_index.get(h).unwrap().info);
            let mut out = Vec::new();
            dst.payload(&entry).unwrap().read_to_end(&mut out).unwrap();
            assert_eq!(out, payloads[i]);
        }
    }

    #[test]
    fn test_receive_empty_stream() {
        let dir = TempDir::new().unwrap();
        let mut index = Index::new(dir.path().join("index"));
        let mut pack = Packfile::open(&dir.path().join("pack0.pak"), 0, small_opts()).unwrap();

        let wire = 0u32.to_le_bytes().to_vec();
        assert!(!pack.receive(&mut Cursor::new(wire), &mut index).unwrap());
    }
}
