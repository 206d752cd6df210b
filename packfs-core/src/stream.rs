//! Uniform byte sources for packfile and log framing
//!
//! Fixed records are little-endian throughout. `FileRange` is a lazy reader
//! over a byte range of a file; `payload_reader` layers a zstd decoder on
//! top when the stored bytes are compressed.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;

use crate::object::ObjectHash;

/// Little-endian read helpers for framed records
pub trait ReadExt: Read {
    fn read_u16_le(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_hash(&mut self) -> io::Result<ObjectHash> {
        let mut buf = [0u8; 32];
        self.read_exact(&mut buf)?;
        Ok(ObjectHash::new(buf))
    }

    fn read_vec(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<R: Read + ?Sized> ReadExt for R {}

/// Little-endian write helpers for framed records
pub trait WriteExt: Write {
    fn write_u16_le(&mut self, v: u16) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_u32_le(&mut self, v: u32) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_hash(&mut self, hash: &ObjectHash) -> io::Result<()> {
        self.write_all(hash.as_bytes())
    }
}

impl<W: Write + ?Sized> WriteExt for W {}

/// Lazy reader over `[offset, offset + len)` of a file
///
/// Uses positioned reads, so it never disturbs the file cursor shared with
/// the append path.
pub struct FileRange {
    file: File,
    offset: u64,
    remaining: u64,
}

impl FileRange {
    pub fn new(file: File, offset: u64, len: u64) -> Self {
        Self {
            file,
            offset,
            remaining: len,
        }
    }
}

impl Read for FileRange {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining as usize);
        let n = self.file.read_at(&mut buf[..want], self.offset)?;
        if n == 0 && want > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stored range reads short",
            ));
        }
        self.offset += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Compress a buffer with the store codec
pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    zstd::stream::encode_all(data, 0)
}

/// Wrap stored bytes in a decompressor when flagged compressed
pub fn payload_reader<R: Read + 'static>(stored: R, compressed: bool) -> io::Result<Box<dyn Read>> {
    if compressed {
        Ok(Box::new(zstd::stream::read::Decoder::new(stored)?))
    } else {
        Ok(Box::new(stored))
    }
}
