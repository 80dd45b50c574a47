//! Block files on local directories
//!
//! A block being written lives at `<dir>/.tmp/<block_id>`; commit renames it
//! to `<dir>/<block_id>`. Readers only ever open the committed name.

use crate::meta::BlockEntry;
use crate::tier::{DirRef, StorageDir};
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tierio_common::{BlockId, Result};

/// Committed file path of a block
#[must_use]
pub fn block_path(dir: &StorageDir, block_id: BlockId) -> PathBuf {
    dir.path().join(block_id.to_string())
}

/// Temporary file path of a block being written
#[must_use]
pub fn temp_path(dir: &StorageDir, block_id: BlockId) -> PathBuf {
    dir.temp_dir().join(block_id.to_string())
}

/// Parse a committed block file name
#[must_use]
pub fn parse_block_file(path: &Path) -> Option<BlockId> {
    path.file_name()?
        .to_str()?
        .parse::<u64>()
        .ok()
        .map(BlockId::new)
}

/// Append-only temporary file with a running checksum
#[derive(Debug)]
pub(crate) struct TempBlockFile {
    file: File,
    path: PathBuf,
    written: u64,
    crc: u32,
}

impl TempBlockFile {
    pub(crate) fn create(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            written: 0,
            crc: 0,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.written))?;
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        self.crc = crc32c::crc32c_append(self.crc, data);
        Ok(())
    }

    pub(crate) fn read_all(&mut self) -> Result<Bytes> {
        self.file.flush()?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(usize::try_from(self.written).unwrap_or(0));
        (&mut self.file).take(self.written).read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Sync and close; returns (path, length, checksum)
    pub(crate) fn finish(self) -> Result<(PathBuf, u64, u32)> {
        self.file.sync_all()?;
        Ok((self.path, self.written, self.crc))
    }
}

/// Handle for a block in `Allocating` state
#[derive(Debug)]
pub struct BlockWriter {
    pub(crate) block_id: BlockId,
    pub(crate) location: DirRef,
    /// Bytes currently reserved in `location`
    pub(crate) reserved: u64,
    /// Block size bound
    pub(crate) limit: u64,
    pub(crate) file: TempBlockFile,
    pub(crate) entry: Arc<BlockEntry>,
}

impl BlockWriter {
    #[must_use]
    pub const fn block_id(&self) -> BlockId {
        self.block_id
    }

    #[must_use]
    pub const fn location(&self) -> DirRef {
        self.location
    }

    #[must_use]
    pub const fn written(&self) -> u64 {
        self.file.written
    }

    #[must_use]
    pub const fn reserved(&self) -> u64 {
        self.reserved
    }

    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// crc32c of the bytes written so far
    #[must_use]
    pub const fn checksum(&self) -> u32 {
        self.file.crc
    }

    /// Everything written so far, for flushing to the UFS before commit
    pub fn contents(&mut self) -> Result<Bytes> {
        self.file.read_all()
    }
}

/// Keeps a committed block pinned against eviction
#[derive(Debug)]
pub(crate) struct ReadPin(pub(crate) Arc<BlockEntry>);

impl Drop for ReadPin {
    fn drop(&mut self) {
        self.0.unpin();
    }
}

/// Read handle on a committed block
#[derive(Debug)]
pub struct BlockReader {
    file: File,
    length: u64,
    pin: ReadPin,
    clock: Arc<AtomicU64>,
}

impl BlockReader {
    pub(crate) fn new(file: File, length: u64, pin: ReadPin, clock: Arc<AtomicU64>) -> Self {
        Self {
            file,
            length,
            pin,
            clock,
        }
    }

    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.pin.0.block_id()
    }

    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// Read up to `len` bytes at `offset`; empty at or past the end
    pub fn read(&mut self, offset: u64, len: u64) -> Result<Bytes> {
        if offset >= self.length || len == 0 {
            return Ok(Bytes::new());
        }
        let n = len.min(self.length - offset);
        let mut buf = vec![0u8; usize::try_from(n).unwrap_or(usize::MAX)];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        let seq = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.pin.0.touch(seq);
        Ok(Bytes::from(buf))
    }

    /// Read the whole block
    pub fn read_all(&mut self) -> Result<Bytes> {
        self.read(0, self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_temp_file_append_and_read_back() {
        let dir = tempdir().unwrap();
        let mut file = TempBlockFile::create(dir.path().join("7")).unwrap();
        file.append(b"hello ").unwrap();
        file.append(b"world").unwrap();
        assert_eq!(&file.read_all().unwrap()[..], b"hello world");

        // Appends continue after a read-back
        file.append(b"!").unwrap();
        let (path, len, crc) = file.finish().unwrap();
        assert_eq!(len, 12);
        assert_eq!(crc, crc32c::crc32c(b"hello world!"));
        assert_eq!(std::fs::read(path).unwrap(), b"hello world!");
    }

    #[test]
    fn test_temp_file_refuses_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("7");
        std::fs::write(&path, b"x").unwrap();
        assert!(TempBlockFile::create(path).is_err());
    }

    #[test]
    fn test_parse_block_file() {
        assert_eq!(
            parse_block_file(Path::new("/a/b/42")),
            Some(BlockId::new(42))
        );
        assert_eq!(parse_block_file(Path::new("/a/b/.tmp")), None);
    }
}
