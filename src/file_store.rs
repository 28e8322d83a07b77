//! A block store persisted in a single file.
//!
//! Block `i` lives in slot `i` of the file. Each slot is the block
//! followed by the little-endian crc32 of its contents. A slot of all
//! zeroes, or one past the end of the file, is a hole.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use fault_injection::{fallible, maybe};
use fnv::FnvHashMap;
use fs2::FileExt as _;
use parking_lot::Mutex;

use crate::block_store::{Block, BlockStore, Fetch};
use crate::{layout::BlockIndex, Error, Result};

const CRC_LEN: usize = 4;

#[cfg(unix)]
mod sys_io {
    use std::io;
    use std::os::unix::fs::FileExt;

    use super::*;

    pub fn read_exact_at<F: FileExt>(
        file: &F,
        buf: &mut [u8],
        offset: u64,
    ) -> io::Result<()> {
        maybe!(file.read_exact_at(buf, offset))
    }

    pub fn write_all_at<F: FileExt>(
        file: &F,
        buf: &[u8],
        offset: u64,
    ) -> io::Result<()> {
        maybe!(file.write_all_at(buf, offset))
    }
}

#[cfg(windows)]
mod sys_io {
    use std::os::windows::fs::FileExt;

    use fault_injection::annotate;

    use super::*;

    pub fn read_exact_at<F: FileExt>(
        file: &F,
        mut buf: &mut [u8],
        mut offset: u64,
    ) -> io::Result<()> {
        while !buf.is_empty() {
            match maybe!(file.seek_read(buf, offset)) {
                Ok(0) => break,
                Ok(n) => {
                    let tmp = buf;
                    buf = &mut tmp[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(annotate!(e)),
            }
        }
        if !buf.is_empty() {
            Err(annotate!(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer"
            )))
        } else {
            Ok(())
        }
    }

    pub fn write_all_at<F: FileExt>(
        file: &F,
        mut buf: &[u8],
        mut offset: u64,
    ) -> io::Result<()> {
        while !buf.is_empty() {
            match maybe!(file.seek_write(buf, offset)) {
                Ok(0) => {
                    return Err(annotate!(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    )));
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(annotate!(e)),
            }
        }
        Ok(())
    }
}

/// A write-back cached block store over one file.
pub struct FileBlockStore {
    path: PathBuf,
    file: fs::File,
    block_size: usize,
    cache: Mutex<FnvHashMap<BlockIndex, Block>>,
    file_dirty: AtomicBool,
}

fn open_locked(path: &Path) -> io::Result<fs::File> {
    let mut opts = fs::OpenOptions::new();
    opts.create(true).read(true).write(true).truncate(false);
    let file = fallible!(opts.open(path));
    fallible!(file.try_lock_exclusive());
    Ok(file)
}

impl fmt::Debug for FileBlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBlockStore")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl FileBlockStore {
    /// Opens or creates the file at `path` and takes an exclusive
    /// lock on it for the lifetime of the store.
    pub fn open<P: AsRef<Path>>(
        path: P,
        block_size: usize,
    ) -> Result<FileBlockStore> {
        let path = path.as_ref();
        log::trace!("opening block store at {:?}", path);

        let file = open_locked(path)?;

        Ok(FileBlockStore {
            path: path.into(),
            file,
            block_size,
            cache: Mutex::new(FnvHashMap::default()),
            file_dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn slot_size(&self) -> u64 {
        (self.block_size + CRC_LEN) as u64
    }

    fn file_len(&self) -> io::Result<u64> {
        Ok(fallible!(self.file.metadata()).len())
    }

    fn read_slot(&self, index: BlockIndex) -> Result<Option<Box<[u8]>>> {
        let whence = index * self.slot_size();
        let len = self.file_len()?;
        if whence + self.slot_size() > len {
            return Ok(None);
        }

        let mut data = vec![0_u8; self.block_size + CRC_LEN];
        sys_io::read_exact_at(&self.file, &mut data, whence)?;

        if data.iter().all(|b| *b == 0) {
            return Ok(None);
        }

        let hash_actual: [u8; 4] =
            crc32fast::hash(&data[..self.block_size]).to_le_bytes();
        let hash_expected = &data[self.block_size..];

        if hash_expected != hash_actual {
            log::error!("crc mismatch reading block {} of {:?}", index, self.path);
            return Err(Error::corruption(format!(
                "crc mismatch in block {} - data corruption detected",
                index
            )));
        }

        data.truncate(self.block_size);
        Ok(Some(data.into_boxed_slice()))
    }

    fn write_slot(&self, index: BlockIndex, block: &[u8]) -> io::Result<()> {
        let mut data = Vec::with_capacity(self.block_size + CRC_LEN);
        data.extend_from_slice(block);
        data.extend_from_slice(&crc32fast::hash(block).to_le_bytes());

        sys_io::write_all_at(&self.file, &data, index * self.slot_size())
    }

    /// Writes every dirty cached block back to the file and fsyncs it.
    /// Returns the number of blocks written.
    pub fn flush(&self) -> Result<usize> {
        let cache = self.cache.lock();
        let mut written = 0;
        let mut indices: Vec<&BlockIndex> = cache.keys().collect();
        indices.sort_unstable();

        for index in indices {
            let block = &cache[index];
            if !block.take_dirty() {
                continue;
            }
            let res = self.write_slot(*index, &block.data());
            if let Err(e) = res {
                // try again on the next flush
                block.set_dirty();
                return Err(e.into());
            }
            written += 1;
        }

        self.sync()?;
        self.file_dirty.store(false, Ordering::Release);
        log::debug!("flushed {} blocks to {:?}", written, self.path);
        Ok(written)
    }

    fn sync(&self) -> io::Result<()> {
        fallible!(self.file.sync_all());
        Ok(())
    }

    /// Whether changes were signalled since the last flush.
    pub fn is_file_dirty(&self) -> bool {
        self.file_dirty.load(Ordering::Acquire)
    }

    /// Drops clean blocks from the cache.
    pub fn evict_clean(&self) {
        self.cache.lock().retain(|_, block| block.is_dirty());
    }
}

impl BlockStore for FileBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn get_block(&self, index: BlockIndex, create: bool) -> Result<Fetch> {
        let mut cache = self.cache.lock();
        if let Some(block) = cache.get(&index) {
            return Ok(Fetch::Found(block.clone()));
        }

        let block = match self.read_slot(index)? {
            Some(data) => Block::from_bytes(index, data),
            None if create => {
                let block = Block::new(index, self.block_size);
                // a materialized block must reach the disk even if
                // it stays all-clean
                block.set_dirty();
                block
            }
            None => return Ok(Fetch::Hole),
        };

        cache.insert(index, block.clone());
        Ok(Fetch::Found(block))
    }

    fn delete_block(&self, index: BlockIndex) -> Result<()> {
        let mut cache = self.cache.lock();
        cache.remove(&index);

        let whence = index * self.slot_size();
        if whence < self.file_len()? {
            let zeroes = vec![0_u8; self.block_size + CRC_LEN];
            sys_io::write_all_at(&self.file, &zeroes, whence)?;
        }
        Ok(())
    }

    fn mark_file_dirty(&self) {
        self.file_dirty.store(true, Ordering::Release);
    }
}
