//! The metadata block store that the segment usage file is layered on.
//!
//! A store resolves a block index to an in-memory block, creating it on
//! request. A missing block is a hole: reading it without permission to
//! create yields `Fetch::Hole` instead of an error, and hole blocks are
//! understood to hold nothing but clean entries.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::{layout::BlockIndex, Result};

/// An owning handle to a cached metadata block.
///
/// Dropping the last handle outside of the store releases the block;
/// the store keeps its own handle for as long as it caches the block.
#[derive(Clone)]
pub struct Block {
    inner: Arc<BlockInner>,
}

struct BlockInner {
    index: BlockIndex,
    dirty: AtomicBool,
    data: Mutex<Box<[u8]>>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("index", &self.inner.index)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

impl Block {
    /// A zero-filled block.
    pub fn new(index: BlockIndex, block_size: usize) -> Block {
        Block::from_bytes(index, vec![0; block_size].into_boxed_slice())
    }

    pub fn from_bytes(index: BlockIndex, data: Box<[u8]>) -> Block {
        Block {
            inner: Arc::new(BlockInner {
                index,
                dirty: AtomicBool::new(false),
                data: Mutex::new(data),
            }),
        }
    }

    pub fn index(&self) -> BlockIndex {
        self.inner.index
    }

    /// Locks the block contents.
    pub fn data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.inner.data.lock()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self) {
        self.inner.dirty.store(true, Ordering::Release);
    }

    /// Clears the dirty bit, returning whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.inner.dirty.swap(false, Ordering::AcqRel)
    }

    /// Whether every byte of the block is zero.
    pub fn is_zeroed(&self) -> bool {
        self.data().iter().all(|b| *b == 0)
    }
}

/// The result of looking up a block.
#[derive(Debug)]
pub enum Fetch {
    Found(Block),
    /// The block is not materialized and creation was not requested.
    Hole,
}

impl Fetch {
    pub fn found(self) -> Option<Block> {
        match self {
            Fetch::Found(block) => Some(block),
            Fetch::Hole => None,
        }
    }
}

/// Block-granular access to the backing metadata file.
pub trait BlockStore: Send + Sync {
    fn block_size(&self) -> usize;

    /// Resolves `index`, materializing a zeroed block if it is a hole
    /// and `create` is set.
    fn get_block(&self, index: BlockIndex, create: bool) -> Result<Fetch>;

    /// Turns the block back into a hole.
    fn delete_block(&self, index: BlockIndex) -> Result<()>;

    /// Schedules the block for write-back.
    fn mark_dirty(&self, block: &Block) {
        block.set_dirty();
    }

    /// Signals that the file as a whole has pending changes.
    fn mark_file_dirty(&self);
}

/// A block store that only lives in memory.
#[derive(Default)]
pub struct MemBlockStore {
    block_size: usize,
    blocks: Mutex<FnvHashMap<BlockIndex, Block>>,
    file_dirty: AtomicBool,
    fetches: AtomicU64,
}

impl fmt::Debug for MemBlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBlockStore")
            .field("block_size", &self.block_size)
            .field("blocks", &self.blocks.lock().len())
            .finish()
    }
}

impl MemBlockStore {
    pub fn new(block_size: usize) -> MemBlockStore {
        MemBlockStore { block_size, ..Default::default() }
    }

    pub fn contains(&self, index: BlockIndex) -> bool {
        self.blocks.lock().contains_key(&index)
    }

    /// Indices of all materialized blocks, in ascending order.
    pub fn block_indices(&self) -> Vec<BlockIndex> {
        let mut ret: Vec<BlockIndex> =
            self.blocks.lock().keys().copied().collect();
        ret.sort_unstable();
        ret
    }

    /// Returns and resets the whole-file dirty signal.
    pub fn take_file_dirty(&self) -> bool {
        self.file_dirty.swap(false, Ordering::AcqRel)
    }

    /// Number of `get_block` calls served so far.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Acquire)
    }
}

impl BlockStore for MemBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn get_block(&self, index: BlockIndex, create: bool) -> Result<Fetch> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let mut blocks = self.blocks.lock();
        if let Some(block) = blocks.get(&index) {
            return Ok(Fetch::Found(block.clone()));
        }
        if !create {
            return Ok(Fetch::Hole);
        }
        log::trace!("materializing block {}", index);
        let block = Block::new(index, self.block_size);
        blocks.insert(index, block.clone());
        Ok(Fetch::Found(block))
    }

    fn delete_block(&self, index: BlockIndex) -> Result<()> {
        log::trace!("punching hole at block {}", index);
        self.blocks.lock().remove(&index);
        Ok(())
    }

    fn mark_file_dirty(&self) {
        self.file_dirty.store(true, Ordering::Release);
    }
}

impl<S: BlockStore + ?Sized> BlockStore for Arc<S> {
    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn get_block(&self, index: BlockIndex, create: bool) -> Result<Fetch> {
        (**self).get_block(index, create)
    }

    fn delete_block(&self, index: BlockIndex) -> Result<()> {
        (**self).delete_block(index)
    }

    fn mark_dirty(&self, block: &Block) {
        (**self).mark_dirty(block)
    }

    fn mark_file_dirty(&self) {
        (**self).mark_file_dirty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holes_are_not_created_without_permission() {
        let store = MemBlockStore::new(64);
        assert!(matches!(store.get_block(3, false).unwrap(), Fetch::Hole));
        assert!(!store.contains(3));

        let block = store.get_block(3, true).unwrap().found().unwrap();
        assert_eq!(block.index(), 3);
        assert!(block.is_zeroed());
        assert!(store.contains(3));
    }

    #[test]
    fn handles_share_contents() {
        let store = MemBlockStore::new(64);
        let a = store.get_block(0, true).unwrap().found().unwrap();
        a.data()[5] = 9;
        store.mark_dirty(&a);
        drop(a);

        let b = store.get_block(0, false).unwrap().found().unwrap();
        assert_eq!(b.data()[5], 9);
        assert!(b.take_dirty());
        assert!(!b.is_dirty());
    }

    #[test]
    fn delete_restores_hole() {
        let store = MemBlockStore::new(64);
        store.get_block(1, true).unwrap();
        store.get_block(4, true).unwrap();
        assert_eq!(store.block_indices(), vec![1, 4]);
        store.delete_block(1).unwrap();
        assert_eq!(store.block_indices(), vec![4]);
        assert!(matches!(store.get_block(1, false).unwrap(), Fetch::Hole));
    }
}
