//! Block I/O over the backing file.
//!
//! The store sees its backing as an array of fixed-size 256-byte blocks.
//! This trait allows the engine to work with different backends:
//! - A real file (with an advisory exclusive lock held while open)
//! - In-memory (for testing)
//!
//! The backing only ever grows, and only through `append_blocks`; reads and
//! writes beyond the current extent are errors, never silent zero-fills.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

use fs2::FileExt;

/// Size of one block in bytes. Every record occupies exactly one block.
pub const BLOCK_SIZE: usize = 256;

/// One raw block.
pub type Block = [u8; BLOCK_SIZE];

/// Errors from the block layer
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("block index {index} beyond file extent ({count} blocks)")]
    OutOfBounds { index: u32, count: u32 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fixed-size random-access reads and writes over a growable backing.
pub trait BlockIo {
    /// Read the block at `index`.
    fn read_block(&mut self, index: u32) -> Result<Block, IoError>;

    /// Overwrite the block at `index`. The block must already exist.
    fn write_block(&mut self, index: u32, block: &Block) -> Result<(), IoError>;

    /// Number of blocks currently in the backing.
    fn block_count(&self) -> u32;

    /// Grow the backing by appending `blocks` at the end.
    fn append_blocks(&mut self, blocks: &[Block]) -> Result<(), IoError>;

    /// Flush pending writes to stable storage.
    fn flush(&mut self) -> Result<(), IoError>;
}

/// File-backed blocks.
///
/// `open` takes a process-wide advisory exclusive lock on the file, so two
/// store handles (or two processes) can never mutate the same backing
/// concurrently. The lock is released when the handle is dropped.
pub struct FileBlockIo {
    file: File,
    count: u32,
}

impl FileBlockIo {
    /// Open (or create) the backing file and lock it exclusively.
    pub fn open(path: &Path) -> Result<Self, IoError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.lock_exclusive()?;

        let len = file.metadata()?.len();
        let count = (len / BLOCK_SIZE as u64) as u32;
        Ok(Self { file, count })
    }

    fn seek_to(&mut self, index: u32) -> Result<(), IoError> {
        self.file
            .seek(SeekFrom::Start(index as u64 * BLOCK_SIZE as u64))?;
        Ok(())
    }

    fn check_bounds(&self, index: u32) -> Result<(), IoError> {
        if index >= self.count {
            return Err(IoError::OutOfBounds {
                index,
                count: self.count,
            });
        }
        Ok(())
    }
}

impl BlockIo for FileBlockIo {
    fn read_block(&mut self, index: u32) -> Result<Block, IoError> {
        self.check_bounds(index)?;
        self.seek_to(index)?;
        let mut block = [0u8; BLOCK_SIZE];
        self.file.read_exact(&mut block)?;
        Ok(block)
    }

    fn write_block(&mut self, index: u32, block: &Block) -> Result<(), IoError> {
        self.check_bounds(index)?;
        self.seek_to(index)?;
        self.file.write_all(block)?;
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.count
    }

    fn append_blocks(&mut self, blocks: &[Block]) -> Result<(), IoError> {
        self.file.seek(SeekFrom::End(0))?;
        for block in blocks {
            self.file.write_all(block)?;
        }
        self.count += blocks.len() as u32;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), IoError> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for FileBlockIo {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// In-memory blocks for testing.
/// Uses Rc<RefCell<...>> so clones share the same underlying storage.
#[derive(Default, Clone)]
pub struct MemBlockIo {
    blocks: Rc<RefCell<Vec<Block>>>,
    /// Write counter (for testing write discipline)
    write_count: Rc<RefCell<usize>>,
}

impl MemBlockIo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `write_block` calls so far (for testing)
    #[must_use]
    pub fn write_count(&self) -> usize {
        *self.write_count.borrow()
    }

    /// Reset the write counter (for testing)
    pub fn reset_write_count(&self) {
        *self.write_count.borrow_mut() = 0;
    }

    /// Raw copy of a block, bypassing the store (for corruption tests)
    #[must_use]
    pub fn raw_block(&self, index: u32) -> Option<Block> {
        self.blocks.borrow().get(index as usize).copied()
    }

    /// Raw overwrite of a block, bypassing the store (for corruption tests)
    pub fn corrupt_block(&self, index: u32, block: &Block) {
        if let Some(slot) = self.blocks.borrow_mut().get_mut(index as usize) {
            *slot = *block;
        }
    }
}

impl BlockIo for MemBlockIo {
    fn read_block(&mut self, index: u32) -> Result<Block, IoError> {
        self.blocks
            .borrow()
            .get(index as usize)
            .copied()
            .ok_or(IoError::OutOfBounds {
                index,
                count: self.block_count(),
            })
    }

    fn write_block(&mut self, index: u32, block: &Block) -> Result<(), IoError> {
        let mut blocks = self.blocks.borrow_mut();
        let count = blocks.len() as u32;
        match blocks.get_mut(index as usize) {
            Some(slot) => {
                *slot = *block;
                *self.write_count.borrow_mut() += 1;
                Ok(())
            }
            None => Err(IoError::OutOfBounds { index, count }),
        }
    }

    fn block_count(&self) -> u32 {
        self.blocks.borrow().len() as u32
    }

    fn append_blocks(&mut self, blocks: &[Block]) -> Result<(), IoError> {
        self.blocks.borrow_mut().extend_from_slice(blocks);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), IoError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_read_write() {
        let mut io = MemBlockIo::new();
        io.append_blocks(&[[0u8; BLOCK_SIZE]; 2]).unwrap();

        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xAB;
        block[255] = 0xCD;
        io.write_block(1, &block).unwrap();

        let read = io.read_block(1).unwrap();
        assert_eq!(read[0], 0xAB);
        assert_eq!(read[255], 0xCD);
        assert_eq!(io.read_block(0).unwrap(), [0u8; BLOCK_SIZE]);
    }

    #[test]
    fn test_mem_out_of_bounds() {
        let mut io = MemBlockIo::new();
        io.append_blocks(&[[0u8; BLOCK_SIZE]; 3]).unwrap();

        assert!(matches!(
            io.read_block(3),
            Err(IoError::OutOfBounds { index: 3, count: 3 })
        ));
        assert!(matches!(
            io.write_block(10, &[0u8; BLOCK_SIZE]),
            Err(IoError::OutOfBounds { index: 10, .. })
        ));
    }

    #[test]
    fn test_mem_growth() {
        let mut io = MemBlockIo::new();
        assert_eq!(io.block_count(), 0);

        io.append_blocks(&[[1u8; BLOCK_SIZE]; 32]).unwrap();
        assert_eq!(io.block_count(), 32);
        assert_eq!(io.read_block(31).unwrap(), [1u8; BLOCK_SIZE]);
    }

    #[test]
    fn test_mem_clones_share_storage() {
        let mut io = MemBlockIo::new();
        io.append_blocks(&[[0u8; BLOCK_SIZE]]).unwrap();

        let clone = io.clone();
        io.write_block(0, &[9u8; BLOCK_SIZE]).unwrap();
        assert_eq!(clone.raw_block(0).unwrap(), [9u8; BLOCK_SIZE]);
    }

    #[test]
    fn test_file_block_io_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");

        {
            let mut io = FileBlockIo::open(&path).unwrap();
            assert_eq!(io.block_count(), 0);
            io.append_blocks(&[[7u8; BLOCK_SIZE]; 2]).unwrap();
            io.write_block(1, &[8u8; BLOCK_SIZE]).unwrap();
            io.flush().unwrap();
        }

        let mut io = FileBlockIo::open(&path).unwrap();
        assert_eq!(io.block_count(), 2);
        assert_eq!(io.read_block(0).unwrap(), [7u8; BLOCK_SIZE]);
        assert_eq!(io.read_block(1).unwrap(), [8u8; BLOCK_SIZE]);
        assert!(io.read_block(2).is_err());
    }
}
