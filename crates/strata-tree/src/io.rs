//! Block-level file I/O and the node cache.
//!
//! Every history tree owns exactly one `BlockIo`. It maps node sequence
//! numbers to byte offsets, reads and writes whole blocks, and keeps a small
//! direct-mapped cache of deserialized nodes. A single mutex serializes file
//! positioning, block transfer, and cache-slot updates; reader/writer
//! contention is rare because queries mostly touch closed subtrees.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use strata_common::{Result, StrataError};

use crate::node::HtNode;
use crate::tree::TREE_HEADER_SIZE;

/// Number of cache slots. Must be a power of two.
const CACHE_SIZE: usize = 256;
const CACHE_MASK: usize = CACHE_SIZE - 1;

/// File handle and node cache for one history file.
#[derive(Debug)]
pub struct BlockIo {
    state_file: PathBuf,
    block_size: usize,
    max_children: usize,
    inner: Mutex<IoState>,
}

#[derive(Debug)]
struct IoState {
    /// `None` once the file has been closed; reads then surface `Disposed`.
    file: Option<File>,
    /// Direct-mapped cache indexed by `seq & CACHE_MASK`. Evicted entries
    /// are dropped without writeback: persisted nodes are immutable.
    cache: Vec<Option<Arc<HtNode>>>,
}

impl BlockIo {
    /// Creates a fresh history file, truncating any existing one.
    pub fn create(state_file: &Path, block_size: usize, max_children: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(state_file)?;
        Ok(Self::with_file(state_file, block_size, max_children, file))
    }

    /// Opens an existing history file without touching its content.
    pub fn open(state_file: &Path, block_size: usize, max_children: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(state_file)?;
        Ok(Self::with_file(state_file, block_size, max_children, file))
    }

    fn with_file(state_file: &Path, block_size: usize, max_children: usize, file: File) -> Self {
        Self {
            state_file: state_file.to_path_buf(),
            block_size,
            max_children,
            inner: Mutex::new(IoState {
                file: Some(file),
                cache: vec![None; CACHE_SIZE],
            }),
        }
    }

    /// Byte offset of the block holding node `seq`.
    fn node_offset(&self, seq: i32) -> u64 {
        TREE_HEADER_SIZE as u64 + seq as u64 * self.block_size as u64
    }

    /// Reads the node with the given sequence number.
    ///
    /// Consults the cache first; on a miss, reads exactly one block from the
    /// file and installs the node in its slot, dropping whatever occupied
    /// it. A short read means the file does not contain the block it claims
    /// to and is reported as corruption. Reading after the file was closed
    /// surfaces the disposed error.
    pub fn read_node(&self, seq: i32) -> Result<Arc<HtNode>> {
        let mut state = self.inner.lock();

        let slot = seq as usize & CACHE_MASK;
        if let Some(cached) = &state.cache[slot] {
            if cached.seq_number() == seq {
                return Ok(Arc::clone(cached));
            }
        }

        let file = state.file.as_mut().ok_or(StrataError::Disposed)?;
        file.seek(SeekFrom::Start(self.node_offset(seq)))?;
        let mut block = vec![0u8; self.block_size];
        file.read_exact(&mut block).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                StrataError::Corruption(format!("short read for node {}", seq))
            } else {
                StrataError::Io(e)
            }
        })?;

        let node = Arc::new(HtNode::read_block(
            self.block_size,
            self.max_children,
            &block,
        )?);
        state.cache[slot] = Some(Arc::clone(&node));
        Ok(node)
    }

    /// Writes a node to its block, replacing the cache slot occupant.
    ///
    /// Write errors are logged and swallowed: the in-memory node stays
    /// authoritative, and the final header write at close time decides
    /// whether the file is usable.
    pub fn write_node(&self, node: &Arc<HtNode>) {
        let mut state = self.inner.lock();

        let seq = node.seq_number();
        let slot = seq as usize & CACHE_MASK;
        state.cache[slot] = Some(Arc::clone(node));

        let Some(file) = state.file.as_mut() else {
            error!(seq, "dropping node write: history file already closed");
            return;
        };
        let block = node.write_block();
        let result = file
            .seek(SeekFrom::Start(self.node_offset(seq)))
            .and_then(|_| file.write_all(&block));
        match result {
            Ok(()) => node.mark_on_disk(),
            Err(e) => error!(seq, error = %e, "failed to write node block"),
        }
    }

    /// Writes the tree header block at the start of the file.
    pub fn write_header(&self, header: &[u8]) -> Result<()> {
        debug_assert_eq!(header.len(), TREE_HEADER_SIZE);
        let mut state = self.inner.lock();
        let file = state.file.as_mut().ok_or(StrataError::Disposed)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(header)?;
        file.sync_all()?;
        Ok(())
    }

    /// Returns a duplicated handle positioned at `offset`, for the
    /// attribute-tree section that follows the last block.
    pub fn supply_at_reader(&self, offset: u64) -> Result<File> {
        let state = self.inner.lock();
        let file = state.file.as_ref().ok_or(StrataError::Disposed)?;
        let mut reader = file.try_clone()?;
        reader.seek(SeekFrom::Start(offset))?;
        Ok(reader)
    }

    /// Current size of the history file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        let state = self.inner.lock();
        let file = state.file.as_ref().ok_or(StrataError::Disposed)?;
        Ok(file.metadata()?.len())
    }

    /// Flushes and closes the file. Further reads fail with `Disposed`.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        if let Some(file) = state.file.take() {
            if let Err(e) = file.sync_all() {
                error!(error = %e, "failed to sync history file on close");
            }
        }
        debug!(file = %self.state_file.display(), "history file closed");
    }

    /// Closes and deletes the history file.
    pub fn delete_file(&self) {
        self.close();
        if let Err(e) = std::fs::remove_file(&self.state_file) {
            if e.kind() != ErrorKind::NotFound {
                error!(
                    file = %self.state_file.display(),
                    error = %e,
                    "failed to delete history file"
                );
            }
        }
    }
}
