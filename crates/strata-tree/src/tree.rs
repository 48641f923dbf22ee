//! The history tree: growth, insertion, and query descent.
//!
//! The tree is temporally layered. Every node covers a contiguous time
//! range; children of a core node cover non-overlapping, adjacent
//! sub-ranges ordered by creation time. One branch (the latest branch) runs
//! from the root to the open leaf currently receiving intervals; every node
//! off that branch has been closed and written to its block.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use tracing::debug;

use strata_common::{HtConfig, Result, StateInterval, StrataError, MAX_INTERVAL_SIZE};

use crate::io::BlockIo;
use crate::node::{core_header_size, HtNode, COMMON_HEADER_SIZE};

/// Size of the fixed header block preceding all node blocks.
pub const TREE_HEADER_SIZE: usize = 4096;

/// Magic number identifying a Strata history file.
const FILE_MAGIC: u32 = 0x5354_5241;

/// On-disk format version.
pub const FILE_VERSION: u32 = 1;

/// A time-ordered tree of interval blocks backed by one history file.
///
/// Single-writer: one thread inserts intervals and mutates the latest
/// branch; any number of threads may run queries concurrently.
#[derive(Debug)]
pub struct HistoryTree {
    config: HtConfig,
    io: BlockIo,
    /// Total nodes created so far; also the next sequence number.
    node_count: AtomicI32,
    /// Maximum end time observed, bumped on every insert and at close.
    tree_end: AtomicI64,
    /// Open nodes from the root down to the current leaf.
    latest_branch: RwLock<Vec<Arc<HtNode>>>,
}

impl HistoryTree {
    /// Creates a new, empty history tree and its backing file.
    pub fn new(config: HtConfig) -> Result<Self> {
        config.validate()?;
        check_block_size(&config)?;

        let io = BlockIo::create(&config.state_file, config.block_size, config.max_children)?;
        let root = Arc::new(HtNode::new_leaf(
            config.block_size,
            config.max_children,
            0,
            -1,
            config.start_time,
        ));
        let start_time = config.start_time;
        Ok(Self {
            config,
            io,
            node_count: AtomicI32::new(1),
            tree_end: AtomicI64::new(start_time),
            latest_branch: RwLock::new(vec![root]),
        })
    }

    /// Opens an existing history file.
    ///
    /// Fails with a corruption error if the magic number, file version, or
    /// provider version do not match.
    pub fn open(state_file: &Path, provider_version: u32) -> Result<Self> {
        // The block size is not known until the header has been parsed, so
        // read it with a plain handle before constructing the block I/O.
        let mut file = File::open(state_file)?;
        let mut header = vec![0u8; TREE_HEADER_SIZE];
        file.read_exact(&mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                StrataError::Corruption("history file too short for its header".to_string())
            } else {
                StrataError::Io(e)
            }
        })?;
        drop(file);

        let mut buf = &header[..];
        let magic = buf.get_u32_le();
        if magic != FILE_MAGIC {
            return Err(StrataError::Corruption(format!(
                "bad magic number: {:#010x}",
                magic
            )));
        }
        let file_version = buf.get_u32_le();
        if file_version != FILE_VERSION {
            return Err(StrataError::Corruption(format!(
                "unsupported file version {} (expected {})",
                file_version, FILE_VERSION
            )));
        }
        let stored_provider = buf.get_u32_le();
        if stored_provider != provider_version {
            return Err(StrataError::Corruption(format!(
                "provider version mismatch: file has {}, expected {}",
                stored_provider, provider_version
            )));
        }
        let block_size = buf.get_u32_le() as usize;
        let max_children = buf.get_u32_le() as usize;
        let node_count = buf.get_u32_le() as i32;
        let root_seq = buf.get_i32_le();
        let tree_start = buf.get_i64_le();
        let tree_end = buf.get_i64_le();
        let _at_offset = buf.get_i64_le();

        let config = HtConfig {
            state_file: state_file.to_path_buf(),
            block_size,
            max_children,
            provider_version,
            start_time: tree_start,
        };
        config.validate().map_err(|e| {
            StrataError::Corruption(format!("implausible header geometry: {}", e))
        })?;
        check_block_size(&config).map_err(|e| {
            StrataError::Corruption(format!("implausible header geometry: {}", e))
        })?;

        let io = BlockIo::open(state_file, block_size, max_children)?;
        let tree = Self {
            config,
            io,
            node_count: AtomicI32::new(node_count),
            tree_end: AtomicI64::new(tree_end),
            latest_branch: RwLock::new(Vec::new()),
        };
        tree.rebuild_latest_branch(root_seq)?;
        debug!(
            file = %state_file.display(),
            node_count,
            "opened existing history tree"
        );
        Ok(tree)
    }

    /// Rebuilds the latest branch by descending the newest child from the
    /// root. Used when reopening a finished tree.
    fn rebuild_latest_branch(&self, root_seq: i32) -> Result<()> {
        let mut branch = Vec::new();
        let mut node = self.io.read_node(root_seq)?;
        branch.push(Arc::clone(&node));
        while let Some(child_seq) = node.latest_child_seq() {
            node = self.io.read_node(child_seq)?;
            branch.push(Arc::clone(&node));
        }
        *self.latest_branch.write() = branch;
        Ok(())
    }

    /// The tree's configuration.
    pub fn config(&self) -> &HtConfig {
        &self.config
    }

    /// Earliest timestamp this tree covers.
    pub fn tree_start(&self) -> i64 {
        self.config.start_time
    }

    /// Latest timestamp this tree covers so far.
    pub fn tree_end(&self) -> i64 {
        self.tree_end.load(Ordering::Acquire)
    }

    /// Number of nodes created.
    pub fn node_count(&self) -> i32 {
        self.node_count.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Inserts an interval at the latest branch.
    pub fn insert_interval(&self, interval: StateInterval) -> Result<()> {
        if interval.start() < self.config.start_time {
            return Err(StrataError::TimeRange {
                t: interval.start(),
                start: self.config.start_time,
                end: i64::MAX,
            });
        }
        let mut branch = self.latest_branch.write();
        let index = branch.len() - 1;
        self.try_insert_at(&mut branch, index, interval);
        Ok(())
    }

    /// Tries to append the interval to `branch[index]`, growing the tree or
    /// walking up the branch as needed.
    fn try_insert_at(&self, branch: &mut Vec<Arc<HtNode>>, index: usize, interval: StateInterval) {
        let target = Arc::clone(&branch[index]);

        if interval.size_on_disk() > target.free_space() {
            // No room here; open a new sibling branch and restart at its leaf.
            self.add_sibling_branch(branch, index);
            let leaf = branch.len() - 1;
            self.try_insert_at(branch, leaf, interval);
            return;
        }
        if interval.start() < target.node_start() && index > 0 {
            // The interval started before this node did; it belongs to an
            // ancestor whose range reaches further back.
            self.try_insert_at(branch, index - 1, interval);
            return;
        }

        let end = interval.end();
        target.add_interval(interval);
        self.tree_end.fetch_max(end, Ordering::AcqRel);
    }

    /// Closes the full node at `index` (and everything below it on the
    /// latest branch) and opens a fresh sibling sub-branch in its place.
    /// Recurses upward when the parent is already at `max_children`; at the
    /// root, grows the tree one level instead.
    fn add_sibling_branch(&self, branch: &mut Vec<Arc<HtNode>>, index: usize) {
        if index == 0 {
            self.add_new_root(branch);
            return;
        }
        if branch[index - 1].child_count() == self.config.max_children {
            self.add_sibling_branch(branch, index - 1);
            return;
        }

        let split_time = self.tree_end.load(Ordering::Acquire);
        for node in branch[index..].iter().rev() {
            node.close(split_time);
            self.io.write_node(node);
        }

        let depth = branch.len();
        for i in index..depth {
            let parent_seq = branch[i - 1].seq_number();
            let new_node = if i == depth - 1 {
                self.new_leaf(parent_seq, split_time + 1)
            } else {
                self.new_core(parent_seq, split_time + 1)
            };
            branch[i - 1].link_new_child(&new_node);
            branch[i] = new_node;
        }
    }

    /// Allocates a new root one level above the current one. The old root
    /// becomes the new root's first child and a fresh chain of core nodes
    /// plus a leaf is opened beneath it.
    fn add_new_root(&self, branch: &mut Vec<Arc<HtNode>>) {
        let split_time = self.tree_end.load(Ordering::Acquire);

        let old_root = Arc::clone(&branch[0]);
        let new_root = self.new_core(-1, self.config.start_time);
        old_root.set_parent_seq(new_root.seq_number());

        for node in branch.iter().rev() {
            node.close(split_time);
            self.io.write_node(node);
        }
        new_root.link_new_child(&old_root);

        let depth = branch.len();
        branch.clear();
        branch.push(new_root);
        for i in 1..depth {
            let parent_seq = branch[i - 1].seq_number();
            let core = self.new_core(parent_seq, split_time + 1);
            branch[i - 1].link_new_child(&core);
            branch.push(core);
        }
        let leaf = self.new_leaf(branch[depth - 1].seq_number(), split_time + 1);
        branch[depth - 1].link_new_child(&leaf);
        branch.push(leaf);
    }

    fn new_core(&self, parent_seq: i32, start: i64) -> Arc<HtNode> {
        let seq = self.node_count.fetch_add(1, Ordering::AcqRel);
        Arc::new(HtNode::new_core(
            self.config.block_size,
            self.config.max_children,
            seq,
            parent_seq,
            start,
        ))
    }

    fn new_leaf(&self, parent_seq: i32, start: i64) -> Arc<HtNode> {
        let seq = self.node_count.fetch_add(1, Ordering::AcqRel);
        Arc::new(HtNode::new_leaf(
            self.config.block_size,
            self.config.max_children,
            seq,
            parent_seq,
            start,
        ))
    }

    // ------------------------------------------------------------------
    // Final close
    // ------------------------------------------------------------------

    /// Closes the whole tree at `requested_end` (clamped to the maximum
    /// interval end observed) and writes the file header.
    pub fn close_tree(&self, requested_end: i64) -> Result<()> {
        let branch = self.latest_branch.write();
        let end = requested_end.max(self.tree_end.load(Ordering::Acquire));
        self.tree_end.store(end, Ordering::Release);

        for node in branch.iter() {
            node.close(end);
            self.io.write_node(node);
        }
        self.write_header(branch[0].seq_number())?;
        debug!(
            node_count = self.node_count(),
            tree_end = end,
            "history tree closed"
        );
        Ok(())
    }

    /// Serializes and writes the tree header block.
    ///
    /// Layout (little-endian): magic u32, file version u32, provider
    /// version u32, block size u32, max children u32, node count u32, root
    /// sequence i32, tree start i64, tree end i64, attribute-tree offset
    /// i64; zero-padded to `TREE_HEADER_SIZE`.
    fn write_header(&self, root_seq: i32) -> Result<()> {
        let mut buf = BytesMut::with_capacity(TREE_HEADER_SIZE);
        buf.put_u32_le(FILE_MAGIC);
        buf.put_u32_le(FILE_VERSION);
        buf.put_u32_le(self.config.provider_version);
        buf.put_u32_le(self.config.block_size as u32);
        buf.put_u32_le(self.config.max_children as u32);
        buf.put_u32_le(self.node_count() as u32);
        buf.put_i32_le(root_seq);
        buf.put_i64_le(self.config.start_time);
        buf.put_i64_le(self.tree_end());
        buf.put_i64_le(self.at_offset() as i64);
        buf.resize(TREE_HEADER_SIZE, 0);
        self.io.write_header(&buf)
    }

    // ------------------------------------------------------------------
    // Query descent
    // ------------------------------------------------------------------

    /// The current root node; entry point of every descent.
    pub fn root_node(&self) -> Result<Arc<HtNode>> {
        self.latest_branch
            .read()
            .first()
            .cloned()
            .ok_or_else(|| StrataError::Corruption("history tree has no root".to_string()))
    }

    /// Reads a node, preferring the open nodes on the latest branch over
    /// the cache and the file.
    pub fn read_node(&self, seq: i32) -> Result<Arc<HtNode>> {
        {
            let branch = self.latest_branch.read();
            for node in branch.iter() {
                if node.seq_number() == seq {
                    return Ok(Arc::clone(node));
                }
            }
        }
        self.io.read_node(seq)
    }

    /// Follows the descent one level: the unique child of `node` whose
    /// sub-range contains `t`.
    pub fn select_next_child(&self, node: &HtNode, t: i64) -> Result<Arc<HtNode>> {
        match node.select_child_for(t) {
            Some(seq) => self.read_node(seq),
            None => Err(StrataError::Corruption(format!(
                "no child of node {} covers timestamp {}",
                node.seq_number(),
                t
            ))),
        }
    }

    // ------------------------------------------------------------------
    // File plumbing
    // ------------------------------------------------------------------

    /// Byte offset where the attribute-tree section begins: right after the
    /// last node block.
    fn at_offset(&self) -> u64 {
        TREE_HEADER_SIZE as u64 + self.node_count() as u64 * self.config.block_size as u64
    }

    /// A handle positioned at the attribute-tree section, for reading the
    /// opaque blob the surrounding state system stores there.
    pub fn supply_at_reader(&self) -> Result<File> {
        self.io.supply_at_reader(self.at_offset())
    }

    /// The file the attribute-tree writer should append to.
    pub fn at_writer_file(&self) -> &Path {
        &self.config.state_file
    }

    /// The position the attribute-tree writer should seek to.
    pub fn at_writer_file_pos(&self) -> i64 {
        self.at_offset() as i64
    }

    /// Current size of the history file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        self.io.file_size()
    }

    /// Average fill ratio of all nodes, in percent.
    pub fn average_node_usage(&self) -> Result<f64> {
        let count = self.node_count();
        let mut used: u64 = 0;
        for seq in 0..count {
            let node = self.read_node(seq)?;
            used += (self.config.block_size - node.free_space()) as u64;
        }
        let percentage =
            100.0 * used as f64 / (count as u64 * self.config.block_size as u64) as f64;
        debug_assert!((0.0..=100.0).contains(&percentage));
        Ok(percentage)
    }

    /// Flushes and closes the backing file.
    pub fn close_file(&self) {
        self.io.close();
    }

    /// Deletes the backing file.
    pub fn delete_file(&self) {
        self.io.delete_file();
    }
}

/// A block must hold one maximum-size interval on top of the larger
/// (core) variant header.
fn check_block_size(config: &HtConfig) -> Result<()> {
    let min_block =
        COMMON_HEADER_SIZE + core_header_size(config.max_children) + MAX_INTERVAL_SIZE;
    if config.block_size < min_block {
        return Err(StrataError::Config(format!(
            "block_size {} cannot hold a maximum-size interval; need at least {}",
            config.block_size, min_block
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::StateValue;
    use tempfile::TempDir;

    // The smallest tidy block that can hold one maximum-size interval plus
    // the core header at max_children = 2.
    const TEST_BLOCK: usize = 17 * 4096;

    fn test_config(dir: &TempDir) -> HtConfig {
        HtConfig {
            state_file: dir.path().join("test.ht"),
            block_size: TEST_BLOCK,
            max_children: 2,
            provider_version: 7,
            start_time: 0,
        }
    }

    fn small_iv(start: i64, end: i64, quark: i32) -> StateInterval {
        StateInterval::new(start, end, quark, StateValue::Long(end)).unwrap()
    }

    /// An interval large enough that only one fits per block.
    fn big_iv(start: i64, end: i64, quark: i32) -> StateInterval {
        StateInterval::new(start, end, quark, StateValue::Str("x".repeat(40_000))).unwrap()
    }

    /// Descends from the root looking for the interval at (quark, t).
    fn query(tree: &HistoryTree, quark: i32, t: i64) -> Option<StateInterval> {
        let mut node = tree.root_node().unwrap();
        loop {
            if let Some(found) = node.relevant_interval(quark, t) {
                return Some(found);
            }
            if node.is_leaf() {
                return None;
            }
            node = tree.select_next_child(&node, t).unwrap();
        }
    }

    #[test]
    fn test_new_tree_single_leaf_root() {
        let dir = TempDir::new().unwrap();
        let tree = HistoryTree::new(test_config(&dir)).unwrap();

        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.tree_start(), 0);
        assert_eq!(tree.tree_end(), 0);
        let root = tree.root_node().unwrap();
        assert!(root.is_leaf());
        assert_eq!(root.seq_number(), 0);
        assert_eq!(root.parent_seq(), -1);
    }

    #[test]
    fn test_rejects_block_too_small_for_interval() {
        let dir = TempDir::new().unwrap();
        let config = HtConfig {
            block_size: 16 * 1024,
            ..test_config(&dir)
        };
        assert!(matches!(
            HistoryTree::new(config),
            Err(StrataError::Config(_))
        ));
    }

    #[test]
    fn test_insert_updates_tree_end() {
        let dir = TempDir::new().unwrap();
        let tree = HistoryTree::new(test_config(&dir)).unwrap();

        tree.insert_interval(small_iv(0, 100, 0)).unwrap();
        assert_eq!(tree.tree_end(), 100);
        tree.insert_interval(small_iv(0, 50, 1)).unwrap();
        assert_eq!(tree.tree_end(), 100);
    }

    #[test]
    fn test_insert_before_tree_start_rejected() {
        let dir = TempDir::new().unwrap();
        let config = HtConfig {
            start_time: 1000,
            ..test_config(&dir)
        };
        let tree = HistoryTree::new(config).unwrap();
        let err = tree.insert_interval(small_iv(999, 2000, 0)).unwrap_err();
        assert!(matches!(err, StrataError::TimeRange { .. }));
    }

    #[test]
    fn test_sibling_split_grows_tree() {
        let dir = TempDir::new().unwrap();
        let tree = HistoryTree::new(test_config(&dir)).unwrap();

        // Only one big interval fits per leaf, so the second insert must
        // close the root leaf and grow a core root above it.
        tree.insert_interval(big_iv(0, 10, 0)).unwrap();
        assert_eq!(tree.node_count(), 1);
        tree.insert_interval(big_iv(11, 20, 0)).unwrap();

        assert!(tree.node_count() > 1);
        let root = tree.root_node().unwrap();
        assert!(!root.is_leaf());
        assert_eq!(root.node_start(), 0);

        // Both intervals stay reachable through the descent.
        assert_eq!(query(&tree, 0, 5).unwrap().end(), 10);
        assert_eq!(query(&tree, 0, 15).unwrap().end(), 20);
    }

    #[test]
    fn test_depth_growth_past_max_children() {
        let dir = TempDir::new().unwrap();
        let tree = HistoryTree::new(test_config(&dir)).unwrap();

        // max_children = 2, one big interval per leaf: repeated inserts
        // force cascading closes and several new roots.
        for i in 0..8i64 {
            tree.insert_interval(big_iv(i * 10, i * 10 + 9, 0)).unwrap();
        }
        tree.close_tree(100).unwrap();

        for i in 0..8i64 {
            let t = i * 10 + 5;
            let found = query(&tree, 0, t).unwrap();
            assert!(found.intersects(t), "lost interval around t={}", t);
        }
    }

    #[test]
    fn test_straddling_interval_lands_in_ancestor() {
        let dir = TempDir::new().unwrap();
        let tree = HistoryTree::new(test_config(&dir)).unwrap();

        tree.insert_interval(big_iv(0, 10, 0)).unwrap();
        tree.insert_interval(big_iv(11, 20, 0)).unwrap();

        // Starts before the current leaf's start; must climb to a core node.
        tree.insert_interval(small_iv(5, 25, 1)).unwrap();
        let root = tree.root_node().unwrap();
        assert!(root.relevant_interval(1, 15).is_some());
    }

    #[test]
    fn test_close_tree_clamps_end() {
        let dir = TempDir::new().unwrap();
        let tree = HistoryTree::new(test_config(&dir)).unwrap();

        tree.insert_interval(small_iv(0, 500, 0)).unwrap();
        tree.close_tree(100).unwrap();
        assert_eq!(tree.tree_end(), 500);
    }

    #[test]
    fn test_reopen_preserves_tree() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let path = config.state_file.clone();

        {
            let tree = HistoryTree::new(config).unwrap();
            for i in 0..5i64 {
                tree.insert_interval(big_iv(i * 10, i * 10 + 9, 0)).unwrap();
            }
            tree.insert_interval(small_iv(0, 42, 3)).unwrap();
            tree.close_tree(1000).unwrap();
            tree.close_file();
        }

        let tree = HistoryTree::open(&path, 7).unwrap();
        assert_eq!(tree.tree_start(), 0);
        assert_eq!(tree.tree_end(), 1000);
        assert!(tree.node_count() > 1);

        assert_eq!(query(&tree, 3, 20).unwrap().end(), 42);
        for i in 0..5i64 {
            assert!(query(&tree, 0, i * 10 + 5).is_some());
        }
    }

    #[test]
    fn test_reopen_rejects_provider_mismatch() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let path = config.state_file.clone();

        {
            let tree = HistoryTree::new(config).unwrap();
            tree.insert_interval(small_iv(0, 10, 0)).unwrap();
            tree.close_tree(10).unwrap();
            tree.close_file();
        }

        let err = HistoryTree::open(&path, 8).unwrap_err();
        assert!(matches!(err, StrataError::Corruption(_)));
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.ht");
        std::fs::write(&path, vec![0xABu8; TREE_HEADER_SIZE]).unwrap();

        let err = HistoryTree::open(&path, 0).unwrap_err();
        assert!(matches!(err, StrataError::Corruption(_)));
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.ht");
        std::fs::write(&path, b"not a history file").unwrap();

        let err = HistoryTree::open(&path, 0).unwrap_err();
        assert!(matches!(err, StrataError::Corruption(_)));
    }

    #[test]
    fn test_average_node_usage_in_range() {
        let dir = TempDir::new().unwrap();
        let tree = HistoryTree::new(test_config(&dir)).unwrap();
        for i in 0..4i64 {
            tree.insert_interval(big_iv(i * 10, i * 10 + 9, 0)).unwrap();
        }
        tree.close_tree(100).unwrap();

        let usage = tree.average_node_usage().unwrap();
        assert!((0.0..=100.0).contains(&usage));
        assert!(usage > 0.0);
    }

    #[test]
    fn test_at_offset_follows_last_block() {
        let dir = TempDir::new().unwrap();
        let tree = HistoryTree::new(test_config(&dir)).unwrap();
        tree.insert_interval(small_iv(0, 10, 0)).unwrap();
        tree.close_tree(10).unwrap();

        let expected = (TREE_HEADER_SIZE + TEST_BLOCK) as i64;
        assert_eq!(tree.at_writer_file_pos(), expected);
        assert_eq!(tree.file_size().unwrap(), expected as u64);
    }

    #[test]
    fn test_child_starts_ordered_after_growth() {
        let dir = TempDir::new().unwrap();
        let tree = HistoryTree::new(test_config(&dir)).unwrap();
        for i in 0..6i64 {
            tree.insert_interval(big_iv(i * 10, i * 10 + 9, 0)).unwrap();
        }
        tree.close_tree(100).unwrap();

        for seq in 0..tree.node_count() {
            let node = tree.read_node(seq).unwrap();
            let mut prev = i64::MIN;
            for i in 0..node.child_count() {
                let start = node.child_start_at(i).unwrap();
                assert!(prev <= start, "children of node {} out of order", seq);
                prev = start;
            }
        }
    }
}
