//! History tree nodes.
//!
//! A node occupies exactly one block of the history file. It stores a
//! time-sorted list of intervals plus a small header; core nodes also carry
//! their children arrays. Nodes are mutated while they sit on the latest
//! branch and become immutable once written to disk.

use std::collections::{HashMap, HashSet};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;

use strata_common::{Quark, Result, StateInterval, StrataError};

/// Size of the header common to both node variants.
///
/// Layout (little-endian):
/// - variant_tag: 1 byte (1 = core, 2 = leaf)
/// - node_start: 8 bytes
/// - node_end: 8 bytes (0 while the node is still open)
/// - sequence_number: 4 bytes
/// - parent_sequence: 4 bytes (-1 for the root)
/// - interval_count: 4 bytes
pub const COMMON_HEADER_SIZE: usize = 1 + 8 + 8 + 4 + 4 + 4;

const TAG_CORE: u8 = 1;
const TAG_LEAF: u8 = 2;

/// Reserved extension slot in the core header; always -1.
const EXTENSION_NONE: i32 = -1;

/// Node variant discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Internal node with children.
    Core,
    /// Terminal node without children.
    Leaf,
}

/// One node of the history tree.
///
/// The interval list and mutable header fields live behind a read-write
/// lock; core nodes carry a second lock for their children arrays so child
/// linking does not contend with interval appends.
#[derive(Debug)]
pub struct HtNode {
    block_size: usize,
    max_children: usize,
    seq_number: i32,
    node_start: i64,
    inner: RwLock<NodeInner>,
    variant: NodeVariant,
}

#[derive(Debug)]
struct NodeInner {
    parent_seq: i32,
    /// End time; 0 until the node is closed.
    node_end: i64,
    /// Sorted by end time (non-decreasing).
    intervals: Vec<StateInterval>,
    /// Running byte size of the serialized interval section.
    interval_bytes: usize,
    on_disk: bool,
}

#[derive(Debug)]
enum NodeVariant {
    Core(RwLock<CoreChildren>),
    Leaf,
}

/// Children bookkeeping of a core node, ordered by creation time.
#[derive(Debug)]
struct CoreChildren {
    child_seqs: Vec<i32>,
    child_starts: Vec<i64>,
}

impl HtNode {
    /// Creates a new empty core node.
    pub fn new_core(
        block_size: usize,
        max_children: usize,
        seq_number: i32,
        parent_seq: i32,
        start: i64,
    ) -> Self {
        Self {
            block_size,
            max_children,
            seq_number,
            node_start: start,
            inner: RwLock::new(NodeInner::new(parent_seq)),
            variant: NodeVariant::Core(RwLock::new(CoreChildren {
                child_seqs: Vec::with_capacity(max_children),
                child_starts: Vec::with_capacity(max_children),
            })),
        }
    }

    /// Creates a new empty leaf node.
    pub fn new_leaf(
        block_size: usize,
        max_children: usize,
        seq_number: i32,
        parent_seq: i32,
        start: i64,
    ) -> Self {
        Self {
            block_size,
            max_children,
            seq_number,
            node_start: start,
            inner: RwLock::new(NodeInner::new(parent_seq)),
            variant: NodeVariant::Leaf,
        }
    }

    /// The node's unique sequence number; also its block position.
    pub fn seq_number(&self) -> i32 {
        self.seq_number
    }

    /// Inclusive lower bound of any interval stored here.
    pub fn node_start(&self) -> i64 {
        self.node_start
    }

    /// End time recorded at close; 0 while the node is still open.
    pub fn node_end(&self) -> i64 {
        self.inner.read().node_end
    }

    /// Sequence number of the parent node; -1 for the root.
    pub fn parent_seq(&self) -> i32 {
        self.inner.read().parent_seq
    }

    /// Rewrites the parent link. Used when a new root is grown above.
    pub fn set_parent_seq(&self, parent_seq: i32) {
        self.inner.write().parent_seq = parent_seq;
    }

    /// Which variant this node is.
    pub fn kind(&self) -> NodeKind {
        match self.variant {
            NodeVariant::Core(_) => NodeKind::Core,
            NodeVariant::Leaf => NodeKind::Leaf,
        }
    }

    /// Returns true for leaf nodes.
    pub fn is_leaf(&self) -> bool {
        matches!(self.variant, NodeVariant::Leaf)
    }

    /// True once the node's block has been written to the file.
    pub fn is_on_disk(&self) -> bool {
        self.inner.read().on_disk
    }

    /// Number of intervals currently stored.
    pub fn interval_count(&self) -> usize {
        self.inner.read().intervals.len()
    }

    /// Header size of this variant, children arrays included.
    fn total_header_size(&self) -> usize {
        match self.variant {
            NodeVariant::Core(_) => COMMON_HEADER_SIZE + core_header_size(self.max_children),
            NodeVariant::Leaf => COMMON_HEADER_SIZE,
        }
    }

    /// Bytes still available for intervals in this node's block.
    pub fn free_space(&self) -> usize {
        let inner = self.inner.read();
        self.block_size - self.total_header_size() - inner.interval_bytes
    }

    /// Appends an interval, keeping the list sorted by end time.
    ///
    /// The caller must have checked [`free_space`](Self::free_space) first.
    /// Builders submit intervals in roughly end-time order, so the insert
    /// position is found by scanning backward from the tail.
    pub fn add_interval(&self, interval: StateInterval) {
        let mut inner = self.inner.write();
        debug_assert!(!inner.on_disk, "appending to a node already on disk");
        debug_assert!(
            interval.size_on_disk()
                <= self.block_size - self.total_header_size() - inner.interval_bytes,
            "interval does not fit in node {}",
            self.seq_number
        );
        debug_assert!(interval.start() >= self.node_start);

        let mut index = inner.intervals.len();
        while index > 0
            && inner.intervals[index - 1].cmp_by_end(&interval) == std::cmp::Ordering::Greater
        {
            index -= 1;
        }
        inner.interval_bytes += interval.size_on_disk();
        inner.intervals.insert(index, interval);
    }

    /// Closes the node at `end`.
    ///
    /// The recorded end time is the greater of `end` and the last stored
    /// interval's end, so child ranges never contradict parent ranges. An
    /// empty node may record an end before its start; that is tolerated and
    /// the node is simply vacuous.
    pub fn close(&self, end: i64) {
        let mut inner = self.inner.write();
        let mut end = end;
        if let Some(last) = inner.intervals.last() {
            if last.end() > end {
                end = last.end();
            }
        }
        inner.node_end = end;
    }

    /// Writes every interval intersecting `t` into `state_info`, indexed by
    /// quark. Quarks outside the slice bounds are skipped.
    pub fn write_info_into(&self, state_info: &mut [Option<StateInterval>], t: i64) {
        let inner = self.inner.read();
        if inner.intervals.is_empty() {
            return;
        }
        for interval in &inner.intervals[start_index_for(&inner.intervals, t)..] {
            if interval.start() <= t {
                let quark = interval.quark();
                if quark >= 0 && (quark as usize) < state_info.len() {
                    state_info[quark as usize] = Some(interval.clone());
                }
            }
        }
    }

    /// Returns the first interval in this node matching `quark` and
    /// intersecting `t`, if any.
    pub fn relevant_interval(&self, quark: Quark, t: i64) -> Option<StateInterval> {
        let inner = self.inner.read();
        inner.intervals[start_index_for(&inner.intervals, t)..]
            .iter()
            .find(|iv| iv.quark() == quark && iv.start() <= t)
            .cloned()
    }

    /// Adds an entry to `results` for every requested quark that has an
    /// interval intersecting `t` in this node. Returns how many quarks were
    /// newly resolved.
    pub fn collect_matching(
        &self,
        quarks: &HashSet<Quark>,
        t: i64,
        results: &mut HashMap<Quark, StateInterval>,
    ) -> usize {
        let inner = self.inner.read();
        let mut found = 0;
        for interval in &inner.intervals[start_index_for(&inner.intervals, t)..] {
            if interval.start() <= t && quarks.contains(&interval.quark()) {
                if results.insert(interval.quark(), interval.clone()).is_none() {
                    found += 1;
                }
            }
        }
        found
    }

    // ------------------------------------------------------------------
    // Core node children
    // ------------------------------------------------------------------

    /// Number of children; 0 for leaves.
    pub fn child_count(&self) -> usize {
        match &self.variant {
            NodeVariant::Core(children) => children.read().child_seqs.len(),
            NodeVariant::Leaf => 0,
        }
    }

    /// Records `child` as this core node's newest child.
    pub fn link_new_child(&self, child: &HtNode) {
        match &self.variant {
            NodeVariant::Core(children) => {
                let mut children = children.write();
                debug_assert!(children.child_seqs.len() < self.max_children);
                debug_assert!(
                    children
                        .child_starts
                        .last()
                        .map_or(true, |&s| s <= child.node_start()),
                    "children must be ordered by start time"
                );
                children.child_seqs.push(child.seq_number());
                children.child_starts.push(child.node_start());
            }
            NodeVariant::Leaf => panic!("cannot link a child to a leaf node"),
        }
    }

    /// Sequence number of the child at `index`, in creation order.
    pub fn child_seq_at(&self, index: usize) -> Option<i32> {
        match &self.variant {
            NodeVariant::Core(children) => children.read().child_seqs.get(index).copied(),
            NodeVariant::Leaf => None,
        }
    }

    /// Start time of the child at `index`, in creation order.
    pub fn child_start_at(&self, index: usize) -> Option<i64> {
        match &self.variant {
            NodeVariant::Core(children) => children.read().child_starts.get(index).copied(),
            NodeVariant::Leaf => None,
        }
    }

    /// Sequence number of the most recently linked child, if any.
    pub fn latest_child_seq(&self) -> Option<i32> {
        match &self.variant {
            NodeVariant::Core(children) => children.read().child_seqs.last().copied(),
            NodeVariant::Leaf => None,
        }
    }

    /// Selects the child whose subtree covers `t`: the newest child whose
    /// start time is at or before `t`. Returns `None` on leaves and when no
    /// child qualifies.
    pub fn select_child_for(&self, t: i64) -> Option<i32> {
        match &self.variant {
            NodeVariant::Core(children) => {
                let children = children.read();
                for i in (0..children.child_seqs.len()).rev() {
                    if children.child_starts[i] <= t {
                        return Some(children.child_seqs[i]);
                    }
                }
                None
            }
            NodeVariant::Leaf => None,
        }
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Serializes the node into exactly one block, zero-padded at the tail.
    pub fn write_block(&self) -> BytesMut {
        let inner = self.inner.read();
        let mut buf = BytesMut::with_capacity(self.block_size);

        let tag = match self.variant {
            NodeVariant::Core(_) => TAG_CORE,
            NodeVariant::Leaf => TAG_LEAF,
        };
        buf.put_u8(tag);
        buf.put_i64_le(self.node_start);
        buf.put_i64_le(inner.node_end);
        buf.put_i32_le(self.seq_number);
        buf.put_i32_le(inner.parent_seq);
        buf.put_i32_le(inner.intervals.len() as i32);

        if let NodeVariant::Core(children) = &self.variant {
            let children = children.read();
            buf.put_i32_le(EXTENSION_NONE);
            buf.put_i32_le(children.child_seqs.len() as i32);
            for i in 0..self.max_children {
                buf.put_i32_le(children.child_seqs.get(i).copied().unwrap_or(0));
            }
            for i in 0..self.max_children {
                buf.put_i64_le(children.child_starts.get(i).copied().unwrap_or(0));
            }
        }

        for interval in &inner.intervals {
            interval.write_to(&mut buf);
        }
        debug_assert!(buf.len() <= self.block_size);
        buf.resize(self.block_size, 0);
        buf
    }

    /// Deserializes a node from one block read off the file.
    pub fn read_block(block_size: usize, max_children: usize, block: &[u8]) -> Result<Self> {
        let mut buf = block;

        let tag = buf.get_u8();
        let node_start = buf.get_i64_le();
        let node_end = buf.get_i64_le();
        let seq_number = buf.get_i32_le();
        let parent_seq = buf.get_i32_le();
        let interval_count = buf.get_i32_le();
        if interval_count < 0 {
            return Err(StrataError::Corruption(format!(
                "node {} has negative interval count",
                seq_number
            )));
        }

        let variant = match tag {
            TAG_CORE => {
                let _extension = buf.get_i32_le();
                let child_count = buf.get_i32_le();
                if child_count < 0 || child_count as usize > max_children {
                    return Err(StrataError::Corruption(format!(
                        "node {} has invalid child count {}",
                        seq_number, child_count
                    )));
                }
                let mut child_seqs = Vec::with_capacity(max_children);
                for _ in 0..max_children {
                    child_seqs.push(buf.get_i32_le());
                }
                let mut child_starts = Vec::with_capacity(max_children);
                for _ in 0..max_children {
                    child_starts.push(buf.get_i64_le());
                }
                child_seqs.truncate(child_count as usize);
                child_starts.truncate(child_count as usize);
                NodeVariant::Core(RwLock::new(CoreChildren {
                    child_seqs,
                    child_starts,
                }))
            }
            TAG_LEAF => NodeVariant::Leaf,
            other => {
                return Err(StrataError::Corruption(format!(
                    "unknown node variant tag: {}",
                    other
                )))
            }
        };

        let mut intervals = Vec::with_capacity(interval_count as usize);
        let mut interval_bytes = 0;
        for _ in 0..interval_count {
            let interval = StateInterval::read_from(&mut buf)?;
            interval_bytes += interval.size_on_disk();
            intervals.push(interval);
        }

        Ok(Self {
            block_size,
            max_children,
            seq_number,
            node_start,
            inner: RwLock::new(NodeInner {
                parent_seq,
                node_end,
                intervals,
                interval_bytes,
                on_disk: true,
            }),
            variant,
        })
    }

    /// Marks the node as persisted. Called by the I/O layer after a
    /// successful block write.
    pub fn mark_on_disk(&self) {
        self.inner.write().on_disk = true;
    }
}

impl NodeInner {
    fn new(parent_seq: i32) -> Self {
        Self {
            parent_seq,
            node_end: 0,
            intervals: Vec::new(),
            interval_bytes: 0,
            on_disk: false,
        }
    }
}

/// Size of the core-specific header: extension slot, child count, and the
/// fixed-capacity children arrays.
pub(crate) fn core_header_size(max_children: usize) -> usize {
    4 + 4 + 4 * max_children + 8 * max_children
}

/// Index of the first interval whose end time is >= `t`.
///
/// The list is sorted by end time; after the binary search, back-scan over
/// any run of equal end times so no qualifying interval is missed.
fn start_index_for(intervals: &[StateInterval], t: i64) -> usize {
    match intervals.binary_search_by(|iv| iv.end().cmp(&t)) {
        Ok(mut index) => {
            while index > 0 && intervals[index - 1].end() == t {
                index -= 1;
            }
            index
        }
        Err(index) => index,
    }
}
