//! History tree storage engine for Strata.
//!
//! This crate provides:
//! - A block-structured, append-only history file keyed by time
//! - Node format and serialization (core and leaf variants)
//! - Block I/O with a direct-mapped node cache
//! - The tree growth strategy that keeps the latest branch open for writes
//! - Query descent primitives used by the backend facades

mod io;
mod node;
mod tree;

pub use io::BlockIo;
pub use node::{HtNode, NodeKind, COMMON_HEADER_SIZE};
pub use tree::{HistoryTree, FILE_VERSION, TREE_HEADER_SIZE};
