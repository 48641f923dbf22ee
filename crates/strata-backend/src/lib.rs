//! State-history backend facades for Strata.
//!
//! This crate adapts the history tree to the narrow interface the
//! surrounding state system consumes:
//! - [`StateHistoryBackend`]: the backend contract
//! - [`HistoryTreeBackend`]: synchronous facade over the on-disk tree
//! - [`ThreadedHistoryTreeBackend`]: build queue decoupling ingest from
//!   disk writes
//! - [`InMemoryBackend`]: file-less backend with the same query semantics
//! - [`NullBackend`]: discards everything, for ongoing-only state systems
//! - [`QueryIterator`]: lazy 2-D iteration over quarks and time

pub mod backend;
pub mod history;
pub mod iter;
pub mod memory;
pub mod null;
pub mod threaded;

pub use backend::StateHistoryBackend;
pub use history::HistoryTreeBackend;
pub use iter::QueryIterator;
pub use memory::InMemoryBackend;
pub use null::NullBackend;
pub use threaded::ThreadedHistoryTreeBackend;
