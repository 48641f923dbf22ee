//! The backend contract consumed by the surrounding state system.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::PathBuf;

use strata_common::{Quark, Result, StateInterval, StateValue};

/// A state-history backend: ingests a stream of past-state intervals during
/// a build phase, then answers historical queries.
///
/// Implementations are single-writer: one thread builds, any number of
/// threads may query. Queries on a backend still being built are only
/// guaranteed meaningful once [`finish_building`](Self::finish_building)
/// has returned.
pub trait StateHistoryBackend: Send + Sync {
    /// The state-system identifier supplied at creation.
    fn ssid(&self) -> &str;

    /// Earliest timestamp covered by this history.
    fn start_time(&self) -> i64;

    /// Latest timestamp covered by this history so far.
    fn end_time(&self) -> i64;

    /// Appends one past-state interval. Must be called during the build
    /// phase. Fails if `start > end` or the serialized size limit is
    /// exceeded.
    fn insert_past_state(
        &self,
        start: i64,
        end: i64,
        quark: Quark,
        value: StateValue,
    ) -> Result<()>;

    /// Ends the build phase, closing the history at
    /// `max(end_time, current end)`.
    fn finish_building(&self, end_time: i64) -> Result<()>;

    /// Fills `state_info[quark]` with the interval intersecting `t` for
    /// every quark that has one, indexed by quark. Entries for quarks
    /// outside the slice bounds are skipped.
    fn do_query(&self, state_info: &mut [Option<StateInterval>], t: i64) -> Result<()>;

    /// Returns the interval intersecting `(t, quark)`, if any.
    fn do_singular_query(&self, t: i64, quark: Quark) -> Result<Option<StateInterval>>;

    /// Populates `results[quark]` for every requested quark with an
    /// interval intersecting `t`.
    fn do_partial_query(
        &self,
        t: i64,
        quarks: &HashSet<Quark>,
        results: &mut HashMap<Quark, StateInterval>,
    ) -> Result<()>;

    /// A handle positioned at the attribute-tree blob section, or `None`
    /// for backends without one.
    fn supply_attribute_tree_reader(&self) -> Result<Option<File>>;

    /// The file the attribute-tree blob should be appended to, if any.
    fn supply_attribute_tree_writer_file(&self) -> Option<PathBuf>;

    /// The position the attribute-tree blob should be written at, or -1.
    fn supply_attribute_tree_writer_file_position(&self) -> i64;

    /// Deletes any files this backend created.
    fn remove_files(&self) -> Result<()>;

    /// Releases all resources. Disposing during a partial build deletes
    /// the backing file.
    fn dispose(&self) -> Result<()>;
}
