//! In-memory state-history backend.
//!
//! Keeps every interval in RAM, sorted by end time, with the same
//! validation and query semantics as the on-disk tree. Useful for short
//! histories and for tests that should not touch the filesystem.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use strata_common::{Quark, Result, StateInterval, StateValue, StrataError};

use crate::backend::StateHistoryBackend;

/// File-less backend storing intervals in a sorted vector.
pub struct InMemoryBackend {
    ssid: String,
    start_time: i64,
    state: RwLock<MemState>,
    disposed: AtomicBool,
}

struct MemState {
    /// Sorted by end time (non-decreasing), like a node's interval list.
    intervals: Vec<StateInterval>,
    end_time: i64,
}

impl InMemoryBackend {
    /// Creates an empty in-memory backend starting at `start_time`.
    pub fn new(ssid: impl Into<String>, start_time: i64) -> Self {
        Self {
            ssid: ssid.into(),
            start_time,
            state: RwLock::new(MemState {
                intervals: Vec::new(),
                end_time: start_time,
            }),
            disposed: AtomicBool::new(false),
        }
    }

    /// Number of intervals stored.
    pub fn interval_count(&self) -> usize {
        self.state.read().intervals.len()
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(StrataError::Disposed)
        } else {
            Ok(())
        }
    }

    fn check_valid_time(&self, t: i64) -> Result<()> {
        let start = self.start_time;
        let end = self.state.read().end_time;
        if t < start || t > end {
            Err(StrataError::TimeRange { t, start, end })
        } else {
            Ok(())
        }
    }
}

/// Index of the first interval whose end time is >= `t`.
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

impl StateHistoryBackend for InMemoryBackend {
    fn ssid(&self) -> &str {
        &self.ssid
    }

    fn start_time(&self) -> i64 {
        self.start_time
    }

    fn end_time(&self) -> i64 {
        self.state.read().end_time
    }

    fn insert_past_state(
        &self,
        start: i64,
        end: i64,
        quark: Quark,
        value: StateValue,
    ) -> Result<()> {
        self.check_disposed()?;
        if start < self.start_time {
            return Err(StrataError::TimeRange {
                t: start,
                start: self.start_time,
                end: i64::MAX,
            });
        }
        let interval = StateInterval::new(start, end, quark, value)?;

        let mut state = self.state.write();
        let index = start_index_for(&state.intervals, interval.end());
        state.intervals.insert(index, interval);
        state.end_time = state.end_time.max(end);
        Ok(())
    }

    fn finish_building(&self, end_time: i64) -> Result<()> {
        self.check_disposed()?;
        let mut state = self.state.write();
        state.end_time = state.end_time.max(end_time);
        Ok(())
    }

    fn do_query(&self, state_info: &mut [Option<StateInterval>], t: i64) -> Result<()> {
        self.check_disposed()?;
        self.check_valid_time(t)?;

        let state = self.state.read();
        for interval in &state.intervals[start_index_for(&state.intervals, t)..] {
            if interval.start() <= t {
                let quark = interval.quark();
                if quark >= 0 && (quark as usize) < state_info.len() {
                    state_info[quark as usize] = Some(interval.clone());
                }
            }
        }
        Ok(())
    }

    fn do_singular_query(&self, t: i64, quark: Quark) -> Result<Option<StateInterval>> {
        self.check_disposed()?;
        self.check_valid_time(t)?;

        let state = self.state.read();
        Ok(state.intervals[start_index_for(&state.intervals, t)..]
            .iter()
            .find(|iv| iv.quark() == quark && iv.start() <= t)
            .cloned())
    }

    fn do_partial_query(
        &self,
        t: i64,
        quarks: &HashSet<Quark>,
        results: &mut HashMap<Quark, StateInterval>,
    ) -> Result<()> {
        self.check_disposed()?;
        self.check_valid_time(t)?;

        let state = self.state.read();
        for interval in &state.intervals[start_index_for(&state.intervals, t)..] {
            if interval.start() <= t && quarks.contains(&interval.quark()) {
                results.insert(interval.quark(), interval.clone());
                if results.len() == quarks.len() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn supply_attribute_tree_reader(&self) -> Result<Option<File>> {
        Ok(None)
    }

    fn supply_attribute_tree_writer_file(&self) -> Option<PathBuf> {
        None
    }

    fn supply_attribute_tree_writer_file_position(&self) -> i64 {
        -1
    }

    fn remove_files(&self) -> Result<()> {
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.state.write().intervals.clear();
        }
        Ok(())
    }
}
