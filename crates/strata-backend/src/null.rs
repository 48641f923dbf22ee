//! Null state-history backend.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::PathBuf;

use strata_common::{Quark, Result, StateInterval, StateValue};

use crate::backend::StateHistoryBackend;

/// A backend that discards every interval it receives.
///
/// No queries can be answered. Useful with a state system on which only
/// ongoing-state requests will ever be made.
pub struct NullBackend {
    ssid: String,
}

impl NullBackend {
    /// Creates a null backend.
    pub fn new(ssid: impl Into<String>) -> Self {
        Self { ssid: ssid.into() }
    }
}

impl StateHistoryBackend for NullBackend {
    fn ssid(&self) -> &str {
        &self.ssid
    }

    fn start_time(&self) -> i64 {
        0
    }

    fn end_time(&self) -> i64 {
        0
    }

    fn insert_past_state(
        &self,
        _start: i64,
        _end: i64,
        _quark: Quark,
        _value: StateValue,
    ) -> Result<()> {
        // The interval is always discarded.
        Ok(())
    }

    fn finish_building(&self, _end_time: i64) -> Result<()> {
        Ok(())
    }

    fn do_query(&self, _state_info: &mut [Option<StateInterval>], _t: i64) -> Result<()> {
        // Past queries cannot be answered; state_info is left untouched.
        Ok(())
    }

    fn do_singular_query(&self, _t: i64, _quark: Quark) -> Result<Option<StateInterval>> {
        Ok(None)
    }

    fn do_partial_query(
        &self,
        _t: i64,
        _quarks: &HashSet<Quark>,
        _results: &mut HashMap<Quark, StateInterval>,
    ) -> Result<()> {
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
        Ok(())
    }
}
