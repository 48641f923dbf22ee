//! Synchronous history-tree backend.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use strata_common::{HtConfig, Quark, Result, StateInterval, StateValue, StrataError};
use strata_tree::HistoryTree;

use crate::backend::StateHistoryBackend;

/// History-tree backend running in the caller's thread.
///
/// Inserts go straight to the tree; queries descend from the root node,
/// collecting matching intervals from every node on the path to the leaf
/// covering the queried timestamp.
#[derive(Debug)]
pub struct HistoryTreeBackend {
    ssid: String,
    tree: HistoryTree,
    finished: AtomicBool,
    disposed: AtomicBool,
}

impl HistoryTreeBackend {
    /// Creates a backend over a brand-new history file.
    pub fn new(ssid: impl Into<String>, config: HtConfig) -> Result<Self> {
        let tree = HistoryTree::new(config)?;
        Ok(Self {
            ssid: ssid.into(),
            tree,
            finished: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Opens a backend over an existing, finished history file.
    ///
    /// Fails with a corruption error if the file is not recognized or its
    /// provider version does not match.
    pub fn open(
        ssid: impl Into<String>,
        state_file: &Path,
        provider_version: u32,
    ) -> Result<Self> {
        let tree = HistoryTree::open(state_file, provider_version)?;
        Ok(Self {
            ssid: ssid.into(),
            tree,
            finished: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
        })
    }

    /// Current size of the history file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        self.tree.file_size()
    }

    /// Inserts a pre-built interval. The trait method wraps this; the
    /// threaded backend's consumer calls it directly.
    pub(crate) fn insert_interval(&self, interval: StateInterval) -> Result<()> {
        self.check_disposed()?;
        self.tree.insert_interval(interval)
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(StrataError::Disposed)
        } else {
            Ok(())
        }
    }

    fn check_valid_time(&self, t: i64) -> Result<()> {
        let start = self.start_time();
        let end = self.end_time();
        if t < start || t > end {
            Err(StrataError::TimeRange { t, start, end })
        } else {
            Ok(())
        }
    }
}

impl StateHistoryBackend for HistoryTreeBackend {
    fn ssid(&self) -> &str {
        &self.ssid
    }

    fn start_time(&self) -> i64 {
        self.tree.tree_start()
    }

    fn end_time(&self) -> i64 {
        self.tree.tree_end()
    }

    fn insert_past_state(
        &self,
        start: i64,
        end: i64,
        quark: Quark,
        value: StateValue,
    ) -> Result<()> {
        let interval = StateInterval::new(start, end, quark, value)?;
        self.insert_interval(interval)
    }

    fn finish_building(&self, end_time: i64) -> Result<()> {
        self.check_disposed()?;
        self.tree.close_tree(end_time)?;
        self.finished.store(true, Ordering::Release);
        Ok(())
    }

    fn do_query(&self, state_info: &mut [Option<StateInterval>], t: i64) -> Result<()> {
        self.check_disposed()?;
        self.check_valid_time(t)?;

        let mut node = self.tree.root_node()?;
        node.write_info_into(state_info, t);
        while !node.is_leaf() {
            node = self.tree.select_next_child(&node, t)?;
            node.write_info_into(state_info, t);
        }
        Ok(())
    }

    fn do_singular_query(&self, t: i64, quark: Quark) -> Result<Option<StateInterval>> {
        self.check_disposed()?;
        self.check_valid_time(t)?;

        let mut node = self.tree.root_node()?;
        loop {
            if let Some(interval) = node.relevant_interval(quark, t) {
                return Ok(Some(interval));
            }
            if node.is_leaf() {
                return Ok(None);
            }
            node = self.tree.select_next_child(&node, t)?;
        }
    }

    fn do_partial_query(
        &self,
        t: i64,
        quarks: &HashSet<Quark>,
        results: &mut HashMap<Quark, StateInterval>,
    ) -> Result<()> {
        self.check_disposed()?;
        self.check_valid_time(t)?;

        let mut remaining = quarks.len();
        let mut node = self.tree.root_node()?;
        remaining -= node.collect_matching(quarks, t, results);
        while remaining > 0 && !node.is_leaf() {
            node = self.tree.select_next_child(&node, t)?;
            remaining -= node.collect_matching(quarks, t, results);
        }
        Ok(())
    }

    fn supply_attribute_tree_reader(&self) -> Result<Option<File>> {
        self.check_disposed()?;
        Ok(Some(self.tree.supply_at_reader()?))
    }

    fn supply_attribute_tree_writer_file(&self) -> Option<PathBuf> {
        Some(self.tree.at_writer_file().to_path_buf())
    }

    fn supply_attribute_tree_writer_file_position(&self) -> i64 {
        self.tree.at_writer_file_pos()
    }

    fn remove_files(&self) -> Result<()> {
        self.tree.delete_file();
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.finished.load(Ordering::Acquire) {
            self.tree.close_file();
        } else {
            // The partial file would not be reusable; delete it.
            debug!(ssid = %self.ssid, "disposing mid-build, deleting partial history file");
            self.tree.delete_file();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> HtConfig {
        HtConfig {
            state_file: dir.path().join("backend.ht"),
            block_size: 17 * 4096,
            max_children: 4,
            provider_version: 1,
            start_time: 0,
        }
    }

    fn build_small(dir: &TempDir) -> HistoryTreeBackend {
        let backend = HistoryTreeBackend::new("test-ss", test_config(dir)).unwrap();
        for quark in 0..4 {
            backend
                .insert_past_state(0, 100, quark, StateValue::Integer(quark))
                .unwrap();
        }
        backend
            .insert_past_state(50, 200, 4, StateValue::Str("late".to_string()))
            .unwrap();
        backend.finish_building(200).unwrap();
        backend
    }

    #[test]
    fn test_ssid_and_bounds() {
        let dir = TempDir::new().unwrap();
        let backend = build_small(&dir);
        assert_eq!(backend.ssid(), "test-ss");
        assert_eq!(backend.start_time(), 0);
        assert_eq!(backend.end_time(), 200);
    }

    #[test]
    fn test_insert_rejects_inverted_interval() {
        let dir = TempDir::new().unwrap();
        let backend = HistoryTreeBackend::new("ss", test_config(&dir)).unwrap();
        let err = backend
            .insert_past_state(10, 5, 0, StateValue::Null)
            .unwrap_err();
        assert!(matches!(err, StrataError::InvalidInterval { .. }));
    }

    #[test]
    fn test_full_query() {
        let dir = TempDir::new().unwrap();
        let backend = build_small(&dir);

        let mut info = vec![None; 5];
        backend.do_query(&mut info, 60).unwrap();
        for (quark, entry) in info.iter().enumerate() {
            let interval = entry.as_ref().unwrap_or_else(|| {
                panic!("no interval for quark {}", quark);
            });
            assert!(interval.intersects(60));
        }
    }

    #[test]
    fn test_singular_query() {
        let dir = TempDir::new().unwrap();
        let backend = build_small(&dir);

        let interval = backend.do_singular_query(60, 4).unwrap().unwrap();
        assert_eq!(interval.value().as_str().unwrap(), "late");

        // Quark 4 has no state before t = 50.
        assert!(backend.do_singular_query(10, 4).unwrap().is_none());
    }

    #[test]
    fn test_partial_query() {
        let dir = TempDir::new().unwrap();
        let backend = build_small(&dir);

        let quarks: HashSet<Quark> = [1, 3].into_iter().collect();
        let mut results = HashMap::new();
        backend.do_partial_query(60, &quarks, &mut results).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[&1].value().as_integer().unwrap(), 1);
        assert_eq!(results[&3].value().as_integer().unwrap(), 3);
    }

    #[test]
    fn test_query_outside_range() {
        let dir = TempDir::new().unwrap();
        let backend = build_small(&dir);

        let mut info = vec![None; 5];
        assert!(matches!(
            backend.do_query(&mut info, -1),
            Err(StrataError::TimeRange { .. })
        ));
        assert!(matches!(
            backend.do_singular_query(201, 0),
            Err(StrataError::TimeRange { .. })
        ));
    }

    #[test]
    fn test_query_after_dispose() {
        let dir = TempDir::new().unwrap();
        let backend = build_small(&dir);
        backend.dispose().unwrap();

        let mut info = vec![None; 5];
        assert!(matches!(
            backend.do_query(&mut info, 60),
            Err(StrataError::Disposed)
        ));
    }

    #[test]
    fn test_dispose_mid_build_deletes_file() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let path = config.state_file.clone();

        let backend = HistoryTreeBackend::new("ss", config).unwrap();
        backend
            .insert_past_state(0, 10, 0, StateValue::Null)
            .unwrap();
        assert!(path.exists());
        backend.dispose().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_dispose_after_finish_keeps_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backend.ht");

        let backend = build_small(&dir);
        backend.dispose().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_attribute_tree_slot() {
        let dir = TempDir::new().unwrap();
        let backend = build_small(&dir);

        let pos = backend.supply_attribute_tree_writer_file_position();
        assert!(pos > 0);
        assert_eq!(
            backend.supply_attribute_tree_writer_file().unwrap(),
            dir.path().join("backend.ht")
        );
        assert!(backend.supply_attribute_tree_reader().unwrap().is_some());
    }

    #[test]
    fn test_remove_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backend.ht");

        let backend = build_small(&dir);
        backend.remove_files().unwrap();
        assert!(!path.exists());
    }
}
