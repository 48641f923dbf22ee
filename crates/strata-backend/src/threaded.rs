//! Threaded history-tree backend.
//!
//! A bounded producer/consumer queue of build commands decouples the
//! builder thread from disk writes. A single consumer thread drains the
//! queue and applies the operations to the tree; an end-of-input sentinel
//! triggers the final close.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use strata_common::{HtConfig, Quark, Result, StateInterval, StateValue, StrataError};

use crate::backend::StateHistoryBackend;
use crate::history::HistoryTreeBackend;

/// Commands travelling from the builder thread to the writer thread.
enum BuildCommand {
    Insert(StateInterval),
    /// End of input: close the tree at the given time and terminate.
    Finish(i64),
    /// The build was abandoned: delete the partial file and terminate.
    Abort,
}

/// One-shot latch signalled when the build has terminated.
struct BuildLatch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl BuildLatch {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }

    fn is_done(&self) -> bool {
        *self.done.lock()
    }
}

/// History-tree backend whose inserts are queued to a writer thread.
///
/// `insert_past_state` blocks when the queue is full (backpressure);
/// `finish_building` blocks until the writer has processed the sentinel
/// and fully closed the tree. Queries are meaningful once the build has
/// completed.
pub struct ThreadedHistoryTreeBackend {
    inner: Arc<HistoryTreeBackend>,
    /// `None` when `queue_size == 0`: inserts then go straight to the tree.
    sender: Option<Sender<BuildCommand>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    built: Arc<BuildLatch>,
    disposed: AtomicBool,
}

impl ThreadedHistoryTreeBackend {
    /// Creates a threaded backend over a brand-new history file.
    ///
    /// `queue_size` bounds the command queue; `0` disables the queue and
    /// makes every operation synchronous.
    pub fn new(ssid: impl Into<String>, config: HtConfig, queue_size: usize) -> Result<Self> {
        let inner = Arc::new(HistoryTreeBackend::new(ssid, config)?);
        let built = Arc::new(BuildLatch::new());

        if queue_size == 0 {
            return Ok(Self {
                inner,
                sender: None,
                writer: Mutex::new(None),
                built,
                disposed: AtomicBool::new(false),
            });
        }

        let (sender, receiver) = bounded(queue_size);
        let handle = {
            let backend = Arc::clone(&inner);
            let latch = Arc::clone(&built);
            std::thread::Builder::new()
                .name("strata-ht-writer".to_string())
                .spawn(move || writer_loop(backend, receiver, latch))?
        };

        Ok(Self {
            inner,
            sender: Some(sender),
            writer: Mutex::new(Some(handle)),
            built,
            disposed: AtomicBool::new(false),
        })
    }

    /// Blocks until the build has terminated, or until `timeout` elapses.
    /// Returns true if the build terminated in time.
    pub fn wait_until_built(&self, timeout: Duration) -> bool {
        self.built.wait_for(timeout)
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(StrataError::Disposed)
        } else {
            Ok(())
        }
    }

    fn join_writer(&self) {
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                error!("history tree writer thread panicked");
            }
        }
    }
}

/// Drains the command queue. A dropped sender without a sentinel counts as
/// an abandoned build.
fn writer_loop(
    backend: Arc<HistoryTreeBackend>,
    receiver: Receiver<BuildCommand>,
    latch: Arc<BuildLatch>,
) {
    loop {
        match receiver.recv() {
            Ok(BuildCommand::Insert(interval)) => {
                if let Err(e) = backend.insert_interval(interval) {
                    error!(error = %e, "failed to insert queued interval");
                }
            }
            Ok(BuildCommand::Finish(end_time)) => {
                if let Err(e) = backend.finish_building(end_time) {
                    error!(error = %e, "failed to close history tree");
                }
                latch.signal();
                break;
            }
            Ok(BuildCommand::Abort) | Err(_) => {
                debug!("history tree build abandoned, deleting partial file");
                if let Err(e) = backend.dispose() {
                    error!(error = %e, "failed to dispose partially built history");
                }
                latch.signal();
                break;
            }
        }
    }
}

impl StateHistoryBackend for ThreadedHistoryTreeBackend {
    fn ssid(&self) -> &str {
        self.inner.ssid()
    }

    fn start_time(&self) -> i64 {
        self.inner.start_time()
    }

    fn end_time(&self) -> i64 {
        self.inner.end_time()
    }

    fn insert_past_state(
        &self,
        start: i64,
        end: i64,
        quark: Quark,
        value: StateValue,
    ) -> Result<()> {
        self.check_disposed()?;
        // Validate on the producer side so the caller sees the error.
        let interval = StateInterval::new(start, end, quark, value)?;
        match &self.sender {
            Some(sender) => sender
                .send(BuildCommand::Insert(interval))
                .map_err(|_| StrataError::Disposed),
            None => self.inner.insert_interval(interval),
        }
    }

    fn finish_building(&self, end_time: i64) -> Result<()> {
        self.check_disposed()?;
        match &self.sender {
            Some(sender) => {
                sender
                    .send(BuildCommand::Finish(end_time))
                    .map_err(|_| StrataError::Disposed)?;
                self.built.wait();
                Ok(())
            }
            None => {
                let result = self.inner.finish_building(end_time);
                self.built.signal();
                result
            }
        }
    }

    fn do_query(&self, state_info: &mut [Option<StateInterval>], t: i64) -> Result<()> {
        self.inner.do_query(state_info, t)
    }

    fn do_singular_query(&self, t: i64, quark: Quark) -> Result<Option<StateInterval>> {
        self.inner.do_singular_query(t, quark)
    }

    fn do_partial_query(
        &self,
        t: i64,
        quarks: &HashSet<Quark>,
        results: &mut HashMap<Quark, StateInterval>,
    ) -> Result<()> {
        self.inner.do_partial_query(t, quarks, results)
    }

    fn supply_attribute_tree_reader(&self) -> Result<Option<File>> {
        self.inner.supply_attribute_tree_reader()
    }

    fn supply_attribute_tree_writer_file(&self) -> Option<PathBuf> {
        self.inner.supply_attribute_tree_writer_file()
    }

    fn supply_attribute_tree_writer_file_position(&self) -> i64 {
        self.inner.supply_attribute_tree_writer_file_position()
    }

    fn remove_files(&self) -> Result<()> {
        self.inner.remove_files()
    }

    fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match &self.sender {
            Some(sender) if !self.built.is_done() => {
                // Build still in flight: tell the writer to delete the
                // partial file and abandon whatever is still queued.
                if sender.send(BuildCommand::Abort).is_ok() {
                    self.built.wait();
                } else {
                    self.inner.dispose()?;
                }
            }
            _ => {
                self.inner.dispose()?;
            }
        }
        self.join_writer();
        Ok(())
    }
}

impl Drop for ThreadedHistoryTreeBackend {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel; an unfinished build
        // is treated as abandoned by the writer loop.
        self.sender.take();
        self.join_writer();
    }
}
