//! Lazy 2-D iteration over quarks and time.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use strata_common::{Quark, Result, StateInterval, StrataError};

use crate::backend::StateHistoryBackend;

/// Pull-based, time-ascending iterator over `(timestamp, quark → interval)`
/// groups for a requested set of quarks.
///
/// Timestamps are aligned to `range_start + k * resolution`. A priority
/// queue keyed by the next due timestamp per quark drives partial queries:
/// each pull pops every quark due at the earliest timestamp, queries once,
/// and re-queues each quark at the first aligned timestamp after its
/// current interval ends. Quarks whose interval spans many steps are thus
/// queried once per state change, not once per step.
pub struct QueryIterator<'a> {
    backend: &'a dyn StateHistoryBackend,
    range_start: i64,
    range_end: i64,
    resolution: i64,
    /// Min-heap of (next due timestamp, quark).
    due: BinaryHeap<Reverse<(i64, Quark)>>,
}

impl<'a> QueryIterator<'a> {
    /// Creates an iterator over `quarks` between `range_start` and
    /// `range_end` (inclusive), sampling every `resolution` time units.
    pub fn new(
        backend: &'a dyn StateHistoryBackend,
        quarks: &[Quark],
        range_start: i64,
        range_end: i64,
        resolution: i64,
    ) -> Result<Self> {
        if resolution < 1 {
            return Err(StrataError::Config(format!(
                "resolution must be at least 1, got {}",
                resolution
            )));
        }
        if range_start > range_end {
            return Err(StrataError::TimeRange {
                t: range_start,
                start: backend.start_time(),
                end: range_end,
            });
        }
        let due = quarks
            .iter()
            .map(|&quark| Reverse((range_start, quark)))
            .collect();
        Ok(Self {
            backend,
            range_start,
            range_end,
            resolution,
            due,
        })
    }

    /// First aligned timestamp strictly after `end`, never before the step
    /// following `current`.
    fn next_due_after(&self, end: i64, current: i64) -> i64 {
        let steps = (end - self.range_start) / self.resolution + 1;
        let aligned = self.range_start + steps * self.resolution;
        aligned.max(current + self.resolution)
    }
}

impl Iterator for QueryIterator<'_> {
    type Item = Result<(i64, HashMap<Quark, StateInterval>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse((ts, _)) = *self.due.peek()?;

        // Pop every quark due at this timestamp.
        let mut batch = HashSet::new();
        while let Some(&Reverse((due_ts, quark))) = self.due.peek() {
            if due_ts != ts {
                break;
            }
            self.due.pop();
            batch.insert(quark);
        }

        let mut results = HashMap::new();
        if let Err(e) = self.backend.do_partial_query(ts, &batch, &mut results) {
            self.due.clear();
            return Some(Err(e));
        }

        for &quark in &batch {
            let next_due = match results.get(&quark) {
                Some(interval) => self.next_due_after(interval.end(), ts),
                // Nothing known at ts; try again on the next step.
                None => ts + self.resolution,
            };
            if next_due <= self.range_end {
                self.due.push(Reverse((next_due, quark)));
            }
        }

        Some(Ok((ts, results)))
    }
}
