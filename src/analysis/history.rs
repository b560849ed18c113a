//! Record buffers used by the analyzer and the delivery handler.
//!
//! - [`SlidingWindow`]: the most recent W records, owned by the analyzer
//! - [`History`]: an append-only log behind a shared handle; the production
//!   task appends, HTTP handlers and WebSocket actors read snapshots

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::report::AnalysisReport;
use crate::audio::FeatureRecord;

/// Bounded FIFO of recent records; pushing past capacity evicts the oldest.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    records: VecDeque<FeatureRecord>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a record, returning the evicted one if the window was full.
    pub fn push(&mut self, record: FeatureRecord) -> Option<FeatureRecord> {
        let evicted = if self.records.len() == self.capacity {
            self.records.pop_front()
        } else {
            None
        };
        self.records.push_back(record);
        evicted
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &FeatureRecord> {
        self.records.iter()
    }
}

/// Shared, append-only log.
///
/// Clones share the same storage. Lock poisoning is ignored: entries are
/// only ever pushed whole, so a panicked writer cannot leave one half-written.
pub struct History<T> {
    entries: Arc<RwLock<Vec<T>>>,
}

pub type FullHistory = History<FeatureRecord>;
pub type ReportHistory = History<AnalysisReport>;

impl<T> Clone for History<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> Default for History<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl<T: Clone> History<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, entry: T) {
        self.write().push(entry);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.read().clone()
    }

    /// The last `n` entries (fewer if the log is shorter), oldest first.
    pub fn tail(&self, n: usize) -> Vec<T> {
        let entries = self.read();
        entries[entries.len().saturating_sub(n)..].to_vec()
    }

    /// Drops every entry; only used when the owning session is torn down.
    pub fn clear(&self) {
        let mut entries = self.write();
        entries.clear();
        entries.shrink_to_fit();
    }
}

impl History<FeatureRecord> {
    /// Records with `start <= timestamp <= end`, ordered by timestamp.
    pub fn in_time_range(&self, start: f64, end: f64) -> Vec<FeatureRecord> {
        let mut records: Vec<FeatureRecord> = self
            .read()
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        records
    }
}

impl History<AnalysisReport> {
    /// The report closest in time to `time`; the earliest one wins a tie.
    pub fn nearest(&self, time: f64) -> Option<AnalysisReport> {
        let reports = self.read();
        let mut best: Option<&AnalysisReport> = None;
        for report in reports.iter() {
            let distance = (report.analysis_timestamp - time).abs();
            match best {
                Some(current) if (current.analysis_timestamp - time).abs() <= distance => {}
                _ => best = Some(report),
            }
        }
        best.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sequencer::tests::record_at;

    #[test]
    fn test_sliding_window_evicts_oldest() {
        let mut window = SlidingWindow::new(3);
        for i in 0..3 {
            assert!(window.push(record_at(i as f64, 0.1)).is_none());
        }
        let evicted = window.push(record_at(3.0, 0.1)).unwrap();
        assert_eq!(evicted.timestamp, 0.0);
        assert_eq!(window.len(), 3);
        let timestamps: Vec<f64> = window.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_history_handles_share_storage() {
        let history = FullHistory::new();
        let reader = history.clone();
        for i in 0..5 {
            history.append(record_at(i as f64 * 0.2, 0.5));
        }
        assert_eq!(reader.len(), 5);
        assert_eq!(reader.tail(2).len(), 2);
        assert_eq!(reader.tail(10).len(), 5);

        history.clear();
        assert!(reader.is_empty());
    }

    #[test]
    fn test_time_range_is_inclusive() {
        let history = FullHistory::new();
        for i in 0..10 {
            history.append(record_at(i as f64 * 0.5, 0.5));
        }
        let records = history.in_time_range(1.0, 2.5);
        let timestamps: Vec<f64> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![1.0, 1.5, 2.0, 2.5]);
        assert!(history.in_time_range(100.0, 103.0).is_empty());
    }
}
