//! Buffer
//! Bounded history of raw lines, oldest evicted first.
//!
//! Two of these exist per session (all log lines, connection events), each
//! wrapped in a `Sink` that can be paused independently. Pausing only stops
//! future writes; it never touches lines already stored.

use super::record::RawLine;

use std::{collections::VecDeque, ops::Deref, sync::Arc};

pub const DEFAULT_HISTORY_CAPACITY: usize = 2000;

/// Immutable copy of a history at some revision.
///
/// `start` is the sequence number of the first line: the count of lines
/// that ever left the front of the buffer, by eviction or `clear`. Two
/// snapshots of one buffer with the same `start` differ only by appended
/// lines.
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    lines: Arc<[RawLine]>,
    start: u64,
}

impl HistorySnapshot {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn ptr_eq(&self, other: &HistorySnapshot) -> bool {
        Arc::ptr_eq(&self.lines, &other.lines) && self.start == other.start
    }
}

impl Deref for HistorySnapshot {
    type Target = [RawLine];

    fn deref(&self) -> &[RawLine] {
        &self.lines
    }
}

#[derive(Debug)]
pub struct HistoryBuffer {
    lines: VecDeque<RawLine>,
    capacity: usize,
    revision: u64,
    start: u64,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(65_536)),
            capacity,
            revision: 0,
            start: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Bumped on every mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Appends `items`, then trims the front back down to capacity.
    pub fn push<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = RawLine>,
    {
        let before = self.lines.len();
        self.lines.extend(items);
        if self.lines.len() == before {
            return;
        }
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
            self.start += 1;
        }
        self.revision += 1;
    }

    /// Sequence number of the oldest stored line.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Fresh snapshot, not a live view.
    pub fn get_all(&self) -> HistorySnapshot {
        HistorySnapshot {
            lines: self.lines.iter().cloned().collect(),
            start: self.start,
        }
    }

    pub fn clear(&mut self) {
        if !self.lines.is_empty() {
            self.start += self.lines.len() as u64;
            self.lines.clear();
            self.revision += 1;
        }
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// A history buffer plus its pause switch.
#[derive(Debug, Default)]
pub struct Sink {
    history: HistoryBuffer,
    paused: bool,
}

impl Sink {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: HistoryBuffer::new(capacity),
            paused: false,
        }
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn toggle_paused(&mut self) -> bool {
        self.paused = !self.paused;
        self.paused
    }

    /// Writes `items` unless paused. Returns the number of lines written;
    /// a paused sink drops the batch.
    pub fn write(&mut self, items: &[RawLine]) -> usize {
        if self.paused {
            return 0;
        }
        self.history.push(items.iter().cloned());
        items.len()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(range: std::ops::Range<usize>) -> Vec<RawLine> {
        range.map(|i| Arc::from(format!("line {i}"))).collect()
    }

    #[test]
    fn evicts_oldest_first() {
        let mut buf = HistoryBuffer::new(3);
        buf.push(lines(0..2));
        buf.push(lines(2..5));
        let all = buf.get_all();
        assert_eq!(all.len(), 3);
        assert_eq!(&*all[0], "line 2");
        assert_eq!(&*all[2], "line 4");
    }

    #[test]
    fn snapshot_is_detached() {
        let mut buf = HistoryBuffer::new(10);
        buf.push(lines(0..3));
        let snap = buf.get_all();
        buf.clear();
        assert_eq!(snap.len(), 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn revision_tracks_mutation_only() {
        let mut buf = HistoryBuffer::new(10);
        let r0 = buf.revision();
        buf.push(Vec::new());
        buf.clear();
        assert_eq!(buf.revision(), r0);
        buf.push(lines(0..1));
        assert_eq!(buf.revision(), r0 + 1);
        buf.clear();
        assert_eq!(buf.revision(), r0 + 2);
    }

    #[test]
    fn start_counts_lines_gone_from_the_front() {
        let mut buf = HistoryBuffer::new(3);
        buf.push(lines(0..3));
        assert_eq!(buf.get_all().start(), 0);
        buf.push(lines(3..5));
        assert_eq!(buf.start(), 2);
        buf.clear();
        assert_eq!(buf.start(), 5);
        buf.push(lines(5..6));
        let snap = buf.get_all();
        assert_eq!(snap.start(), 5);
        assert!(snap.ptr_eq(&snap.clone()));
        assert!(!snap.ptr_eq(&buf.get_all()));
    }

    #[test]
    fn paused_sink_drops_batches_but_keeps_history() {
        let mut sink = Sink::new(10);
        assert_eq!(sink.write(&lines(0..2)), 2);
        sink.set_paused(true);
        assert_eq!(sink.write(&lines(2..4)), 0);
        assert_eq!(sink.history().len(), 2);
        sink.set_paused(false);
        sink.write(&lines(4..5));
        let all = sink.history().get_all();
        assert_eq!(&*all[2], "line 4");
    }
}
