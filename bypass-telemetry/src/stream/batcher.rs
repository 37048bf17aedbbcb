//! Batcher
//!
//! Arriving lines are queued and written to the sinks in one go when the
//! flush timer fires, so a burst of messages costs one history update per
//! interval instead of one per line. At most one flush is pending at any
//! time; lines arriving while it is pending join the same batch.
//!
//! The timer is a `crossbeam::channel::after` receiver owned by the batcher.
//! The owning thread selects on it next to its other channels and calls
//! `flush()` when it fires.

use crate::data::{has_min_fields, is_targeted, RawLine, Sink, DEFAULT_HISTORY_CAPACITY};

use crossbeam::channel::{self, Receiver};
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkId {
    /// Every line received.
    Logs,
    /// Lines with the full connection-event shape.
    Domains,
}

impl SinkId {
    pub fn name(&self) -> &'static str {
        match self {
            SinkId::Logs => "logs",
            SinkId::Domains => "domains",
        }
    }
}

/// The two destination histories of a batch.
pub struct Sinks {
    pub logs: Sink,
    pub domains: Sink,
}

impl Sinks {
    pub fn new(capacity: usize) -> Self {
        Self {
            logs: Sink::new(capacity),
            domains: Sink::new(capacity),
        }
    }

    pub fn get(&self, id: SinkId) -> &Sink {
        match id {
            SinkId::Logs => &self.logs,
            SinkId::Domains => &self.domains,
        }
    }

    pub fn get_mut(&mut self, id: SinkId) -> &mut Sink {
        match id {
            SinkId::Logs => &mut self.logs,
            SinkId::Domains => &mut self.domains,
        }
    }
}

impl Default for Sinks {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Lines taken from the queue.
    pub lines: usize,
    /// How many of those were targeted traffic.
    pub targeted: usize,
    pub logs_written: usize,
    pub domains_written: usize,
}

pub struct Batcher {
    pending: Vec<RawLine>,
    timer: Option<Receiver<Instant>>,
    interval: Duration,
}

impl Batcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            pending: Vec::new(),
            timer: None,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Queues `line` and makes sure a flush is scheduled. Returns true if
    /// this call armed the timer.
    pub fn enqueue(&mut self, line: RawLine) -> bool {
        self.pending.push(line);
        self.schedule()
    }

    /// Arms the flush timer unless it is already armed.
    pub fn schedule(&mut self) -> bool {
        if self.timer.is_some() {
            return false;
        }
        self.timer = Some(channel::after(self.interval));
        true
    }

    pub fn is_scheduled(&self) -> bool {
        self.timer.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The armed timer, to select on. `None` while nothing is scheduled;
    /// callers usually substitute `channel::never()`.
    pub fn timer(&self) -> Option<&Receiver<Instant>> {
        self.timer.as_ref()
    }

    /// Empties the queue into the sinks. Paused sinks drop their share of
    /// the batch.
    pub fn flush(&mut self, sinks: &mut Sinks) -> FlushReport {
        self.timer = None;
        let batch = std::mem::take(&mut self.pending);
        if batch.is_empty() {
            return FlushReport::default();
        }

        let events: Vec<RawLine> = batch
            .iter()
            .filter(|line| has_min_fields(line))
            .cloned()
            .collect();
        let report = FlushReport {
            lines: batch.len(),
            targeted: events.iter().filter(|line| is_targeted(line)).count(),
            logs_written: sinks.logs.write(&batch),
            domains_written: sinks.domains.write(&events),
        };
        debug!(
            lines = report.lines,
            targeted = report.targeted,
            logs = report.logs_written,
            domains = report.domains_written,
            "flushed batch"
        );
        report
    }

    /// Disarms the timer. Queued lines stay queued.
    pub fn cancel(&mut self) {
        self.timer = None;
    }

    /// Disarms the timer and drops the queue.
    pub fn discard(&mut self) {
        self.cancel();
        self.pending.clear();
    }
}

impl Default for Batcher {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_INTERVAL)
    }
}
