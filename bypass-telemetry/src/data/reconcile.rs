//! Reconciler
//! Keeps the parsed view of a history up to date without re-parsing the
//! whole history on every pass.
//!
//! - Same snapshot as last pass: reuse the parsed result, only the scope
//!   (all / targeted) is re-derived.
//! - Longer snapshot with the same start sequence (nothing evicted or
//!   cleared in between) whose overlap with the previous one matches on the
//!   last `APPEND_CHECK_WINDOW` lines: parse only the appended tail.
//! - Anything else (first pass, eviction, clear): full parse.

use super::buffer::HistorySnapshot;
use super::cache::RecordParser;
use super::record::ParsedRecord;

use std::sync::Arc;
use tracing::trace;

pub const APPEND_CHECK_WINDOW: usize = 100;

/// Which records of a history make it into the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    All,
    Targeted,
}

impl Scope {
    pub fn toggled(self) -> Scope {
        match self {
            Scope::All => Scope::Targeted,
            Scope::Targeted => Scope::All,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Reused,
    Appended(usize),
    Full,
}

#[derive(Debug, Clone)]
pub struct ParsedView {
    pub records: Arc<[Arc<ParsedRecord>]>,
    pub outcome: ReconcileOutcome,
}

pub struct Reconciler {
    parser: RecordParser,
    history: Option<HistorySnapshot>,
    parsed: Vec<Arc<ParsedRecord>>,
    scoped: Option<(Scope, Arc<[Arc<ParsedRecord>]>)>,
}

impl Reconciler {
    pub fn new(parser: RecordParser) -> Self {
        Self {
            parser,
            history: None,
            parsed: Vec::new(),
            scoped: None,
        }
    }

    pub fn reconcile(&mut self, history: &HistorySnapshot, scope: Scope) -> ParsedView {
        let outcome = match &self.history {
            Some(prev) if prev.ptr_eq(history) => ReconcileOutcome::Reused,
            Some(prev) if history.len() > prev.len() && is_pure_append(prev, history) => {
                let added = &history[prev.len()..];
                let records = self.parser.parse_all(added);
                self.parsed.extend(records);
                ReconcileOutcome::Appended(added.len())
            }
            _ => {
                self.parsed = self.parser.parse_all(history.iter());
                ReconcileOutcome::Full
            }
        };
        trace!(?outcome, lines = history.len(), "reconciled history");

        if outcome != ReconcileOutcome::Reused {
            self.history = Some(history.clone());
            self.scoped = None;
        }

        let records = match &self.scoped {
            Some((cached_scope, records)) if *cached_scope == scope => records.clone(),
            _ => {
                let records: Arc<[Arc<ParsedRecord>]> = match scope {
                    Scope::All => self.parsed.iter().cloned().collect(),
                    Scope::Targeted => self
                        .parsed
                        .iter()
                        .filter(|r| r.is_targeted())
                        .cloned()
                        .collect(),
                };
                self.scoped = Some((scope, records.clone()));
                records
            }
        };

        ParsedView { records, outcome }
    }

    /// Forgets the previous pass; the next one is a full parse. The parse
    /// cache is kept, its entries stay valid.
    pub fn reset(&mut self) {
        self.history = None;
        self.parsed.clear();
        self.scoped = None;
    }

    pub fn parser(&self) -> &RecordParser {
        &self.parser
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(RecordParser::default())
    }
}

fn is_pure_append(prev: &HistorySnapshot, next: &HistorySnapshot) -> bool {
    if prev.start() != next.start() {
        return false;
    }
    let window = prev.len().min(APPEND_CHECK_WINDOW);
    let start = prev.len() - window;
    prev[start..]
        .iter()
        .zip(&next[start..prev.len()])
        .all(|(a, b)| Arc::ptr_eq(a, b) || a == b)
}
