//! LogView
//!
//! One tab's worth of state: history -> reconcile -> scope -> filter ->
//! sort -> window. `refresh()` is called once per frame and only does work
//! when the history or one of the view settings changed since the last call.

use super::window::{visible_range, ScrollAnchor, VisibleRange, DEFAULT_OVERSCAN};
use crate::data::{
    FilterQuery, HistoryBuffer, HistorySnapshot, ParsedRecord, ReconcileOutcome, Reconciler,
    RecordParser, Scope, SortColumn, SortState,
};
use crate::enrich::Enrichment;

use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refresh {
    pub outcome: ReconcileOutcome,
    pub parsed: usize,
    pub rows: usize,
}

/// The rows currently materialized, with the geometry around them.
pub struct VisibleRows<'a> {
    pub range: VisibleRange,
    pub rows: &'a [Arc<ParsedRecord>],
}

pub struct LogView {
    reconciler: Reconciler,
    scope: Scope,
    filter_text: String,
    query: FilterQuery,
    sort: SortState,
    snapshot: Option<(u64, HistorySnapshot)>,
    parsed: usize,
    rows: Vec<Arc<ParsedRecord>>,
    dirty: bool,
    anchor: ScrollAnchor,
    overscan: usize,
}

impl LogView {
    pub fn new(parser: RecordParser, anchor: ScrollAnchor) -> Self {
        Self {
            reconciler: Reconciler::new(parser),
            scope: Scope::default(),
            filter_text: String::new(),
            query: FilterQuery::default(),
            sort: SortState::default(),
            snapshot: None,
            parsed: 0,
            rows: Vec::new(),
            dirty: true,
            anchor,
            overscan: DEFAULT_OVERSCAN,
        }
    }

    pub fn with_overscan(mut self, overscan: usize) -> Self {
        self.overscan = overscan;
        self
    }

    pub fn filter_text(&self) -> &str {
        &self.filter_text
    }

    pub fn set_filter(&mut self, text: &str) {
        if text != self.filter_text {
            self.filter_text = text.to_string();
            self.query = FilterQuery::parse(text);
            self.dirty = true;
        }
    }

    pub fn sort(&self) -> SortState {
        self.sort
    }

    pub fn set_sort(&mut self, sort: SortState) {
        if sort != self.sort {
            self.sort = sort;
            self.dirty = true;
        }
    }

    pub fn click_sort(&mut self, column: SortColumn) {
        self.sort.click(column);
        self.dirty = true;
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn set_scope(&mut self, scope: Scope) {
        if scope != self.scope {
            self.scope = scope;
            self.dirty = true;
        }
    }

    pub fn toggle_scope(&mut self) -> Scope {
        self.set_scope(self.scope.toggled());
        self.scope
    }

    /// Forces the next refresh to re-filter, e.g. after the enrichment
    /// entities changed.
    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    /// Brings the rows up to date with `history`. Returns `None` when
    /// neither the history nor the view settings changed.
    pub fn refresh(
        &mut self,
        history: &HistoryBuffer,
        enrich: &mut dyn Enrichment,
    ) -> Option<Refresh> {
        let snapshot = match &self.snapshot {
            Some((revision, snapshot)) if *revision == history.revision() => {
                if !self.dirty {
                    return None;
                }
                snapshot.clone()
            }
            _ => {
                let snapshot = history.get_all();
                self.snapshot = Some((history.revision(), snapshot.clone()));
                snapshot
            }
        };

        let parsed = self.reconciler.reconcile(&snapshot, self.scope);
        let filtered = self.query.apply(&parsed.records, enrich);
        self.rows = self.sort.apply(filtered);
        self.parsed = parsed.records.len();
        self.dirty = false;
        self.anchor.apply_update(self.rows.len());

        let refresh = Refresh {
            outcome: parsed.outcome,
            parsed: self.parsed,
            rows: self.rows.len(),
        };
        debug!(?refresh, "view refreshed");
        Some(refresh)
    }

    /// Filtered and sorted rows, all of them.
    pub fn rows(&self) -> &[Arc<ParsedRecord>] {
        &self.rows
    }

    /// Records in scope before filtering.
    pub fn parsed_len(&self) -> usize {
        self.parsed
    }

    pub fn visible(&self) -> VisibleRows<'_> {
        let range = visible_range(self.rows.len(), &self.anchor.viewport(self.overscan));
        VisibleRows {
            range,
            rows: &self.rows[range.rows()],
        }
    }

    pub fn anchor(&self) -> &ScrollAnchor {
        &self.anchor
    }

    pub fn anchor_mut(&mut self) -> &mut ScrollAnchor {
        &mut self.anchor
    }

    /// Drops everything derived from the history. The parse cache survives.
    pub fn reset(&mut self) {
        self.reconciler.reset();
        self.snapshot = None;
        self.rows.clear();
        self.parsed = 0;
        self.dirty = true;
        self.anchor.apply_update(0);
    }
}

impl Default for LogView {
    fn default() -> Self {
        Self::new(RecordParser::default(), ScrollAnchor::default())
    }
}
