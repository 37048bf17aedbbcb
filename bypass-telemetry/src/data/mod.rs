mod buffer;
mod cache;
mod filter;
mod reconcile;
mod record;
mod sort;

pub use buffer::{HistoryBuffer, HistorySnapshot, Sink, DEFAULT_HISTORY_CAPACITY};
pub use cache::{ParseCache, ParserStats, RecordParser, DEFAULT_PARSE_CACHE_CAPACITY};
pub use filter::{Field, FilterQuery, Term};
pub use reconcile::{ParsedView, ReconcileOutcome, Reconciler, Scope, APPEND_CHECK_WINDOW};
pub use record::{
    has_min_fields, is_targeted, normalize_timestamp, parse_line, split_fields, ParsedRecord, Protocol, RawLine,
    MIN_FIELDS,
};
pub use sort::{timestamp_epoch, SortColumn, SortDirection, SortState};
