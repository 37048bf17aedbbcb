//! Sort
//!
//! Column sort driven by header clicks: `none -> asc -> desc -> none` on the
//! same column, straight to `asc` when switching columns. Timestamps compare
//! as epoch seconds (unparseable = 0), everything else as lowercase text.
//! Equal keys keep their incoming order; there is no secondary key.

use super::record::ParsedRecord;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

const TIMESTAMP_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortColumn {
    Timestamp,
    Set,
    Protocol,
    Domain,
    Source,
    Destination,
}

impl SortColumn {
    pub const ALL: [SortColumn; 6] = [
        SortColumn::Timestamp,
        SortColumn::Set,
        SortColumn::Protocol,
        SortColumn::Domain,
        SortColumn::Source,
        SortColumn::Destination,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SortColumn::Timestamp => "timestamp",
            SortColumn::Set => "set",
            SortColumn::Protocol => "protocol",
            SortColumn::Domain => "domain",
            SortColumn::Source => "source",
            SortColumn::Destination => "destination",
        }
    }

    pub fn from_name(name: &str) -> Option<SortColumn> {
        let name = name.trim();
        SortColumn::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for SortColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn orient(self, ord: Ordering) -> Ordering {
        match self {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortState {
    #[serde(default)]
    pub column: Option<SortColumn>,
    #[serde(default)]
    pub direction: Option<SortDirection>,
}

impl SortState {
    pub fn new(column: SortColumn, direction: SortDirection) -> Self {
        Self {
            column: Some(column),
            direction: Some(direction),
        }
    }

    /// Advances the state for a click on `column`'s header.
    pub fn click(&mut self, column: SortColumn) {
        *self = match (self.column, self.direction) {
            (Some(c), Some(SortDirection::Asc)) if c == column => {
                SortState::new(column, SortDirection::Desc)
            }
            (Some(c), Some(SortDirection::Desc)) if c == column => SortState::default(),
            _ => SortState::new(column, SortDirection::Asc),
        };
    }

    /// Column and direction, if sorting is on.
    pub fn active(&self) -> Option<(SortColumn, SortDirection)> {
        Some((self.column?, self.direction?))
    }

    pub fn compare(&self, a: &ParsedRecord, b: &ParsedRecord) -> Ordering {
        match self.active() {
            Some((column, direction)) => {
                direction.orient(SortKey::of(column, a).cmp(&SortKey::of(column, b)))
            }
            None => Ordering::Equal,
        }
    }

    /// Sorts `records`, computing each key once. Unsorted state returns the
    /// input order untouched.
    pub fn apply(&self, records: Vec<Arc<ParsedRecord>>) -> Vec<Arc<ParsedRecord>> {
        let Some((column, direction)) = self.active() else {
            return records;
        };
        let mut keyed: Vec<(SortKey, Arc<ParsedRecord>)> = records
            .into_iter()
            .map(|r| (SortKey::of(column, &r), r))
            .collect();
        keyed.sort_by(|a, b| direction.orient(a.0.cmp(&b.0)));
        keyed.into_iter().map(|(_, r)| r).collect()
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Epoch(i64),
    Text(String),
}

impl SortKey {
    fn of(column: SortColumn, record: &ParsedRecord) -> SortKey {
        let text: &str = match column {
            SortColumn::Timestamp => return SortKey::Epoch(timestamp_epoch(&record.timestamp)),
            SortColumn::Set => record.set(),
            SortColumn::Protocol => record.protocol.as_str(),
            SortColumn::Domain => &record.domain,
            SortColumn::Source => &record.source,
            SortColumn::Destination => &record.destination,
        };
        SortKey::Text(text.to_lowercase())
    }
}

/// Seconds since the Unix epoch, or 0 if `ts` is not a recognized
/// timestamp. Zone-less timestamps are taken as UTC. Never negative, so
/// unrecognized timestamps sort first.
pub fn timestamp_epoch(ts: &str) -> i64 {
    let ts = ts.trim();
    let epoch = DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.timestamp())
        .ok()
        .or_else(|| {
            TIMESTAMP_FORMATS.iter().find_map(|format| {
                NaiveDateTime::parse_from_str(ts, format)
                    .ok()
                    .map(|dt| dt.and_utc().timestamp())
            })
        });
    epoch.unwrap_or(0).max(0)
}
