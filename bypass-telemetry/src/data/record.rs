//! Record
//! Positional decoding of the comma-delimited lines pushed by the backend.
//!
//! Field order:
//! `timestamp, protocol, host_set, domain, source, ip_set, destination[, source_alias]`
//!
//! Lines with fewer than `MIN_FIELDS` fields are not errors, they simply
//! never produce a record.

use std::fmt;
use std::sync::Arc;

/// Raw backend line, shared between history snapshots and parsed records.
pub type RawLine = Arc<str>;

pub const MIN_FIELDS: usize = 7;

const HOST_SET_FIELD: usize = 2;
const IP_SET_FIELD: usize = 5;

const LEVEL_MARKERS: [&str; 6] = ["INFO", "WARN", "WARNING", "ERROR", "DEBUG", "TRACE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn from_field(field: &str) -> Protocol {
        if field.trim().eq_ignore_ascii_case("udp") {
            Protocol::Udp
        } else {
            Protocol::Tcp
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pub timestamp: String,
    pub protocol: Protocol,
    pub host_set: String,
    pub ip_set: String,
    pub domain: String,
    pub source: String,
    pub destination: String,
    pub source_alias: String,
    pub raw: RawLine,
}

impl ParsedRecord {
    /// True if the connection was matched by a host set or an IP set.
    pub fn is_targeted(&self) -> bool {
        !self.host_set.is_empty() || !self.ip_set.is_empty()
    }

    /// The set that matched this connection, host set first.
    pub fn set(&self) -> &str {
        if self.host_set.is_empty() {
            &self.ip_set
        } else {
            &self.host_set
        }
    }

    /// Value handed to the configuration API when the record is picked:
    /// the domain when known, the destination otherwise.
    pub fn selection_value(&self) -> &str {
        if self.domain.is_empty() {
            &self.destination
        } else {
            &self.domain
        }
    }
}

pub fn split_fields(line: &str) -> Vec<&str> {
    line.split(',').collect()
}

/// True if the line carries at least `MIN_FIELDS` fields, without splitting
/// the whole line.
pub fn has_min_fields(line: &str) -> bool {
    line.split(',').nth(MIN_FIELDS - 1).is_some()
}

/// Cheap classifier used by the batcher: a line is targeted when it is a
/// well-formed record whose host set or IP set is non-empty.
pub fn is_targeted(line: &str) -> bool {
    let mut count = 0;
    let mut hit = false;
    for (i, field) in line.split(',').enumerate() {
        count = i + 1;
        if (i == HOST_SET_FIELD || i == IP_SET_FIELD) && !field.trim().is_empty() {
            hit = true;
        }
    }
    count >= MIN_FIELDS && hit
}

/// Decodes one line. Returns `None` for lines with too few fields.
pub fn parse_line(raw: &RawLine) -> Option<ParsedRecord> {
    let fields = split_fields(raw);
    if fields.len() < MIN_FIELDS {
        return None;
    }
    let field = |i: usize| fields.get(i).map(|f| f.trim().to_string()).unwrap_or_default();

    Some(ParsedRecord {
        timestamp: normalize_timestamp(fields[0]),
        protocol: Protocol::from_field(fields[1]),
        host_set: field(HOST_SET_FIELD),
        domain: field(3),
        source: field(4),
        ip_set: field(IP_SET_FIELD),
        destination: field(6),
        source_alias: field(7),
        raw: raw.clone(),
    })
}

/// Removes log level markers (`[INFO]`, `WARN:`, ...) and drops the
/// fractional part of the seconds.
pub fn normalize_timestamp(raw: &str) -> String {
    let kept: Vec<&str> = raw
        .split_whitespace()
        .filter(|token| !is_level_marker(token))
        .collect();
    strip_fraction(&kept.join(" "))
}

fn is_level_marker(token: &str) -> bool {
    let t = token.trim_end_matches(':');
    let t = t
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .unwrap_or(t);
    LEVEL_MARKERS.iter().any(|level| t.eq_ignore_ascii_case(level))
}

fn is_hms(b: &[u8]) -> bool {
    b.len() == 8
        && b[2] == b':'
        && b[5] == b':'
        && [0, 1, 3, 4, 6, 7].iter().all(|&i| b[i].is_ascii_digit())
}

fn strip_fraction(ts: &str) -> String {
    let bytes = ts.as_bytes();
    let mut out = String::with_capacity(ts.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'.' && i >= 8 && is_hms(&bytes[i - 8..i]) {
            let mut end = i + 1;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > i + 1 {
                out.push_str(&ts[copied..i]);
                copied = end;
                i = end;
                continue;
            }
        }
        i += 1;
    }
    out.push_str(&ts[copied..]);
    out
}
