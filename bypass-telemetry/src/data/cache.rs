//! Parse cache
//! Memoizes `parse_line` by exact raw text. Malformed lines are cached as
//! `None` so known garbage is never split twice.

use super::record::{parse_line, ParsedRecord, RawLine};

use lru::LruCache;
use std::{num::NonZeroUsize, sync::Arc};

pub const DEFAULT_PARSE_CACHE_CAPACITY: usize = 5000;

type Entry = Option<Arc<ParsedRecord>>;

/// Bounded LRU map from raw line to parse result.
pub struct ParseCache {
    entries: LruCache<RawLine, Entry>,
}

impl ParseCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Looks up `raw`, promoting it to most recently used on a hit.
    pub fn get(&mut self, raw: &str) -> Option<Entry> {
        self.entries.get(raw).cloned()
    }

    pub fn set(&mut self, raw: RawLine, value: Entry) {
        self.entries.put(raw, value);
    }

    pub fn contains(&self, raw: &str) -> bool {
        self.entries.contains(raw)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for ParseCache {
    fn default() -> Self {
        Self::new(DEFAULT_PARSE_CACHE_CAPACITY)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Lines actually split.
    pub parses: u64,
    pub hits: u64,
}

/// `parse_line` behind a `ParseCache`.
#[derive(Default)]
pub struct RecordParser {
    cache: ParseCache,
    stats: ParserStats,
}

impl RecordParser {
    pub fn new(cache: ParseCache) -> Self {
        Self {
            cache,
            stats: ParserStats::default(),
        }
    }

    pub fn parse(&mut self, raw: &RawLine) -> Option<Arc<ParsedRecord>> {
        if let Some(hit) = self.cache.get(raw) {
            self.stats.hits += 1;
            return hit;
        }
        self.stats.parses += 1;
        let record = parse_line(raw).map(Arc::new);
        self.cache.set(raw.clone(), record.clone());
        record
    }

    /// Parses every line, keeping only well-formed records, in order.
    pub fn parse_all<'a, I>(&mut self, lines: I) -> Vec<Arc<ParsedRecord>>
    where
        I: IntoIterator<Item = &'a RawLine>,
    {
        lines.into_iter().filter_map(|raw| self.parse(raw)).collect()
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    pub fn cache(&self) -> &ParseCache {
        &self.cache
    }
}
