//! Enrichment
//!
//! Resolves a connection's destination address to the display name of the
//! organization owning it, from a set of named entities and their CIDR
//! prefixes. The set is maintained elsewhere (see `store`), this module only
//! reads and caches it.
//!
//! Lookups are memoized by raw destination text in a small cache that is
//! flushed by half when full. Any change to the entity set invalidates the
//! whole cache, otherwise an address cached as unknown would stay unknown
//! after a matching entity is learned.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_LOOKUP_CACHE_CAPACITY: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub prefixes: Vec<String>,
}

impl Entity {
    /// Prefixes that are not CIDR notation. They are kept but never match.
    pub fn invalid_prefixes(&self) -> impl Iterator<Item = &str> {
        self.prefixes
            .iter()
            .map(|p| p.as_str())
            .filter(|p| p.trim().parse::<IpNetwork>().is_err())
    }
}

/// Source of derived names for the filter and the views.
pub trait Enrichment {
    fn resolve(&mut self, destination: &str) -> Option<Arc<str>>;
}

/// Enrichment that never resolves anything.
pub struct NoEnrichment;

impl Enrichment for NoEnrichment {
    fn resolve(&mut self, _destination: &str) -> Option<Arc<str>> {
        None
    }
}

struct IndexedEntity {
    entity: Entity,
    name: Arc<str>,
    networks: Vec<IpNetwork>,
}

impl IndexedEntity {
    fn new(entity: Entity) -> Self {
        let networks = entity
            .prefixes
            .iter()
            .filter_map(|p| match p.trim().parse::<IpNetwork>() {
                Ok(net) => Some(net),
                Err(e) => {
                    debug!(entity = %entity.id, prefix = %p, error = %e, "skipping invalid prefix");
                    None
                }
            })
            .collect();
        Self {
            name: Arc::from(entity.name.as_str()),
            entity,
            networks,
        }
    }
}

#[derive(Default)]
pub struct EnrichmentIndex {
    entities: Vec<IndexedEntity>,
}

impl EnrichmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entities<I: IntoIterator<Item = Entity>>(entities: I) -> Self {
        let mut index = Self::new();
        for entity in entities {
            index.insert(entity);
        }
        index
    }

    /// Adds `entity`, replacing any entity with the same id. Returns true
    /// on replacement.
    pub fn insert(&mut self, entity: Entity) -> bool {
        let indexed = IndexedEntity::new(entity);
        match self
            .entities
            .iter()
            .position(|e| e.entity.id == indexed.entity.id)
        {
            Some(pos) => {
                self.entities[pos] = indexed;
                true
            }
            None => {
                self.entities.push(indexed);
                false
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Entity> {
        let pos = self.entities.iter().position(|e| e.entity.id == id)?;
        Some(self.entities.remove(pos).entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter().map(|e| &e.entity)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// First entity, in insertion order, with a prefix containing `addr`.
    pub fn lookup(&self, addr: IpAddr) -> Option<&Arc<str>> {
        self.entities
            .iter()
            .find(|e| e.networks.iter().any(|net| net.contains(addr)))
            .map(|e| &e.name)
    }
}

/// Extracts the address from `1.2.3.4`, `1.2.3.4:443`, `2001:db8::1`,
/// `[2001:db8::1]` or `[2001:db8::1]:443`.
pub fn destination_address(destination: &str) -> Option<IpAddr> {
    let d = destination.trim();
    if let Ok(addr) = d.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    if let Some(rest) = d.strip_prefix('[') {
        let end = rest.find(']')?;
        return rest[..end].parse().ok();
    }
    d.parse().ok()
}

struct LookupCache {
    entries: HashMap<String, Option<Arc<str>>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl LookupCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, key: &str) -> Option<Option<Arc<str>>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: &str, value: Option<Arc<str>>) {
        if self.entries.len() >= self.capacity {
            let evict = (self.capacity / 2).max(1);
            for old in self.order.drain(..evict.min(self.order.len())) {
                self.entries.remove(&old);
            }
        }
        if self.entries.insert(key.to_string(), value).is_none() {
            self.order.push_back(key.to_string());
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct Resolver {
    index: EnrichmentIndex,
    cache: LookupCache,
}

impl Resolver {
    pub fn new(index: EnrichmentIndex) -> Self {
        Self::with_cache_capacity(index, DEFAULT_LOOKUP_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(index: EnrichmentIndex, capacity: usize) -> Self {
        Self {
            index,
            cache: LookupCache::new(capacity),
        }
    }

    pub fn index(&self) -> &EnrichmentIndex {
        &self.index
    }

    /// Adds or replaces an entity and invalidates cached lookups.
    pub fn learn(&mut self, entity: Entity) {
        debug!(entity = %entity.id, "learned entity");
        self.index.insert(entity);
        self.invalidate();
    }

    pub fn forget(&mut self, id: &str) -> Option<Entity> {
        let removed = self.index.remove(id);
        if removed.is_some() {
            self.invalidate();
        }
        removed
    }

    pub fn invalidate(&mut self) {
        self.cache.clear();
    }

    pub fn cached_lookups(&self) -> usize {
        self.cache.len()
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(EnrichmentIndex::new())
    }
}

impl Enrichment for Resolver {
    fn resolve(&mut self, destination: &str) -> Option<Arc<str>> {
        if let Some(hit) = self.cache.get(destination) {
            return hit;
        }
        let name = destination_address(destination)
            .and_then(|addr| self.index.lookup(addr))
            .cloned();
        self.cache.insert(destination, name.clone());
        name
    }
}
