//! Store
//!
//! Client state kept across sessions in one YAML file: the filter text, the
//! sort state and the enrichment entities. A missing file means defaults;
//! callers that must not fail use `load_or_default()`, which also treats an
//! unreadable or corrupt file as defaults.

use crate::data::SortState;
use crate::enrich::{Entity, EnrichmentIndex, Resolver};

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_STATE_PATH: &str = "telemetry-state.yaml";
pub const STATE_PATH_ENV: &str = "BYPASS_TELEMETRY_STATE";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub filter: String,
    pub sort: SortState,
    pub entities: Vec<Entity>,
}

impl PersistedState {
    /// A resolver over the persisted entities.
    pub fn resolver(&self) -> Resolver {
        Resolver::new(EnrichmentIndex::from_entities(self.entities.iter().cloned()))
    }

    /// Adds `entity`, replacing one with the same id. Returns true on
    /// replacement.
    pub fn upsert_entity(&mut self, entity: Entity) -> bool {
        match self.entities.iter().position(|e| e.id == entity.id) {
            Some(pos) => {
                self.entities[pos] = entity;
                true
            }
            None => {
                self.entities.push(entity);
                false
            }
        }
    }

    pub fn remove_entity(&mut self, id: &str) -> Option<Entity> {
        let pos = self.entities.iter().position(|e| e.id == id)?;
        Some(self.entities.remove(pos))
    }
}

/// `explicit` if given, else `$BYPASS_TELEMETRY_STATE`, else
/// `telemetry-state.yaml` in the working directory.
pub fn state_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match env::var_os(STATE_PATH_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_STATE_PATH),
    }
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<PersistedState, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state file, using defaults");
                return Ok(PersistedState::default());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(PersistedState::default());
        }
        serde_yaml::from_str(&text).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    pub fn load_or_default(&self) -> PersistedState {
        self.load().unwrap_or_else(|e| {
            warn!(error = %e, "ignoring state file");
            PersistedState::default()
        })
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        let text = serde_yaml::to_string(state)?;
        fs::write(&self.path, text).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SortColumn, SortDirection};
    use crate::enrich::Enrichment;

    fn cloudflare() -> Entity {
        Entity {
            id: "cf".into(),
            name: "Cloudflare".into(),
            prefixes: vec!["1.1.1.0/24".into()],
        }
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.yaml"));
        let state = PersistedState {
            filter: "proto:udp+domain:a.com".into(),
            sort: SortState::new(SortColumn::Timestamp, SortDirection::Desc),
            entities: vec![cloudflare()],
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn missing_or_empty_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("absent.yaml"));
        assert_eq!(store.load().unwrap(), PersistedState::default());

        fs::write(store.path(), "  \n").unwrap();
        assert_eq!(store.load().unwrap(), PersistedState::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.yaml"));
        fs::write(store.path(), "filter: tcp\n").unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.filter, "tcp");
        assert_eq!(state.sort, SortState::default());
        assert!(state.entities.is_empty());
    }

    #[test]
    fn corrupt_file_is_an_error_but_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.yaml"));
        fs::write(store.path(), "sort: [not, a, map\n").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Parse { .. })));
        assert_eq!(store.load_or_default(), PersistedState::default());
    }

    #[test]
    fn entity_edits_feed_the_resolver() {
        let mut state = PersistedState::default();
        assert!(!state.upsert_entity(cloudflare()));
        assert!(state.upsert_entity(cloudflare()));
        assert_eq!(state.entities.len(), 1);
        assert_eq!(state.resolver().resolve("1.1.1.1:443").as_deref(), Some("Cloudflare"));
        assert!(state.remove_entity("cf").is_some());
        assert_eq!(state.resolver().resolve("1.1.1.1:443"), None);
    }

    #[test]
    fn explicit_path_wins() {
        let explicit = Path::new("/tmp/elsewhere.yaml");
        assert_eq!(state_path(Some(explicit)), explicit);
    }
}
