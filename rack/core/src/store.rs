//! Persistence collaborator: all-or-nothing commit of one unit of work.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use rack_spec::ConfigId;

use crate::journal::JournalEntry;
use crate::ledger::ComponentRow;
use crate::model::ConfigurationRecord;

/// Persistence failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("storage error: {0}")]
    Io(String),
    /// State could not be encoded or decoded.
    #[error("state encoding error: {0}")]
    Encoding(String),
    /// The backend refused the commit.
    #[error("commit rejected: {0}")]
    Rejected(String),
}

/// Change to one configuration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ConfigurationChange {
    /// Insert or replace.
    Upsert(ConfigurationRecord),
    /// Remove.
    Delete {
        /// Removed configuration.
        id: ConfigId,
    },
}

/// Everything one operation writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOfWork {
    /// Component rows to upsert.
    pub rows: Vec<ComponentRow>,
    /// Configuration change, if any.
    pub configuration: Option<ConfigurationChange>,
    /// Journal entries to append.
    pub journal: Vec<JournalEntry>,
}

/// Full persisted state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    /// Ledger rows.
    pub components: Vec<ComponentRow>,
    /// Configurations.
    pub configurations: Vec<ConfigurationRecord>,
    /// Claim journal.
    pub journal: Vec<JournalEntry>,
}

impl Snapshot {
    /// Apply a unit of work in place.
    pub fn apply(&mut self, unit: &UnitOfWork) {
        for row in &unit.rows {
            match self.components.iter_mut().find(|r| r.key == row.key) {
                Some(existing) => *existing = row.clone(),
                None => self.components.push(row.clone()),
            }
        }
        match &unit.configuration {
            Some(ConfigurationChange::Upsert(record)) => {
                match self.configurations.iter_mut().find(|c| c.id == record.id) {
                    Some(existing) => *existing = record.clone(),
                    None => self.configurations.push(record.clone()),
                }
            }
            Some(ConfigurationChange::Delete { id }) => {
                self.configurations.retain(|c| &c.id != id);
            }
            None => {}
        }
        self.journal.extend(unit.journal.iter().cloned());
    }
}

/// Persistence backend.
pub trait Store: Send + Sync {
    /// Persist `unit` atomically: afterwards either all of it or none of it
    /// is visible.
    fn commit(&self, unit: &UnitOfWork) -> Result<(), StoreError>;

    /// Load everything persisted so far.
    fn snapshot(&self) -> Result<Snapshot, StoreError>;
}

/// Volatile store, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Snapshot>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn commit(&self, unit: &UnitOfWork) -> Result<(), StoreError> {
        self.state.lock().apply(unit);
        Ok(())
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        Ok(self.state.lock().clone())
    }
}

/// Whole-state JSON file. Each commit writes a sibling temp file and renames
/// it over the original.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<Snapshot>,
}

impl JsonFileStore {
    /// Open `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let bytes =
                fs::read(&path).map_err(|e| StoreError::Io(format!("read state: {e}")))?;
            serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Encoding(format!("decode {}: {e}", path.display())))?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Io(format!("create state dir: {e}")))?;
            }
            Snapshot::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| StoreError::Encoding(format!("encode state: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes).map_err(|e| StoreError::Io(format!("write state: {e}")))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            error!("state rename failed, keeping previous file: {e}");
            StoreError::Io(format!("replace state: {e}"))
        })
    }
}

impl Store for JsonFileStore {
    fn commit(&self, unit: &UnitOfWork) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        next.apply(unit);
        self.write(&next)?;
        debug!(
            "committed {} row(s), {} journal entr(ies) to {}",
            unit.rows.len(),
            unit.journal.len(),
            self.path.display()
        );
        *state = next;
        Ok(())
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        Ok(self.state.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rack_spec::{ComponentKey, ComponentStatus, ComponentType, ConfigMode};
    use tempfile::tempdir;

    fn row(id: &str) -> ComponentRow {
        ComponentRow::available(ComponentKey::new(ComponentType::Cpu, id))
    }

    #[test]
    fn apply_upserts_rows_and_configurations() {
        let mut snap = Snapshot::default();
        let record = ConfigurationRecord::new("cfg".into(), "web", ConfigMode::Real, 1);
        snap.apply(&UnitOfWork {
            rows: vec![row("c1")],
            configuration: Some(ConfigurationChange::Upsert(record.clone())),
            journal: Vec::new(),
        });
        let mut claimed = row("c1");
        claimed.status = ComponentStatus::InUse;
        snap.apply(&UnitOfWork {
            rows: vec![claimed.clone()],
            ..UnitOfWork::default()
        });
        assert_eq!(snap.components, vec![claimed]);
        assert_eq!(snap.configurations, vec![record]);

        snap.apply(&UnitOfWork {
            configuration: Some(ConfigurationChange::Delete { id: "cfg".into() }),
            ..UnitOfWork::default()
        });
        assert!(snap.configurations.is_empty());
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/rack.json");
        {
            let store = JsonFileStore::open(&path).unwrap();
            store
                .commit(&UnitOfWork {
                    rows: vec![row("c1"), row("c2")],
                    ..UnitOfWork::default()
                })
                .unwrap();
        }
        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.snapshot().unwrap().components.len(), 2);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn corrupt_state_is_an_encoding_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rack.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StoreError::Encoding(_))
        ));
    }
}
