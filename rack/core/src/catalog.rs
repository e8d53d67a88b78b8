//! Component catalog: the onboarding source for ledger rows and the
//! file-backed specification oracle.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rack_spec::{
    ComponentId, ComponentKey, ComponentSpec, ComponentStatus, ComponentType, OracleError,
    SpecificationOracle,
};

use crate::ledger::ComponentRow;

/// Catalog load failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// File could not be read.
    #[error("catalog io error: {0}")]
    Io(String),
    /// File is not a valid catalog document.
    #[error("catalog parse error: {0}")]
    Parse(String),
    /// Same `(type, id)` listed twice.
    #[error("duplicate catalog entry {0}")]
    Duplicate(ComponentKey),
    /// Entry is inconsistent.
    #[error("invalid catalog entry {key}: {reason}")]
    Invalid {
        /// Offending entry.
        key: ComponentKey,
        /// What is wrong.
        reason: String,
    },
}

/// One catalog line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Component type.
    #[serde(rename = "type")]
    pub kind: ComponentType,
    /// Identifier within the type.
    pub id: ComponentId,
    /// Initial status; `available` or `failed`.
    #[serde(default)]
    pub status: ComponentStatus,
    /// Free-text notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Structured attributes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ComponentSpec>,
}

impl CatalogEntry {
    /// Identity of the entry.
    pub fn key(&self) -> ComponentKey {
        ComponentKey::new(self.kind, self.id.clone())
    }
}

/// Validated catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// Validate a list of entries.
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            let key = entry.key();
            if entry.status == ComponentStatus::InUse {
                return Err(CatalogError::Invalid {
                    key,
                    reason: "components are onboarded available or failed".into(),
                });
            }
            if let Some(spec) = &entry.spec {
                if !spec.describes(entry.kind) {
                    return Err(CatalogError::Invalid {
                        key,
                        reason: "spec kind does not match component type".into(),
                    });
                }
            }
            if !seen.insert(key.clone()) {
                return Err(CatalogError::Duplicate(key));
            }
        }
        Ok(Self { entries })
    }

    /// Parse a JSON catalog document.
    pub fn from_json(text: &str) -> Result<Self, CatalogError> {
        let entries: Vec<CatalogEntry> =
            serde_json::from_str(text).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Self::from_entries(entries)
    }

    /// Load a JSON catalog file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| CatalogError::Io(format!("read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Entries in file order.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Ledger rows to provision.
    pub fn rows(&self) -> Vec<ComponentRow> {
        self.entries
            .iter()
            .map(|e| ComponentRow {
                key: e.key(),
                status: e.status,
                owner: None,
                notes: e.notes.clone(),
            })
            .collect()
    }

    /// Oracle serving the structured records.
    pub fn oracle(&self) -> CatalogOracle {
        CatalogOracle {
            specs: self
                .entries
                .iter()
                .filter_map(|e| Some((e.key(), e.spec.clone()?)))
                .collect(),
        }
    }
}

/// In-memory oracle over catalog records.
#[derive(Debug, Clone, Default)]
pub struct CatalogOracle {
    specs: HashMap<ComponentKey, ComponentSpec>,
}

impl CatalogOracle {
    /// Oracle over explicit records.
    pub fn new(specs: impl IntoIterator<Item = (ComponentKey, ComponentSpec)>) -> Self {
        Self {
            specs: specs.into_iter().collect(),
        }
    }
}

impl SpecificationOracle for CatalogOracle {
    fn lookup(&self, key: &ComponentKey) -> Result<Option<ComponentSpec>, OracleError> {
        Ok(self.specs.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {"type": "cpu", "id": "c1", "spec": {"kind": "cpu", "socket": "LGA4189"}},
        {"type": "ram", "id": "r1", "notes": "32GB DDR5 4800 MHz"},
        {"type": "nic", "id": "n1", "status": "failed"}
    ]"#;

    #[test]
    fn loads_rows_and_oracle() {
        let catalog = Catalog::from_json(SAMPLE).unwrap();
        let rows = catalog.rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].status, ComponentStatus::Failed);
        assert_eq!(rows[1].notes.as_deref(), Some("32GB DDR5 4800 MHz"));

        let oracle = catalog.oracle();
        let cpu = ComponentKey::new(ComponentType::Cpu, "c1");
        assert!(oracle.lookup(&cpu).unwrap().is_some());
        let ram = ComponentKey::new(ComponentType::Ram, "r1");
        assert_eq!(oracle.lookup(&ram).unwrap(), None);
    }

    #[test]
    fn rejects_duplicates_and_mismatched_specs() {
        let dup = r#"[{"type": "cpu", "id": "c1"}, {"type": "cpu", "id": "c1"}]"#;
        assert!(matches!(Catalog::from_json(dup), Err(CatalogError::Duplicate(_))));

        let wrong = r#"[{"type": "ram", "id": "r1", "spec": {"kind": "cpu"}}]"#;
        assert!(matches!(
            Catalog::from_json(wrong),
            Err(CatalogError::Invalid { .. })
        ));

        let in_use = r#"[{"type": "ram", "id": "r1", "status": "in_use"}]"#;
        assert!(matches!(
            Catalog::from_json(in_use),
            Err(CatalogError::Invalid { .. })
        ));
    }

    #[test]
    fn unknown_type_is_a_parse_error() {
        let bad = r#"[{"type": "gpu", "id": "g1"}]"#;
        assert!(matches!(Catalog::from_json(bad), Err(CatalogError::Parse(_))));
    }
}
