//! Persisted configuration records.

use serde::{Deserialize, Serialize};

use rack_spec::{ComponentKey, ComponentType, ConfigId, ConfigMode, ConfigStatus, SlotId, Timestamp};

use crate::slots::SlotPool;

/// A component's membership in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentAssociation {
    /// Owning configuration.
    pub config: ConfigId,
    /// Member component.
    pub component: ComponentKey,
    /// Units; always 1 for slot-bound components.
    pub quantity: u32,
    /// Assigned slot, if placed.
    pub slot: Option<SlotId>,
    /// Test-mode claim; the ledger row was not written.
    #[serde(default)]
    pub virtual_claim: bool,
    /// Configuration the component was pre-empted from.
    #[serde(default)]
    pub preempted_from: Option<ConfigId>,
    /// When the component was added.
    pub added_at: Timestamp,
}

/// A server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationRecord {
    /// Identifier.
    pub id: ConfigId,
    /// Display name.
    pub name: String,
    /// Lifecycle state.
    pub status: ConfigStatus,
    /// Real or test.
    pub mode: ConfigMode,
    /// Creation time.
    pub created_at: Timestamp,
    /// Set once finalized.
    #[serde(default)]
    pub finalized_at: Option<Timestamp>,
    /// Members, in insertion order.
    #[serde(default)]
    pub associations: Vec<ComponentAssociation>,
    /// Slot pool; present once a motherboard is in.
    #[serde(default)]
    pub pool: Option<SlotPool>,
}

impl ConfigurationRecord {
    /// Fresh draft.
    pub fn new(id: ConfigId, name: impl Into<String>, mode: ConfigMode, created_at: Timestamp) -> Self {
        Self {
            id,
            name: name.into(),
            status: ConfigStatus::Draft,
            mode,
            created_at,
            finalized_at: None,
            associations: Vec::new(),
            pool: None,
        }
    }

    /// Membership of `key`.
    pub fn association(&self, key: &ComponentKey) -> Option<&ComponentAssociation> {
        self.associations.iter().find(|a| &a.component == key)
    }

    /// Whether `key` is a member.
    pub fn contains(&self, key: &ComponentKey) -> bool {
        self.association(key).is_some()
    }

    /// Members of one type.
    pub fn of_kind(&self, kind: ComponentType) -> impl Iterator<Item = &ComponentAssociation> {
        self.associations
            .iter()
            .filter(move |a| a.component.kind == kind)
    }

    /// Total units of one type.
    pub fn quantity_of(&self, kind: ComponentType) -> u64 {
        self.of_kind(kind).map(|a| u64::from(a.quantity)).sum()
    }
}
