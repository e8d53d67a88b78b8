//! Rack spec: shared identity, status, and lifecycle types for components and
//! server configurations, plus the attribute records served by the
//! specification oracle.
#![deny(missing_docs)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod attributes;
pub mod oracle;

pub use attributes::{
    AttributeSource, BayGroup, BayInterface, ChassisSpec, ComponentSpec, CpuSpec, ExpansionSpec,
    MemoryType, MotherboardSpec, PcieSlotGroup, PcieWidth, RamSpec, SlotRequirement, StorageFormFactor,
    StorageSpec,
};
pub use oracle::{OracleError, SpecificationOracle};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Parse failure for textual identifiers and enum names.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Unknown component type name.
    #[error("unknown component type: {0}")]
    ComponentType(String),
    /// Unknown configuration mode name.
    #[error("unknown configuration mode: {0}")]
    Mode(String),
    /// Unknown memory type name.
    #[error("unknown memory type: {0}")]
    MemoryType(String),
    /// Unknown PCIe width.
    #[error("unknown pcie width: {0}")]
    PcieWidth(String),
}

/// Kind of physical inventory unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    /// Processor.
    Cpu,
    /// Mainboard; declares sockets and native slot capacity.
    Motherboard,
    /// Memory module.
    Ram,
    /// Drive (M.2 or bay-mounted).
    Storage,
    /// Network interface card.
    Nic,
    /// Generic PCIe add-in card.
    PcieCard,
    /// Host bus adapter.
    HbaCard,
    /// Riser card; occupies one slot and exposes its own.
    Riser,
    /// Enclosure.
    Chassis,
}

impl ComponentType {
    /// Every component type, in conventional build order.
    pub const ALL: [ComponentType; 9] = [
        ComponentType::Chassis,
        ComponentType::Motherboard,
        ComponentType::Cpu,
        ComponentType::Ram,
        ComponentType::Storage,
        ComponentType::Riser,
        ComponentType::PcieCard,
        ComponentType::Nic,
        ComponentType::HbaCard,
    ];

    /// Machine name used in serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Motherboard => "motherboard",
            Self::Ram => "ram",
            Self::Storage => "storage",
            Self::Nic => "nic",
            Self::PcieCard => "pcie_card",
            Self::HbaCard => "hba_card",
            Self::Riser => "riser",
            Self::Chassis => "chassis",
        }
    }

    /// Whether the type is an add-in card seated in a PCIe slot.
    pub fn is_expansion(self) -> bool {
        matches!(
            self,
            Self::Nic | Self::PcieCard | Self::HbaCard | Self::Riser
        )
    }

    /// Whether at most one unit of this type may sit in a configuration.
    pub fn is_single_instance(self) -> bool {
        matches!(self, Self::Motherboard | Self::Chassis)
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match norm.as_str() {
            "cpu" | "processor" => Ok(Self::Cpu),
            "motherboard" | "mainboard" | "mobo" => Ok(Self::Motherboard),
            "ram" | "memory" | "dimm" => Ok(Self::Ram),
            "storage" | "drive" | "disk" => Ok(Self::Storage),
            "nic" => Ok(Self::Nic),
            "pciecard" | "pcie" => Ok(Self::PcieCard),
            "hbacard" | "hba" => Ok(Self::HbaCard),
            "riser" | "risercard" => Ok(Self::Riser),
            "chassis" | "case" => Ok(Self::Chassis),
            _ => Err(ParseError::ComponentType(s.to_string())),
        }
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a component, unique within its type.
    ComponentId
);

string_id!(
    /// Identifier of a server configuration.
    ConfigId
);

string_id!(
    /// Identifier of a physical slot, unique within one configuration.
    SlotId
);

/// Full identity of a physical component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentKey {
    /// Component type.
    #[serde(rename = "type")]
    pub kind: ComponentType,
    /// Identifier within the type.
    pub id: ComponentId,
}

impl ComponentKey {
    /// Build a key from parts.
    pub fn new(kind: ComponentType, id: impl Into<ComponentId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Ownership status of a component row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    /// Free to claim.
    #[default]
    Available,
    /// Claimed by a configuration.
    InUse,
    /// Out of service; only the repair workflow may return it.
    Failed,
}

/// Configuration lifecycle state. Ordering follows the lifecycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ConfigStatus {
    /// Being assembled.
    #[default]
    Draft,
    /// Last validation passed.
    Validated,
    /// Physically built.
    Built,
    /// Permanent record; mutations need an elevated reopen.
    Finalized,
}

/// Whether a configuration's claims touch shared inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigMode {
    /// Claims change component status.
    #[default]
    Real,
    /// Claims are virtual; the configuration can never be finalized.
    Test,
}

impl FromStr for ConfigMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "real" => Ok(Self::Real),
            "test" => Ok(Self::Test),
            _ => Err(ParseError::Mode(s.to_string())),
        }
    }
}

/// Caller privilege for lifecycle-guarded mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    /// Ordinary operator.
    #[default]
    Standard,
    /// May mutate built configurations and reopen finalized ones.
    Elevated,
}
