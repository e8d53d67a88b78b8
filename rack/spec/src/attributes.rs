//! Technical attribute records returned by the specification oracle.
//!
//! Every field is optional: the oracle may know a part only partially, and
//! absent data is a valid outcome that the evaluator reports as
//! undetermined rather than compatible.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ComponentType, ParseError};

/// Where a resolved attribute record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeSource {
    /// Structured oracle entry.
    Structured,
    /// Parsed from free-text inventory notes; lower confidence.
    InferredFromText,
    /// Nothing derivable.
    Unknown,
}

/// DRAM generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MemoryType {
    /// DDR3.
    #[serde(rename = "DDR3")]
    Ddr3,
    /// DDR4.
    #[serde(rename = "DDR4")]
    Ddr4,
    /// DDR5.
    #[serde(rename = "DDR5")]
    Ddr5,
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ddr3 => "DDR3",
            Self::Ddr4 => "DDR4",
            Self::Ddr5 => "DDR5",
        };
        f.write_str(name)
    }
}

impl FromStr for MemoryType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace([' ', '-'], "").as_str() {
            "DDR3" => Ok(Self::Ddr3),
            "DDR4" => Ok(Self::Ddr4),
            "DDR5" => Ok(Self::Ddr5),
            _ => Err(ParseError::MemoryType(s.to_string())),
        }
    }
}

/// Electrical/mechanical PCIe link width. Ordered narrowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PcieWidth {
    /// x1.
    #[serde(rename = "x1")]
    X1,
    /// x2.
    #[serde(rename = "x2")]
    X2,
    /// x4.
    #[serde(rename = "x4")]
    X4,
    /// x8.
    #[serde(rename = "x8")]
    X8,
    /// x16.
    #[serde(rename = "x16")]
    X16,
}

impl PcieWidth {
    /// Lane count.
    pub fn lanes(self) -> u32 {
        match self {
            Self::X1 => 1,
            Self::X2 => 2,
            Self::X4 => 4,
            Self::X8 => 8,
            Self::X16 => 16,
        }
    }

    /// Width for an exact lane count.
    pub fn from_lanes(lanes: u32) -> Option<Self> {
        match lanes {
            1 => Some(Self::X1),
            2 => Some(Self::X2),
            4 => Some(Self::X4),
            8 => Some(Self::X8),
            16 => Some(Self::X16),
            _ => None,
        }
    }
}

impl fmt::Display for PcieWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.lanes())
    }
}

impl FromStr for PcieWidth {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches(['x', 'X']);
        digits
            .parse::<u32>()
            .ok()
            .and_then(Self::from_lanes)
            .ok_or_else(|| ParseError::PcieWidth(s.to_string()))
    }
}

/// Drive bay / port interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BayInterface {
    /// SATA.
    Sata,
    /// SAS; backplanes also accept SATA drives.
    Sas,
    /// NVMe (U.2/U.3).
    Nvme,
}

impl fmt::Display for BayInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sata => "sata",
            Self::Sas => "sas",
            Self::Nvme => "nvme",
        };
        f.write_str(name)
    }
}

/// Drive form factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageFormFactor {
    /// M.2 module.
    #[serde(rename = "m2")]
    M2,
    /// 2.5 inch.
    #[serde(rename = "2.5in")]
    Bay25,
    /// 3.5 inch.
    #[serde(rename = "3.5in")]
    Bay35,
}

/// A group of identical PCIe slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcieSlotGroup {
    /// Slot width.
    pub width: PcieWidth,
    /// Number of slots.
    pub count: u32,
}

/// A group of identical drive bays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BayGroup {
    /// Bay interface.
    pub interface: BayInterface,
    /// Number of bays.
    pub count: u32,
}

/// Processor attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuSpec {
    /// Socket name as published by the vendor.
    pub socket: Option<String>,
    /// Supported memory generations.
    pub memory_types: Vec<MemoryType>,
    /// Highest supported memory frequency.
    pub max_memory_mhz: Option<u32>,
    /// ECC support.
    pub ecc: Option<bool>,
    /// PCIe lanes provided.
    pub pcie_lanes: Option<u32>,
}

/// Mainboard attributes, including native slot capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotherboardSpec {
    /// CPU socket name.
    pub socket: Option<String>,
    /// Number of CPU sockets.
    pub socket_count: Option<u32>,
    /// Supported memory generations.
    pub memory_types: Vec<MemoryType>,
    /// Highest supported memory frequency.
    pub max_memory_mhz: Option<u32>,
    /// ECC support.
    pub ecc: Option<bool>,
    /// DIMM slot count.
    pub dimm_slots: Option<u32>,
    /// Native PCIe slots.
    pub pcie_slots: Vec<PcieSlotGroup>,
    /// M.2 slot count.
    pub m2_slots: Option<u32>,
    /// Drive bays / ports.
    pub bays: Vec<BayGroup>,
    /// Board form factor (e.g. "EATX").
    pub form_factor: Option<String>,
}

/// Memory module attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RamSpec {
    /// DRAM generation.
    pub memory_type: Option<MemoryType>,
    /// Rated frequency.
    pub frequency_mhz: Option<u32>,
    /// ECC module.
    pub ecc: Option<bool>,
    /// Module capacity.
    pub capacity_gb: Option<u32>,
}

/// Drive attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSpec {
    /// Drive interface.
    pub interface: Option<BayInterface>,
    /// Drive form factor.
    pub form_factor: Option<StorageFormFactor>,
    /// Capacity.
    pub capacity_gb: Option<u32>,
}

/// Add-in card attributes (PCIe cards, NICs, HBAs, risers).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionSpec {
    /// Slot width the card needs.
    pub pcie_width: Option<PcieWidth>,
    /// Slots exposed by the card; non-empty only for risers.
    pub provides: Vec<PcieSlotGroup>,
}

/// Enclosure attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChassisSpec {
    /// Mainboard form factors that fit.
    pub form_factors: Vec<String>,
    /// Drive bays in the enclosure.
    pub drive_bays: Option<u32>,
}

/// Per-type attribute record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComponentSpec {
    /// Processor.
    Cpu(CpuSpec),
    /// Mainboard.
    Motherboard(MotherboardSpec),
    /// Memory module.
    Ram(RamSpec),
    /// Drive.
    Storage(StorageSpec),
    /// Add-in card.
    Expansion(ExpansionSpec),
    /// Enclosure.
    Chassis(ChassisSpec),
}

impl ComponentSpec {
    /// Whether this record shape describes the given component type.
    pub fn describes(&self, kind: ComponentType) -> bool {
        match self {
            Self::Cpu(_) => kind == ComponentType::Cpu,
            Self::Motherboard(_) => kind == ComponentType::Motherboard,
            Self::Ram(_) => kind == ComponentType::Ram,
            Self::Storage(_) => kind == ComponentType::Storage,
            Self::Expansion(_) => kind.is_expansion(),
            Self::Chassis(_) => kind == ComponentType::Chassis,
        }
    }

    /// True when no attribute at all is derivable from the record.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Cpu(c) => {
                c.socket.is_none()
                    && c.memory_types.is_empty()
                    && c.max_memory_mhz.is_none()
                    && c.ecc.is_none()
                    && c.pcie_lanes.is_none()
            }
            Self::Motherboard(m) => {
                m.socket.is_none()
                    && m.socket_count.is_none()
                    && m.memory_types.is_empty()
                    && m.max_memory_mhz.is_none()
                    && m.ecc.is_none()
                    && m.dimm_slots.is_none()
                    && m.pcie_slots.is_empty()
                    && m.m2_slots.is_none()
                    && m.bays.is_empty()
                    && m.form_factor.is_none()
            }
            Self::Ram(r) => {
                r.memory_type.is_none()
                    && r.frequency_mhz.is_none()
                    && r.ecc.is_none()
                    && r.capacity_gb.is_none()
            }
            Self::Storage(s) => {
                s.interface.is_none() && s.form_factor.is_none() && s.capacity_gb.is_none()
            }
            Self::Expansion(e) => e.pcie_width.is_none() && e.provides.is_empty(),
            Self::Chassis(c) => c.form_factors.is_empty() && c.drive_bays.is_none(),
        }
    }

    /// Physical slot the component occupies, when derivable.
    pub fn slot_requirement(&self) -> Option<SlotRequirement> {
        match self {
            Self::Ram(_) => Some(SlotRequirement::Dimm),
            Self::Storage(s) => match (s.form_factor, s.interface) {
                (Some(StorageFormFactor::M2), _) => Some(SlotRequirement::M2),
                (_, Some(iface)) => Some(SlotRequirement::Bay(iface)),
                _ => None,
            },
            Self::Expansion(e) => e.pcie_width.map(SlotRequirement::Pcie),
            _ => None,
        }
    }

    /// Slot groups a riser exposes; empty for everything else.
    pub fn provided_slots(&self) -> &[PcieSlotGroup] {
        match self {
            Self::Expansion(e) => &e.provides,
            _ => &[],
        }
    }
}

/// Slot class a component must be placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "class", content = "spec", rename_all = "snake_case")]
pub enum SlotRequirement {
    /// A PCIe slot at least this wide.
    Pcie(PcieWidth),
    /// A DIMM slot.
    Dimm,
    /// An M.2 slot.
    M2,
    /// A drive bay of this interface (SATA may fall back to SAS).
    Bay(BayInterface),
}

impl fmt::Display for SlotRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pcie(w) => write!(f, "pcie {w}"),
            Self::Dimm => f.write_str("dimm"),
            Self::M2 => f.write_str("m.2"),
            Self::Bay(i) => write!(f, "{i} bay"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_is_tagged_by_kind() {
        let json = serde_json::json!({
            "kind": "cpu",
            "socket": "LGA4189",
            "memory_types": ["DDR4"],
            "max_memory_mhz": 3200
        });
        let spec: ComponentSpec = serde_json::from_value(json).unwrap();
        match spec {
            ComponentSpec::Cpu(cpu) => {
                assert_eq!(cpu.socket.as_deref(), Some("LGA4189"));
                assert_eq!(cpu.memory_types, vec![MemoryType::Ddr4]);
                assert_eq!(cpu.ecc, None);
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn storage_requirement_prefers_m2_form_factor() {
        let m2 = ComponentSpec::Storage(StorageSpec {
            interface: Some(BayInterface::Nvme),
            form_factor: Some(StorageFormFactor::M2),
            capacity_gb: None,
        });
        assert_eq!(m2.slot_requirement(), Some(SlotRequirement::M2));

        let sas = ComponentSpec::Storage(StorageSpec {
            interface: Some(BayInterface::Sas),
            form_factor: Some(StorageFormFactor::Bay25),
            capacity_gb: None,
        });
        assert_eq!(sas.slot_requirement(), Some(SlotRequirement::Bay(BayInterface::Sas)));

        let unknown = ComponentSpec::Storage(StorageSpec::default());
        assert_eq!(unknown.slot_requirement(), None);
        assert!(unknown.is_empty());
    }

    #[test]
    fn pcie_width_parses_and_orders() {
        assert_eq!("x8".parse::<PcieWidth>(), Ok(PcieWidth::X8));
        assert_eq!("16".parse::<PcieWidth>(), Ok(PcieWidth::X16));
        assert!("x3".parse::<PcieWidth>().is_err());
        assert!(PcieWidth::X4 < PcieWidth::X16);
    }

    #[test]
    fn expansion_spec_describes_all_card_types() {
        let card = ComponentSpec::Expansion(ExpansionSpec::default());
        assert!(card.describes(ComponentType::Nic));
        assert!(card.describes(ComponentType::Riser));
        assert!(!card.describes(ComponentType::Ram));
    }
}
