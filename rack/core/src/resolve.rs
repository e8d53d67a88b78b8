//! Attribute resolution: structured oracle lookup first, free-text inventory
//! notes as a lower-confidence fallback.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use rack_spec::{
    AttributeSource, BayGroup, BayInterface, ChassisSpec, ComponentKey, ComponentSpec,
    ComponentType, CpuSpec, ExpansionSpec, MemoryType, MotherboardSpec, OracleError,
    PcieSlotGroup, PcieWidth, RamSpec, SlotRequirement, SpecificationOracle, StorageFormFactor,
    StorageSpec,
};

/// Attributes of one component together with their provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSpec {
    /// Where the attributes came from.
    pub source: AttributeSource,
    /// Attribute record; `None` when nothing is derivable.
    pub spec: Option<ComponentSpec>,
    /// Oracle failure encountered while resolving, if any.
    #[serde(skip)]
    pub lookup_error: Option<OracleError>,
}

impl ResolvedSpec {
    /// Structured record straight from the oracle.
    pub fn structured(spec: ComponentSpec) -> Self {
        Self {
            source: AttributeSource::Structured,
            spec: Some(spec),
            lookup_error: None,
        }
    }

    /// Nothing known.
    pub fn unknown() -> Self {
        Self {
            source: AttributeSource::Unknown,
            spec: None,
            lookup_error: None,
        }
    }

    /// Whether any attribute is derivable.
    pub fn has_attributes(&self) -> bool {
        self.spec.is_some()
    }

    /// Whether the record came from text inference.
    pub fn is_inferred(&self) -> bool {
        self.source == AttributeSource::InferredFromText
    }

    /// Processor attributes.
    pub fn cpu(&self) -> Option<&CpuSpec> {
        match &self.spec {
            Some(ComponentSpec::Cpu(c)) => Some(c),
            _ => None,
        }
    }

    /// Mainboard attributes.
    pub fn motherboard(&self) -> Option<&MotherboardSpec> {
        match &self.spec {
            Some(ComponentSpec::Motherboard(m)) => Some(m),
            _ => None,
        }
    }

    /// Memory attributes.
    pub fn ram(&self) -> Option<&RamSpec> {
        match &self.spec {
            Some(ComponentSpec::Ram(r)) => Some(r),
            _ => None,
        }
    }

    /// Add-in card attributes.
    pub fn expansion(&self) -> Option<&ExpansionSpec> {
        match &self.spec {
            Some(ComponentSpec::Expansion(e)) => Some(e),
            _ => None,
        }
    }

    /// Enclosure attributes.
    pub fn chassis(&self) -> Option<&ChassisSpec> {
        match &self.spec {
            Some(ComponentSpec::Chassis(c)) => Some(c),
            _ => None,
        }
    }

    /// Slot the component must occupy, when derivable.
    pub fn slot_requirement(&self) -> Option<SlotRequirement> {
        self.spec.as_ref().and_then(ComponentSpec::slot_requirement)
    }
}

/// Resolve a component's attributes. Never fails: oracle errors are kept on
/// the result and the notes fallback is tried.
pub fn resolve(
    oracle: &dyn SpecificationOracle,
    key: &ComponentKey,
    notes: Option<&str>,
) -> ResolvedSpec {
    let lookup_error = match oracle.lookup(key) {
        Ok(Some(spec)) if spec.describes(key.kind) && !spec.is_empty() => {
            return ResolvedSpec::structured(spec);
        }
        Ok(Some(spec)) if !spec.describes(key.kind) => {
            warn!("oracle record for {key} does not describe a {}", key.kind);
            Some(OracleError::Malformed {
                key: key.clone(),
                reason: "record kind does not match component type".into(),
            })
        }
        Ok(_) => None,
        Err(err) => {
            warn!("oracle lookup for {key} failed: {err}");
            Some(err)
        }
    };
    match notes.and_then(|text| infer_from_text(key.kind, text)) {
        Some(spec) => {
            debug!("inferred attributes for {key} from notes");
            ResolvedSpec {
                source: AttributeSource::InferredFromText,
                spec: Some(spec),
                lookup_error,
            }
        }
        None => ResolvedSpec {
            lookup_error,
            ..ResolvedSpec::unknown()
        },
    }
}

/// Best-effort attribute extraction from free-text notes such as
/// `"Xeon Gold 6338, LGA4189, DDR4-3200, 64 lanes"`.
pub fn infer_from_text(kind: ComponentType, text: &str) -> Option<ComponentSpec> {
    let t = Tokens::new(text);
    let spec = match kind {
        ComponentType::Cpu => ComponentSpec::Cpu(CpuSpec {
            socket: t.socket(),
            memory_types: t.memory_types(),
            max_memory_mhz: t.frequency(),
            ecc: t.ecc(),
            pcie_lanes: t.count_before(&["LANES", "LANE"]),
        }),
        ComponentType::Motherboard => ComponentSpec::Motherboard(MotherboardSpec {
            socket: t.socket(),
            socket_count: t.socket_count(),
            memory_types: t.memory_types(),
            max_memory_mhz: t.frequency(),
            ecc: t.ecc(),
            dimm_slots: t.count_before(&["DIMM", "DIMMS"]),
            pcie_slots: t.slot_groups(),
            m2_slots: t.count_before(&["M.2", "M2"]),
            bays: t.bay_groups(),
            form_factor: t.form_factors().into_iter().next(),
        }),
        ComponentType::Ram => ComponentSpec::Ram(RamSpec {
            memory_type: t.memory_types().into_iter().next(),
            frequency_mhz: t.frequency(),
            ecc: t.ecc(),
            capacity_gb: t.capacity_gb(),
        }),
        ComponentType::Storage => ComponentSpec::Storage(StorageSpec {
            interface: t.interface(),
            form_factor: t.storage_form_factor(),
            capacity_gb: t.capacity_gb(),
        }),
        ComponentType::Riser => ComponentSpec::Expansion(ExpansionSpec {
            pcie_width: t.width(),
            provides: t.slot_groups(),
        }),
        ComponentType::Nic | ComponentType::PcieCard | ComponentType::HbaCard => {
            ComponentSpec::Expansion(ExpansionSpec {
                pcie_width: t.width(),
                provides: Vec::new(),
            })
        }
        ComponentType::Chassis => ComponentSpec::Chassis(ChassisSpec {
            form_factors: t.form_factors(),
            drive_bays: t.count_before(&["BAY", "BAYS"]),
        }),
    };
    (!spec.is_empty()).then_some(spec)
}

struct Tokens(Vec<String>);

impl Tokens {
    fn new(text: &str) -> Self {
        let tokens = text
            .split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '(' | ')' | '[' | ']' | '|'))
            .map(|t| {
                t.trim_matches(|c: char| matches!(c, '.' | ':' | '"' | '\''))
                    .to_ascii_uppercase()
            })
            .filter(|t| !t.is_empty())
            .collect();
        Self(tokens)
    }

    fn next_of(&self, idx: usize) -> Option<&str> {
        self.0.get(idx + 1).map(String::as_str)
    }

    fn socket(&self) -> Option<String> {
        for (idx, tok) in self.0.iter().enumerate() {
            let tok = tok.replace('-', "");
            let tok = tok.strip_prefix("SOCKET").unwrap_or(tok.as_str());
            let tok = tok.strip_prefix("FC").unwrap_or(tok);
            if tok == "LGA" {
                if let Some(next) = self.next_of(idx).filter(|n| is_digits(n)) {
                    return Some(format!("LGA{next}"));
                }
            }
            for prefix in ["LGA", "AM", "SP", "TR", "STRX", "SWRX"] {
                if let Some(rest) = tok.strip_prefix(prefix) {
                    if is_digits(rest) {
                        return Some(tok.to_string());
                    }
                }
            }
        }
        None
    }

    fn socket_count(&self) -> Option<u32> {
        self.0.iter().find_map(|t| match t.as_str() {
            "DUAL" | "2S" | "2P" | "DUAL-SOCKET" => Some(2),
            "QUAD" | "4S" | "4P" | "QUAD-SOCKET" => Some(4),
            "SINGLE" | "1S" | "1P" | "SINGLE-SOCKET" => Some(1),
            _ => None,
        })
    }

    fn memory_types(&self) -> Vec<MemoryType> {
        let mut found = Vec::new();
        for tok in &self.0 {
            let head: String = tok.chars().take(4).collect();
            if let Ok(kind) = head.parse::<MemoryType>() {
                if !found.contains(&kind) {
                    found.push(kind);
                }
            }
        }
        found
    }

    fn frequency(&self) -> Option<u32> {
        for (idx, tok) in self.0.iter().enumerate() {
            if let Some(rest) = tok.strip_prefix("DDR").and_then(|r| r.get(1..)) {
                if let Some(n) = rest.strip_prefix('-').and_then(|r| leading_number(r).map(|p| p.0))
                {
                    return Some(n);
                }
            }
            if let Some((n, unit)) = leading_number(tok) {
                let unit = if unit.is_empty() {
                    self.next_of(idx).unwrap_or_default()
                } else {
                    unit
                };
                if matches!(unit, "MHZ" | "MT/S" | "MTS" | "MT") {
                    return Some(n);
                }
            }
        }
        None
    }

    fn ecc(&self) -> Option<bool> {
        let mut ecc = None;
        for (idx, tok) in self.0.iter().enumerate() {
            match tok.as_str() {
                "NON-ECC" | "NONECC" | "UDIMM" => return Some(false),
                "ECC" if idx > 0 && matches!(self.0[idx - 1].as_str(), "NO" | "NON") => {
                    return Some(false)
                }
                "ECC" | "RDIMM" | "LRDIMM" | "REGISTERED" => ecc = Some(true),
                _ => {}
            }
        }
        ecc
    }

    fn width(&self) -> Option<PcieWidth> {
        self.0.iter().find_map(|t| {
            let rest = t.strip_prefix("PCIE").unwrap_or(t.as_str());
            if rest.starts_with('X') {
                rest.parse().ok()
            } else {
                None
            }
        })
    }

    /// `2X8` style tokens: count and width.
    fn slot_groups(&self) -> Vec<PcieSlotGroup> {
        self.0
            .iter()
            .filter_map(|t| {
                let (count, rest) = leading_number(t)?;
                let width: PcieWidth = rest.strip_prefix('X')?.trim_start_matches('X').parse().ok()?;
                (count > 0).then_some(PcieSlotGroup { width, count })
            })
            .collect()
    }

    fn bay_groups(&self) -> Vec<BayGroup> {
        let mut groups = Vec::new();
        for (idx, tok) in self.0.iter().enumerate() {
            let Some((count, "")) = leading_number(tok) else {
                continue;
            };
            let interface = match self.next_of(idx) {
                Some("SATA") => BayInterface::Sata,
                Some("SAS") => BayInterface::Sas,
                Some("NVME" | "U.2") => BayInterface::Nvme,
                _ => continue,
            };
            groups.push(BayGroup { interface, count });
        }
        groups
    }

    fn capacity_gb(&self) -> Option<u32> {
        for (idx, tok) in self.0.iter().enumerate() {
            if let Some((n, unit)) = leading_number(tok) {
                let unit = if unit.is_empty() {
                    self.next_of(idx).unwrap_or_default()
                } else {
                    unit
                };
                match unit {
                    "GB" => return Some(n),
                    "TB" => return Some(n.saturating_mul(1024)),
                    _ => {}
                }
            }
        }
        None
    }

    fn interface(&self) -> Option<BayInterface> {
        self.0.iter().find_map(|t| match t.as_str() {
            "NVME" | "U.2" | "U.3" => Some(BayInterface::Nvme),
            "SAS" => Some(BayInterface::Sas),
            "SATA" => Some(BayInterface::Sata),
            _ => None,
        })
    }

    fn storage_form_factor(&self) -> Option<StorageFormFactor> {
        self.0.iter().find_map(|t| match t.as_str() {
            "M.2" | "M2" => Some(StorageFormFactor::M2),
            "2.5" | "2.5IN" | "SFF" => Some(StorageFormFactor::Bay25),
            "3.5" | "3.5IN" | "LFF" => Some(StorageFormFactor::Bay35),
            _ => None,
        })
    }

    fn form_factors(&self) -> Vec<String> {
        let mut found = Vec::new();
        for tok in &self.0 {
            let norm = tok.replace('-', "");
            let ff = match norm.as_str() {
                "ATX" => "ATX",
                "EATX" => "EATX",
                "MATX" | "MICROATX" => "MATX",
                "ITX" | "MINIITX" => "ITX",
                "SSIEEB" | "EEB" => "SSI-EEB",
                "SSICEB" | "CEB" => "SSI-CEB",
                _ => continue,
            };
            if !found.iter().any(|f| f == ff) {
                found.push(ff.to_string());
            }
        }
        found
    }

    /// A bare number immediately followed by one of `labels`.
    fn count_before(&self, labels: &[&str]) -> Option<u32> {
        self.0.iter().enumerate().find_map(|(idx, tok)| {
            let (n, rest) = leading_number(tok)?;
            let label = if rest.is_empty() {
                self.next_of(idx)?
            } else {
                rest.trim_start_matches('-')
            };
            labels.contains(&label).then_some(n)
        })
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn leading_number(s: &str) -> Option<(u32, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let n = s[..end].parse().ok()?;
    Some((n, &s[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapOracle(HashMap<ComponentKey, Result<Option<ComponentSpec>, OracleError>>);

    impl SpecificationOracle for MapOracle {
        fn lookup(&self, key: &ComponentKey) -> Result<Option<ComponentSpec>, OracleError> {
            self.0.get(key).cloned().unwrap_or(Ok(None))
        }
    }

    #[test]
    fn cpu_notes_yield_socket_memory_and_lanes() {
        let spec = infer_from_text(
            ComponentType::Cpu,
            "Xeon Gold 6338, FCLGA4189, DDR4-3200, 64 lanes, ECC",
        )
        .unwrap();
        let ComponentSpec::Cpu(cpu) = spec else {
            panic!("expected cpu spec");
        };
        assert_eq!(cpu.socket.as_deref(), Some("LGA4189"));
        assert_eq!(cpu.memory_types, vec![MemoryType::Ddr4]);
        assert_eq!(cpu.max_memory_mhz, Some(3200));
        assert_eq!(cpu.pcie_lanes, Some(64));
        assert_eq!(cpu.ecc, Some(true));
    }

    #[test]
    fn ram_notes_yield_type_frequency_and_capacity() {
        let spec = infer_from_text(ComponentType::Ram, "Samsung 32 GB DDR5 4800 MHz RDIMM").unwrap();
        let ComponentSpec::Ram(ram) = spec else {
            panic!("expected ram spec");
        };
        assert_eq!(ram.memory_type, Some(MemoryType::Ddr5));
        assert_eq!(ram.frequency_mhz, Some(4800));
        assert_eq!(ram.capacity_gb, Some(32));
        assert_eq!(ram.ecc, Some(true));
    }

    #[test]
    fn riser_notes_yield_width_and_children() {
        let spec = infer_from_text(ComponentType::Riser, "riser x16 to 2x8").unwrap();
        let ComponentSpec::Expansion(riser) = spec else {
            panic!("expected expansion spec");
        };
        assert_eq!(riser.pcie_width, Some(PcieWidth::X16));
        assert_eq!(
            riser.provides,
            vec![PcieSlotGroup {
                width: PcieWidth::X8,
                count: 2
            }]
        );
    }

    #[test]
    fn motherboard_notes_yield_capacities() {
        let spec = infer_from_text(
            ComponentType::Motherboard,
            "dual socket LGA 4189 E-ATX, 16 DIMM DDR4, 2x16 4x8, 2 M.2, 8 SATA",
        )
        .unwrap();
        let ComponentSpec::Motherboard(mb) = spec else {
            panic!("expected motherboard spec");
        };
        assert_eq!(mb.socket.as_deref(), Some("LGA4189"));
        assert_eq!(mb.socket_count, Some(2));
        assert_eq!(mb.dimm_slots, Some(16));
        assert_eq!(mb.pcie_slots.len(), 2);
        assert_eq!(mb.m2_slots, Some(2));
        assert_eq!(
            mb.bays,
            vec![BayGroup {
                interface: BayInterface::Sata,
                count: 8
            }]
        );
        assert_eq!(mb.form_factor.as_deref(), Some("EATX"));
    }

    #[test]
    fn meaningless_notes_yield_nothing() {
        assert_eq!(infer_from_text(ComponentType::Cpu, "spare, shelf 3"), None);
        assert_eq!(infer_from_text(ComponentType::Nic, ""), None);
    }

    #[test]
    fn structured_record_wins_over_notes() {
        let key = ComponentKey::new(ComponentType::Cpu, "c1");
        let record = ComponentSpec::Cpu(CpuSpec {
            socket: Some("AM5".into()),
            ..CpuSpec::default()
        });
        let oracle = MapOracle(HashMap::from([(key.clone(), Ok(Some(record.clone())))]));
        let resolved = resolve(&oracle, &key, Some("LGA4189"));
        assert_eq!(resolved.source, AttributeSource::Structured);
        assert_eq!(resolved.spec, Some(record));
    }

    #[test]
    fn oracle_failure_falls_back_and_is_kept() {
        let key = ComponentKey::new(ComponentType::Cpu, "c1");
        let oracle = MapOracle(HashMap::from([(
            key.clone(),
            Err(OracleError::Unavailable("timeout".into())),
        )]));
        let resolved = resolve(&oracle, &key, Some("LGA4189"));
        assert_eq!(resolved.source, AttributeSource::InferredFromText);
        assert_eq!(resolved.cpu().and_then(|c| c.socket.as_deref()), Some("LGA4189"));
        assert!(resolved.lookup_error.is_some());

        let bare = resolve(&oracle, &key, None);
        assert_eq!(bare.source, AttributeSource::Unknown);
        assert!(!bare.has_attributes());
    }

    #[test]
    fn mismatched_record_kind_is_malformed() {
        let key = ComponentKey::new(ComponentType::Ram, "r1");
        let oracle = MapOracle(HashMap::from([(
            key.clone(),
            Ok(Some(ComponentSpec::Cpu(CpuSpec {
                socket: Some("AM5".into()),
                ..CpuSpec::default()
            }))),
        )]));
        let resolved = resolve(&oracle, &key, None);
        assert!(matches!(resolved.lookup_error, Some(OracleError::Malformed { .. })));
        assert_eq!(resolved.source, AttributeSource::Unknown);
    }
}
