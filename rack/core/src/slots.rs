//! Per-configuration slot pool with a two-level riser tree.
//!
//! Native slots come from the motherboard. A riser occupies one native PCIe
//! slot and contributes child slots of class `riser_pcie`, whose ids are
//! prefixed with the upstream slot id (`pcie-x16-2/x8-1`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use rack_spec::{
    BayInterface, ComponentKey, MotherboardSpec, PcieSlotGroup, PcieWidth, SlotId,
    SlotRequirement,
};

/// Physical slot class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "class", content = "spec", rename_all = "snake_case")]
pub enum SlotClass {
    /// Native PCIe slot.
    Pcie(PcieWidth),
    /// PCIe slot provided by a riser.
    RiserPcie(PcieWidth),
    /// DIMM slot.
    Dimm,
    /// M.2 slot.
    M2,
    /// Drive bay.
    Bay(BayInterface),
}

impl SlotClass {
    /// Whether a component with `req` may sit here, and how good the fit is
    /// (lower is better).
    fn fit(self, req: SlotRequirement) -> Option<(u32, u32)> {
        match (self, req) {
            (Self::Pcie(w), SlotRequirement::Pcie(r)) if w >= r => Some((w.lanes(), 0)),
            (Self::RiserPcie(w), SlotRequirement::Pcie(r)) if w >= r => Some((w.lanes(), 1)),
            (Self::Dimm, SlotRequirement::Dimm) | (Self::M2, SlotRequirement::M2) => Some((0, 0)),
            (Self::Bay(b), SlotRequirement::Bay(r)) if b == r => Some((0, 0)),
            (Self::Bay(BayInterface::Sas), SlotRequirement::Bay(BayInterface::Sata)) => Some((1, 0)),
            _ => None,
        }
    }

    /// Whether the slot is contributed by a riser.
    pub fn is_riser(self) -> bool {
        matches!(self, Self::RiserPcie(_))
    }
}

impl fmt::Display for SlotClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pcie(w) => write!(f, "pcie_{w}"),
            Self::RiserPcie(w) => write!(f, "riser_pcie_{w}"),
            Self::Dimm => f.write_str("dimm"),
            Self::M2 => f.write_str("m2"),
            Self::Bay(i) => write!(f, "bay_{i}"),
        }
    }
}

/// One concrete slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Identifier, unique within the pool.
    pub id: SlotId,
    /// Slot class.
    pub class: SlotClass,
    /// Upstream slot for riser-provided slots.
    pub parent: Option<SlotId>,
    /// Component seated here.
    pub occupant: Option<ComponentKey>,
    /// Creation order; breaks ties between equally good slots.
    pub ordinal: u32,
}

/// A riser seated in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiserNode {
    /// The riser component.
    pub riser: ComponentKey,
    /// Native slot it occupies.
    pub upstream: SlotId,
    /// Slots it provides.
    pub children: Vec<SlotId>,
}

/// Usage of one slot class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassUsage {
    /// Slot class.
    pub class: SlotClass,
    /// Slots of the class.
    pub total: u32,
    /// Occupied slots.
    pub used: u32,
    /// Free slots.
    pub available: u32,
}

/// Allocation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SlotError {
    /// No free slot fits.
    #[error("no free slot for {requirement}")]
    Exhausted {
        /// What was asked for.
        requirement: SlotRequirement,
    },
    /// Hinted slot does not exist.
    #[error("slot {0} does not exist")]
    UnknownSlot(SlotId),
    /// Hinted slot is taken.
    #[error("slot {slot} is occupied by {occupant}")]
    Occupied {
        /// Slot asked for.
        slot: SlotId,
        /// Current occupant.
        occupant: ComponentKey,
    },
    /// Hinted slot is the wrong class or too narrow.
    #[error("slot {slot} ({class}) cannot take {requirement}")]
    Incompatible {
        /// Slot asked for.
        slot: SlotId,
        /// Its class.
        class: SlotClass,
        /// What was asked for.
        requirement: SlotRequirement,
    },
    /// Riser still carries cards.
    #[error("riser {riser} still carries {}", list(.occupants))]
    RiserOccupied {
        /// The riser.
        riser: ComponentKey,
        /// Cards seated on it.
        occupants: Vec<ComponentKey>,
    },
}

fn list(keys: &[ComponentKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Slot pool of one configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPool {
    slots: BTreeMap<SlotId, Slot>,
    risers: Vec<RiserNode>,
    next_ordinal: u32,
}

impl SlotPool {
    /// Build the native pool a motherboard declares.
    pub fn from_board(board: &MotherboardSpec) -> Self {
        let mut pool = Self::default();
        let mut per_width: BTreeMap<PcieWidth, u32> = BTreeMap::new();
        for group in &board.pcie_slots {
            for _ in 0..group.count {
                let n = per_width.entry(group.width).or_default();
                *n += 1;
                let id = SlotId::new(format!("pcie-{}-{n}", group.width));
                pool.insert(id, SlotClass::Pcie(group.width), None);
            }
        }
        for n in 1..=board.dimm_slots.unwrap_or(0) {
            pool.insert(SlotId::new(format!("dimm-{n}")), SlotClass::Dimm, None);
        }
        for n in 1..=board.m2_slots.unwrap_or(0) {
            pool.insert(SlotId::new(format!("m2-{n}")), SlotClass::M2, None);
        }
        let mut per_iface: BTreeMap<BayInterface, u32> = BTreeMap::new();
        for group in &board.bays {
            for _ in 0..group.count {
                let n = per_iface.entry(group.interface).or_default();
                *n += 1;
                let id = SlotId::new(format!("{}-{n}", group.interface));
                pool.insert(id, SlotClass::Bay(group.interface), None);
            }
        }
        pool
    }

    fn insert(&mut self, id: SlotId, class: SlotClass, parent: Option<SlotId>) {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.slots.insert(
            id.clone(),
            Slot {
                id,
                class,
                parent,
                occupant: None,
                ordinal,
            },
        );
    }

    /// Seat `occupant` in the best-fitting free slot, or in `hint`.
    /// Returns the slot it already holds if it is seated.
    pub fn assign(
        &mut self,
        occupant: &ComponentKey,
        req: SlotRequirement,
        hint: Option<&SlotId>,
    ) -> Result<SlotId, SlotError> {
        if let Some(current) = self.slot_of(occupant) {
            return Ok(current.clone());
        }
        let id = self.select(req, hint, false)?;
        self.occupy(&id, occupant);
        Ok(id)
    }

    /// Seat a riser in a native PCIe slot and create its child slots.
    pub fn attach_riser(
        &mut self,
        riser: &ComponentKey,
        width: PcieWidth,
        provides: &[PcieSlotGroup],
        hint: Option<&SlotId>,
    ) -> Result<SlotId, SlotError> {
        if let Some(node) = self.risers.iter().find(|n| &n.riser == riser) {
            return Ok(node.upstream.clone());
        }
        let upstream = self.select(SlotRequirement::Pcie(width), hint, true)?;
        self.occupy(&upstream, riser);
        let mut children = Vec::new();
        let mut per_width: BTreeMap<PcieWidth, u32> = BTreeMap::new();
        for group in provides {
            for _ in 0..group.count {
                let n = per_width.entry(group.width).or_default();
                *n += 1;
                let id = SlotId::new(format!("{upstream}/{}-{n}", group.width));
                self.insert(
                    id.clone(),
                    SlotClass::RiserPcie(group.width),
                    Some(upstream.clone()),
                );
                children.push(id);
            }
        }
        debug!(
            "riser {riser} seated in {upstream}, {} child slot(s)",
            children.len()
        );
        self.risers.push(RiserNode {
            riser: riser.clone(),
            upstream: upstream.clone(),
            children,
        });
        Ok(upstream)
    }

    /// Remove a riser and its child slots. Fails while any child is occupied.
    pub fn detach_riser(&mut self, riser: &ComponentKey) -> Result<Option<SlotId>, SlotError> {
        let Some(pos) = self.risers.iter().position(|n| &n.riser == riser) else {
            return Ok(None);
        };
        let occupants: Vec<ComponentKey> = self.risers[pos]
            .children
            .iter()
            .filter_map(|id| self.slots.get(id).and_then(|s| s.occupant.clone()))
            .collect();
        if !occupants.is_empty() {
            return Err(SlotError::RiserOccupied {
                riser: riser.clone(),
                occupants,
            });
        }
        let node = self.risers.remove(pos);
        for child in &node.children {
            self.slots.remove(child);
        }
        if let Some(slot) = self.slots.get_mut(&node.upstream) {
            slot.occupant = None;
        }
        debug!("riser {riser} removed from {}", node.upstream);
        Ok(Some(node.upstream))
    }

    /// Free whatever slot `occupant` holds. Risers are detached.
    pub fn release_occupant(&mut self, occupant: &ComponentKey) -> Result<Option<SlotId>, SlotError> {
        if self.is_riser(occupant) {
            return self.detach_riser(occupant);
        }
        let Some(id) = self.slot_of(occupant).cloned() else {
            return Ok(None);
        };
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.occupant = None;
        }
        Ok(Some(id))
    }

    /// Free one slot, returning its former occupant.
    pub fn release(&mut self, id: &SlotId) -> Result<Option<ComponentKey>, SlotError> {
        let occupant = self
            .slots
            .get(id)
            .ok_or_else(|| SlotError::UnknownSlot(id.clone()))?
            .occupant
            .clone();
        if let Some(key) = &occupant {
            self.release_occupant(key)?;
        }
        Ok(occupant)
    }

    /// Per-class usage, ordered by class.
    pub fn state(&self) -> Vec<ClassUsage> {
        let mut usage: BTreeMap<SlotClass, ClassUsage> = BTreeMap::new();
        for slot in self.slots.values() {
            let entry = usage.entry(slot.class).or_insert(ClassUsage {
                class: slot.class,
                total: 0,
                used: 0,
                available: 0,
            });
            entry.total += 1;
            if slot.occupant.is_some() {
                entry.used += 1;
            } else {
                entry.available += 1;
            }
        }
        usage.into_values().collect()
    }

    /// Free slots across every class.
    pub fn available_total(&self) -> u32 {
        self.slots.values().filter(|s| s.occupant.is_none()).count() as u32
    }

    /// Slot held by `occupant`.
    pub fn slot_of(&self, occupant: &ComponentKey) -> Option<&SlotId> {
        self.slots
            .values()
            .find(|s| s.occupant.as_ref() == Some(occupant))
            .map(|s| &s.id)
    }

    /// Look up a slot.
    pub fn slot(&self, id: &SlotId) -> Option<&Slot> {
        self.slots.get(id)
    }

    /// All slots, ordered by id.
    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    /// Whether `key` is a seated riser.
    pub fn is_riser(&self, key: &ComponentKey) -> bool {
        self.risers.iter().any(|n| &n.riser == key)
    }

    fn select(
        &self,
        req: SlotRequirement,
        hint: Option<&SlotId>,
        native_only: bool,
    ) -> Result<SlotId, SlotError> {
        let usable = |slot: &Slot| -> Option<(u32, u32)> {
            if native_only && slot.class.is_riser() {
                return None;
            }
            slot.class.fit(req)
        };
        if let Some(id) = hint {
            let slot = self
                .slots
                .get(id)
                .ok_or_else(|| SlotError::UnknownSlot(id.clone()))?;
            if let Some(occupant) = &slot.occupant {
                return Err(SlotError::Occupied {
                    slot: id.clone(),
                    occupant: occupant.clone(),
                });
            }
            if usable(slot).is_none() {
                return Err(SlotError::Incompatible {
                    slot: id.clone(),
                    class: slot.class,
                    requirement: req,
                });
            }
            return Ok(id.clone());
        }
        self.slots
            .values()
            .filter(|s| s.occupant.is_none())
            .filter_map(|s| usable(s).map(|(width, rank)| ((width, rank, s.ordinal), s)))
            .min_by_key(|(order, _)| *order)
            .map(|(_, s)| s.id.clone())
            .ok_or(SlotError::Exhausted { requirement: req })
    }

    fn occupy(&mut self, id: &SlotId, occupant: &ComponentKey) {
        if let Some(slot) = self.slots.get_mut(id) {
            slot.occupant = Some(occupant.clone());
            debug!("{occupant} assigned to slot {id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rack_spec::{BayGroup, ComponentType};
    use std::collections::HashSet;

    fn board(x16: u32, x8: u32) -> MotherboardSpec {
        MotherboardSpec {
            dimm_slots: Some(4),
            m2_slots: Some(1),
            pcie_slots: vec![
                PcieSlotGroup {
                    width: PcieWidth::X16,
                    count: x16,
                },
                PcieSlotGroup {
                    width: PcieWidth::X8,
                    count: x8,
                },
            ],
            bays: vec![
                BayGroup {
                    interface: BayInterface::Sata,
                    count: 1,
                },
                BayGroup {
                    interface: BayInterface::Sas,
                    count: 1,
                },
            ],
            ..MotherboardSpec::default()
        }
    }

    fn key(kind: ComponentType, id: &str) -> ComponentKey {
        ComponentKey::new(kind, id)
    }

    fn two_by_x8() -> Vec<PcieSlotGroup> {
        vec![PcieSlotGroup {
            width: PcieWidth::X8,
            count: 2,
        }]
    }

    #[test]
    fn board_declares_native_slots() {
        let pool = SlotPool::from_board(&board(2, 1));
        let ids: Vec<&str> = pool.slots().map(|s| s.id.as_str()).collect();
        assert!(ids.contains(&"pcie-x16-1"));
        assert!(ids.contains(&"pcie-x16-2"));
        assert!(ids.contains(&"pcie-x8-1"));
        assert!(ids.contains(&"dimm-4"));
        assert!(ids.contains(&"m2-1"));
        assert!(ids.contains(&"sata-1"));
        assert_eq!(pool.available_total(), 10);
    }

    #[test]
    fn best_fit_prefers_narrowest_slot() {
        let mut pool = SlotPool::from_board(&board(1, 1));
        let nic = key(ComponentType::Nic, "n1");
        let slot = pool.assign(&nic, SlotRequirement::Pcie(PcieWidth::X4), None).unwrap();
        assert_eq!(slot.as_str(), "pcie-x8-1");
        let gpu = key(ComponentType::PcieCard, "g1");
        let slot = pool.assign(&gpu, SlotRequirement::Pcie(PcieWidth::X16), None).unwrap();
        assert_eq!(slot.as_str(), "pcie-x16-1");
        let other = key(ComponentType::PcieCard, "g2");
        assert_eq!(
            pool.assign(&other, SlotRequirement::Pcie(PcieWidth::X1), None),
            Err(SlotError::Exhausted {
                requirement: SlotRequirement::Pcie(PcieWidth::X1)
            })
        );
    }

    #[test]
    fn never_downgrades() {
        let mut pool = SlotPool::from_board(&board(0, 2));
        let gpu = key(ComponentType::PcieCard, "g1");
        assert!(matches!(
            pool.assign(&gpu, SlotRequirement::Pcie(PcieWidth::X16), None),
            Err(SlotError::Exhausted { .. })
        ));
    }

    #[test]
    fn riser_slots_are_a_separate_class() {
        let mut pool = SlotPool::from_board(&board(2, 0));
        let card = key(ComponentType::PcieCard, "p1");
        let a = pool.assign(&card, SlotRequirement::Pcie(PcieWidth::X16), None).unwrap();
        assert_eq!(a.as_str(), "pcie-x16-1");

        let riser = key(ComponentType::Riser, "r1");
        let upstream = pool
            .attach_riser(&riser, PcieWidth::X16, &two_by_x8(), None)
            .unwrap();
        assert_eq!(upstream.as_str(), "pcie-x16-2");

        let state = pool.state();
        let native = state
            .iter()
            .find(|u| u.class == SlotClass::Pcie(PcieWidth::X16))
            .unwrap();
        assert_eq!(native.available, 0);
        let riser_x8 = state
            .iter()
            .find(|u| u.class == SlotClass::RiserPcie(PcieWidth::X8))
            .unwrap();
        assert_eq!((riser_x8.total, riser_x8.available), (2, 2));

        let nic = key(ComponentType::Nic, "n1");
        let slot = pool.assign(&nic, SlotRequirement::Pcie(PcieWidth::X8), None).unwrap();
        assert_eq!(slot.as_str(), "pcie-x16-2/x8-1");
        assert_eq!(pool.slot(&slot).unwrap().parent, Some(upstream));
    }

    #[test]
    fn risers_never_stack() {
        let mut pool = SlotPool::from_board(&board(1, 0));
        let r1 = key(ComponentType::Riser, "r1");
        pool.attach_riser(&r1, PcieWidth::X16, &[PcieSlotGroup { width: PcieWidth::X16, count: 1 }], None)
            .unwrap();
        let r2 = key(ComponentType::Riser, "r2");
        assert!(matches!(
            pool.attach_riser(&r2, PcieWidth::X16, &two_by_x8(), None),
            Err(SlotError::Exhausted { .. })
        ));
        let child = SlotId::new("pcie-x16-1/x16-1");
        assert!(matches!(
            pool.attach_riser(&r2, PcieWidth::X16, &two_by_x8(), Some(&child)),
            Err(SlotError::Incompatible { .. })
        ));
    }

    #[test]
    fn occupied_riser_cannot_detach() {
        let mut pool = SlotPool::from_board(&board(1, 0));
        let riser = key(ComponentType::Riser, "r1");
        pool.attach_riser(&riser, PcieWidth::X16, &two_by_x8(), None).unwrap();
        let nic = key(ComponentType::Nic, "n1");
        pool.assign(&nic, SlotRequirement::Pcie(PcieWidth::X8), None).unwrap();
        assert_eq!(
            pool.detach_riser(&riser),
            Err(SlotError::RiserOccupied {
                riser: riser.clone(),
                occupants: vec![nic.clone()]
            })
        );
        pool.release_occupant(&nic).unwrap();
        assert_eq!(pool.release_occupant(&riser).unwrap().unwrap().as_str(), "pcie-x16-1");
        assert_eq!(pool.slots().count(), 1 + 4 + 1 + 2);
    }

    #[test]
    fn hints_are_checked() {
        let mut pool = SlotPool::from_board(&board(1, 1));
        let gpu = key(ComponentType::PcieCard, "g1");
        let x8 = SlotId::new("pcie-x8-1");
        assert!(matches!(
            pool.assign(&gpu, SlotRequirement::Pcie(PcieWidth::X16), Some(&x8)),
            Err(SlotError::Incompatible { .. })
        ));
        assert_eq!(
            pool.assign(&gpu, SlotRequirement::Pcie(PcieWidth::X16), Some(&SlotId::new("nope"))),
            Err(SlotError::UnknownSlot(SlotId::new("nope")))
        );
        let nic = key(ComponentType::Nic, "n1");
        pool.assign(&nic, SlotRequirement::Pcie(PcieWidth::X4), Some(&x8)).unwrap();
        assert!(matches!(
            pool.assign(&gpu, SlotRequirement::Pcie(PcieWidth::X4), Some(&x8)),
            Err(SlotError::Occupied { .. })
        ));
    }

    #[test]
    fn sata_falls_back_to_sas() {
        let mut pool = SlotPool::from_board(&board(0, 0));
        let d1 = key(ComponentType::Storage, "d1");
        let d2 = key(ComponentType::Storage, "d2");
        let d3 = key(ComponentType::Storage, "d3");
        let sata = SlotRequirement::Bay(BayInterface::Sata);
        assert_eq!(pool.assign(&d1, sata, None).unwrap().as_str(), "sata-1");
        assert_eq!(pool.assign(&d2, sata, None).unwrap().as_str(), "sas-1");
        assert!(pool.assign(&d3, SlotRequirement::Bay(BayInterface::Sas), None).is_err());
    }

    #[test]
    fn release_by_slot_returns_occupant() {
        let mut pool = SlotPool::from_board(&board(0, 0));
        let module = key(ComponentType::Ram, "m1");
        let slot = pool.assign(&module, SlotRequirement::Dimm, None).unwrap();
        assert_eq!(pool.release(&slot).unwrap(), Some(module.clone()));
        assert_eq!(pool.slot_of(&module), None);
    }

    fn widths() -> impl Strategy<Value = PcieWidth> {
        prop_oneof![
            Just(PcieWidth::X1),
            Just(PcieWidth::X4),
            Just(PcieWidth::X8),
            Just(PcieWidth::X16),
        ]
    }

    proptest! {
        #[test]
        fn riser_changes_available_by_n_minus_one(
            x16 in 1u32..4,
            x8 in 0u32..3,
            groups in prop::collection::vec((widths(), 1u32..4), 0..3),
        ) {
            let mut pool = SlotPool::from_board(&board(x16, x8));
            let provides: Vec<PcieSlotGroup> = groups
                .iter()
                .map(|(width, count)| PcieSlotGroup { width: *width, count: *count })
                .collect();
            let n: u32 = provides.iter().map(|g| g.count).sum();
            let before = pool.available_total();
            let riser = key(ComponentType::Riser, "r1");
            pool.attach_riser(&riser, PcieWidth::X16, &provides, None).unwrap();
            prop_assert_eq!(pool.available_total() + 1, before + n);
            pool.detach_riser(&riser).unwrap();
            prop_assert_eq!(pool.available_total(), before);
        }

        #[test]
        fn slot_ids_are_never_shared(reqs in prop::collection::vec(widths(), 1..12)) {
            let mut pool = SlotPool::from_board(&board(2, 2));
            pool.attach_riser(&key(ComponentType::Riser, "r1"), PcieWidth::X16, &two_by_x8(), None)
                .unwrap();
            let mut seen = HashSet::new();
            for (i, width) in reqs.into_iter().enumerate() {
                let card = key(ComponentType::PcieCard, &format!("c{i}"));
                if let Ok(slot) = pool.assign(&card, SlotRequirement::Pcie(width), None) {
                    prop_assert!(seen.insert(slot));
                }
            }
            for slot in pool.slots() {
                if let Some(occupant) = &slot.occupant {
                    prop_assert_eq!(pool.slot_of(occupant), Some(&slot.id));
                }
            }
        }
    }
}
