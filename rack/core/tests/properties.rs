use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;

use rack_core::{
    evaluate_set, AddRequest, Assembler, Catalog, ClaimRequest, ComponentRow, EngineConfig,
    Finding, Ledger, MemoryStore, Part, ReleaseRequest, RuleKind, RuleSet, ResolvedSpec,
};
use rack_spec::{
    ComponentKey, ComponentSpec, ComponentStatus, ComponentType, ConfigMode, CpuSpec,
    ExpansionSpec, MemoryType, MotherboardSpec, PcieSlotGroup, PcieWidth, RamSpec,
};

const CATALOG: &str = r#"[
    {"type": "motherboard", "id": "mb", "spec": {
        "kind": "motherboard", "socket": "SP5", "socket_count": 1,
        "memory_types": ["DDR5"], "max_memory_mhz": 4800, "dimm_slots": 2,
        "pcie_slots": [{"width": "x16", "count": 1}, {"width": "x8", "count": 1}]
    }},
    {"type": "cpu", "id": "cpu", "spec": {"kind": "cpu", "socket": "SP5", "memory_types": ["DDR5"]}},
    {"type": "ram", "id": "r1", "spec": {"kind": "ram", "memory_type": "DDR5", "frequency_mhz": 5600}},
    {"type": "ram", "id": "r2", "notes": "32GB DDR5 4800MHz ECC RDIMM"},
    {"type": "nic", "id": "nic", "spec": {"kind": "expansion", "pcie_width": "x8"}},
    {"type": "riser", "id": "riser", "spec": {
        "kind": "expansion", "pcie_width": "x16", "provides": [{"width": "x8", "count": 2}]
    }}
]"#;

fn keys() -> Vec<ComponentKey> {
    vec![
        ComponentKey::new(ComponentType::Motherboard, "mb"),
        ComponentKey::new(ComponentType::Cpu, "cpu"),
        ComponentKey::new(ComponentType::Ram, "r1"),
        ComponentKey::new(ComponentType::Ram, "r2"),
        ComponentKey::new(ComponentType::Nic, "nic"),
        ComponentKey::new(ComponentType::Riser, "riser"),
    ]
}

fn signature(findings: &[Finding]) -> BTreeSet<(RuleKind, Vec<ComponentKey>)> {
    findings
        .iter()
        .map(|f| (f.rule, f.components.clone()))
        .collect()
}

fn parts() -> Vec<Part> {
    vec![
        Part::new(
            ComponentKey::new(ComponentType::Motherboard, "mb"),
            1,
            ResolvedSpec::structured(ComponentSpec::Motherboard(MotherboardSpec {
                socket: Some("LGA1700".into()),
                socket_count: Some(1),
                memory_types: vec![MemoryType::Ddr4],
                max_memory_mhz: Some(3200),
                dimm_slots: Some(2),
                pcie_slots: vec![PcieSlotGroup {
                    width: PcieWidth::X16,
                    count: 1,
                }],
                ..MotherboardSpec::default()
            })),
        ),
        Part::new(
            ComponentKey::new(ComponentType::Cpu, "a"),
            1,
            ResolvedSpec::structured(ComponentSpec::Cpu(CpuSpec {
                socket: Some("LGA1700".into()),
                ..CpuSpec::default()
            })),
        ),
        Part::new(
            ComponentKey::new(ComponentType::Cpu, "b"),
            1,
            ResolvedSpec::structured(ComponentSpec::Cpu(CpuSpec {
                socket: Some("AM4".into()),
                ..CpuSpec::default()
            })),
        ),
        Part::new(
            ComponentKey::new(ComponentType::Ram, "fast"),
            1,
            ResolvedSpec::structured(ComponentSpec::Ram(RamSpec {
                memory_type: Some(MemoryType::Ddr4),
                frequency_mhz: Some(3600),
                ..RamSpec::default()
            })),
        ),
        Part::new(
            ComponentKey::new(ComponentType::Ram, "slow"),
            1,
            ResolvedSpec::structured(ComponentSpec::Ram(RamSpec {
                memory_type: Some(MemoryType::Ddr4),
                frequency_mhz: Some(2666),
                ..RamSpec::default()
            })),
        ),
        Part::new(
            ComponentKey::new(ComponentType::Ram, "extra"),
            1,
            ResolvedSpec::structured(ComponentSpec::Ram(RamSpec {
                memory_type: Some(MemoryType::Ddr5),
                ..RamSpec::default()
            })),
        ),
    ]
}

fn bulk_parts(cpus: u32, lanes: u32, modules: u32, cards: u32) -> Vec<Part> {
    vec![
        Part::new(
            ComponentKey::new(ComponentType::Motherboard, "mb"),
            1,
            ResolvedSpec::structured(ComponentSpec::Motherboard(MotherboardSpec {
                socket: Some("SP5".into()),
                socket_count: Some(2),
                memory_types: vec![MemoryType::Ddr5],
                dimm_slots: Some(4),
                ..MotherboardSpec::default()
            })),
        ),
        Part::new(
            ComponentKey::new(ComponentType::Cpu, "cpu"),
            cpus,
            ResolvedSpec::structured(ComponentSpec::Cpu(CpuSpec {
                socket: Some("SP5".into()),
                memory_types: vec![MemoryType::Ddr5],
                pcie_lanes: Some(lanes),
                ..CpuSpec::default()
            })),
        ),
        Part::new(
            ComponentKey::new(ComponentType::Ram, "dimm"),
            modules,
            ResolvedSpec::structured(ComponentSpec::Ram(RamSpec {
                memory_type: Some(MemoryType::Ddr5),
                ..RamSpec::default()
            })),
        ),
        Part::new(
            ComponentKey::new(ComponentType::PcieCard, "gpu"),
            cards,
            ResolvedSpec::structured(ComponentSpec::Expansion(ExpansionSpec {
                pcie_width: Some(PcieWidth::X16),
                ..ExpansionSpec::default()
            })),
        ),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn aggregates_count_any_quantity(
        cpus in 1..=u32::MAX,
        lanes in 1..=u32::MAX,
        modules in 1..=u32::MAX,
        cards in 1..=u32::MAX,
    ) {
        let verdict = evaluate_set(&bulk_parts(cpus, lanes, modules, cards), RuleSet::standard(), 85);
        prop_assert_eq!(verdict.compatible, cpus <= 2 && modules <= 4);
        let oversubscribed = u64::from(cards) * 16 > u64::from(cpus) * u64::from(lanes);
        let lane_warning = verdict
            .failures
            .iter()
            .chain(verdict.warnings.iter())
            .any(|f| f.rule == RuleKind::PcieLaneOversubscription);
        prop_assert_eq!(lane_warning, oversubscribed);
    }

    #[test]
    fn set_verdict_ignores_part_order(shuffled in Just(parts()).prop_shuffle()) {
        let rules = RuleSet::standard();
        let baseline = evaluate_set(&parts(), rules, 85);
        let verdict = evaluate_set(&shuffled, rules, 85);
        prop_assert_eq!(verdict, baseline);
    }

    #[test]
    fn add_order_does_not_change_the_validated_outcome(order in Just(keys()).prop_shuffle()) {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let asm = Assembler::new(
            Arc::new(catalog.oracle()),
            Arc::new(MemoryStore::new()),
            EngineConfig::default(),
        );
        asm.provision(catalog.rows()).unwrap();
        asm.create_configuration("cfg", "cfg", ConfigMode::Real).unwrap();
        for key in &order {
            asm.add_component(AddRequest::new("cfg", key.clone())).unwrap();
        }
        let report = asm.validate(&"cfg".into()).unwrap();
        prop_assert!(report.valid);

        let reference = Assembler::new(
            Arc::new(catalog.oracle()),
            Arc::new(MemoryStore::new()),
            EngineConfig::default(),
        );
        reference.provision(catalog.rows()).unwrap();
        reference.create_configuration("cfg", "cfg", ConfigMode::Real).unwrap();
        for key in keys() {
            reference.add_component(AddRequest::new("cfg", key)).unwrap();
        }
        let expected = reference.validate(&"cfg".into()).unwrap();
        prop_assert_eq!(report.score, expected.score);
        prop_assert_eq!(signature(&report.warnings), signature(&expected.warnings));

        let pool = asm.pool_state(&"cfg".into()).unwrap();
        prop_assert!(pool.deferred.is_empty());
        let occupied = pool.slots.iter().filter(|s| s.occupant.is_some()).count();
        prop_assert_eq!(occupied, 4);
    }

    #[test]
    fn ledger_claims_and_releases_balance(ops in proptest::collection::vec((0usize..3, 0usize..3, any::<bool>()), 1..40)) {
        let ledger = Ledger::new();
        let components: Vec<ComponentKey> = (0..3)
            .map(|i| ComponentKey::new(ComponentType::Nic, format!("n{i}")))
            .collect();
        for key in &components {
            ledger.provision(ComponentRow::available(key.clone()));
        }
        let configs = ["x", "y", "z"];
        for (component, config, claim) in ops {
            let key = components[component].clone();
            if claim {
                let _ = ledger.try_claim(&ClaimRequest {
                    key,
                    config: configs[config].into(),
                    mode: ConfigMode::Real,
                    allow_preempt: false,
                });
            } else {
                ledger
                    .release(&ReleaseRequest {
                        key,
                        config: configs[config].into(),
                        mode: ConfigMode::Real,
                    })
                    .unwrap();
            }
        }
        for row in ledger.rows() {
            match row.status {
                ComponentStatus::InUse => prop_assert!(row.owner.is_some()),
                _ => prop_assert!(row.owner.is_none()),
            }
        }
        prop_assert!(ledger.journal().verify().is_ok());
    }
}
