//! Static compatibility rule table.
//!
//! Pair rules take their two parts in a fixed orientation (the order of
//! `subjects`, or key order for same-type pairs), so a rule sees the same
//! arguments no matter which of the two parts was added last.

use std::fmt;

use serde::{Deserialize, Serialize};

use rack_spec::{ComponentKey, ComponentType, SlotRequirement};

use crate::evaluator::{Finding, FindingCategory, Part, Severity};

/// Machine name of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// CPU and board (or two CPUs) use different sockets.
    SocketMismatch,
    /// Socket of either side unknown; assumed compatible.
    SocketUndetermined,
    /// Memory generation not supported by the platform.
    MemoryTypeMismatch,
    /// Memory will run below its rated frequency.
    MemoryFrequencyClamped,
    /// Modules of different frequencies in one configuration.
    MixedMemoryFrequency,
    /// ECC module on a platform without ECC.
    EccUnsupported,
    /// Board does not fit the chassis.
    FormFactorMismatch,
    /// Board or chassis form factor unknown.
    FormFactorUndetermined,
    /// Attributes missing on one side of a check.
    RequirementsUndetermined,
    /// More CPUs than sockets.
    CpuSocketCapacity,
    /// More memory modules than DIMM slots.
    DimmCapacity,
    /// More than one board or chassis.
    SingleInstance,
    /// More drives than chassis bays.
    ChassisBayCapacity,
    /// Cards request more PCIe lanes than the CPUs provide.
    PcieLaneOversubscription,
    /// Specification lookup failed.
    OracleUnavailable,
    /// Attributes parsed from inventory notes.
    InferredAttributes,
    /// No free slot of the required class.
    SlotUnavailable,
    /// Component already in the configuration.
    AlreadyPresent,
    /// Slot assignment waits for a motherboard.
    SlotDeferred,
    /// Component taken from another configuration.
    OverridePreempted,
    /// A required component type is absent.
    RequiredTypeMissing,
    /// Test-mode configurations cannot be finalized or built.
    TestMode,
}

impl RuleKind {
    /// Machine name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SocketMismatch => "socket_mismatch",
            Self::SocketUndetermined => "socket_undetermined",
            Self::MemoryTypeMismatch => "memory_type_mismatch",
            Self::MemoryFrequencyClamped => "memory_frequency_clamped",
            Self::MixedMemoryFrequency => "mixed_memory_frequency",
            Self::EccUnsupported => "ecc_unsupported",
            Self::FormFactorMismatch => "form_factor_mismatch",
            Self::FormFactorUndetermined => "form_factor_undetermined",
            Self::RequirementsUndetermined => "requirements_undetermined",
            Self::CpuSocketCapacity => "cpu_socket_capacity",
            Self::DimmCapacity => "dimm_capacity",
            Self::SingleInstance => "single_instance",
            Self::ChassisBayCapacity => "chassis_bay_capacity",
            Self::PcieLaneOversubscription => "pcie_lane_oversubscription",
            Self::OracleUnavailable => "oracle_unavailable",
            Self::InferredAttributes => "inferred_attributes",
            Self::SlotUnavailable => "slot_unavailable",
            Self::AlreadyPresent => "already_present",
            Self::SlotDeferred => "slot_deferred",
            Self::OverridePreempted => "override_preempted",
            Self::RequiredTypeMissing => "required_type_missing",
            Self::TestMode => "test_mode",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score contribution and findings of one rule application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    /// Score of this link, 0..=100.
    pub score: u8,
    /// Findings raised.
    pub findings: Vec<Finding>,
}

impl Check {
    /// Clean pass.
    pub fn pass(score: u8) -> Self {
        Self {
            score,
            findings: Vec::new(),
        }
    }

    /// Non-blocking finding.
    pub fn warn(score: u8, finding: Finding) -> Self {
        Self {
            score,
            findings: vec![finding],
        }
    }

    /// Blocking finding.
    pub fn fail(finding: Finding) -> Self {
        Self {
            score: 0,
            findings: vec![finding],
        }
    }
}

/// Rule over two parts.
#[derive(Debug, Clone, Copy)]
pub struct PairRule {
    /// Rule name.
    pub name: &'static str,
    /// Component types the rule relates, in the orientation `check` expects.
    pub subjects: (ComponentType, ComponentType),
    /// Rule body.
    pub check: fn(&Part, &Part) -> Check,
}

impl PairRule {
    /// Put `a` and `b` in rule orientation, or `None` if the rule does not
    /// relate their types.
    pub fn orient<'a>(&self, a: &'a Part, b: &'a Part) -> Option<(&'a Part, &'a Part)> {
        let (left, right) = self.subjects;
        if left == right {
            if a.key.kind != left || b.key.kind != left {
                return None;
            }
            return Some(if a.key <= b.key { (a, b) } else { (b, a) });
        }
        if a.key.kind == left && b.key.kind == right {
            Some((a, b))
        } else if a.key.kind == right && b.key.kind == left {
            Some((b, a))
        } else {
            None
        }
    }
}

/// Rule over the whole component set.
#[derive(Debug, Clone, Copy)]
pub struct AggregateRule {
    /// Rule name.
    pub name: &'static str,
    /// Rule body; each check names every component it involves.
    pub check: fn(&[&Part]) -> Vec<Check>,
}

/// Process-wide rule table.
#[derive(Debug, Clone, Copy)]
pub struct RuleSet {
    /// Pairwise rules.
    pub pairs: &'static [PairRule],
    /// Whole-set rules.
    pub aggregates: &'static [AggregateRule],
}

impl RuleSet {
    /// The built-in rule table.
    pub fn standard() -> &'static RuleSet {
        &STANDARD
    }
}

static STANDARD: RuleSet = RuleSet {
    pairs: &[
        PairRule {
            name: "socket",
            subjects: (ComponentType::Cpu, ComponentType::Motherboard),
            check: cpu_board_socket,
        },
        PairRule {
            name: "cpu_socket_parity",
            subjects: (ComponentType::Cpu, ComponentType::Cpu),
            check: cpu_socket_parity,
        },
        PairRule {
            name: "memory_cpu",
            subjects: (ComponentType::Ram, ComponentType::Cpu),
            check: memory_cpu,
        },
        PairRule {
            name: "memory_board",
            subjects: (ComponentType::Ram, ComponentType::Motherboard),
            check: memory_board,
        },
        PairRule {
            name: "memory_parity",
            subjects: (ComponentType::Ram, ComponentType::Ram),
            check: memory_parity,
        },
        PairRule {
            name: "chassis_form_factor",
            subjects: (ComponentType::Chassis, ComponentType::Motherboard),
            check: chassis_form_factor,
        },
    ],
    aggregates: &[
        AggregateRule {
            name: "single_instance",
            check: single_instance,
        },
        AggregateRule {
            name: "cpu_socket_capacity",
            check: cpu_socket_capacity,
        },
        AggregateRule {
            name: "dimm_capacity",
            check: dimm_capacity,
        },
        AggregateRule {
            name: "memory_frequency_clamped",
            check: memory_frequency_clamped,
        },
        AggregateRule {
            name: "chassis_bay_capacity",
            check: chassis_bay_capacity,
        },
        AggregateRule {
            name: "pcie_lane_oversubscription",
            check: pcie_lane_oversubscription,
        },
    ],
};

/// Socket names compare case-insensitively, ignoring spaces, hyphens and
/// underscores.
pub fn normalize_socket(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, ' ' | '-' | '_'))
        .flat_map(char::to_uppercase)
        .collect()
}

fn finding(
    rule: RuleKind,
    severity: Severity,
    category: FindingCategory,
    message: String,
    components: &[&Part],
) -> Finding {
    Finding::new(
        rule,
        severity,
        category,
        message,
        components.iter().map(|p| p.key.clone()).collect(),
    )
}

fn socket_check(a: &Part, a_socket: Option<&str>, b: &Part, b_socket: Option<&str>) -> Check {
    match (a_socket, b_socket) {
        (Some(x), Some(y)) if normalize_socket(x) == normalize_socket(y) => Check::pass(95),
        (Some(x), Some(y)) => Check::fail(finding(
            RuleKind::SocketMismatch,
            Severity::Error,
            FindingCategory::Compatibility,
            format!("{} socket {x} does not match {} socket {y}", a.key, b.key),
            &[a, b],
        )),
        _ => Check::warn(
            75,
            finding(
                RuleKind::SocketUndetermined,
                Severity::Warning,
                FindingCategory::Data,
                format!(
                    "socket of {} or {} unknown, assuming compatible",
                    a.key, b.key
                ),
                &[a, b],
            ),
        ),
    }
}

fn cpu_board_socket(cpu: &Part, board: &Part) -> Check {
    let cpu_socket = cpu.attributes.cpu().and_then(|c| c.socket.as_deref());
    let board_socket = board.attributes.motherboard().and_then(|m| m.socket.as_deref());
    socket_check(cpu, cpu_socket, board, board_socket)
}

fn cpu_socket_parity(a: &Part, b: &Part) -> Check {
    let a_socket = a.attributes.cpu().and_then(|c| c.socket.as_deref());
    let b_socket = b.attributes.cpu().and_then(|c| c.socket.as_deref());
    match socket_check(a, a_socket, b, b_socket) {
        check if check.findings.is_empty() => Check::pass(100),
        check => check,
    }
}

fn undetermined(a: &Part, b: &Part, what: &str) -> Check {
    Check::warn(
        70,
        finding(
            RuleKind::RequirementsUndetermined,
            Severity::Warning,
            FindingCategory::Data,
            format!("{what} of {} against {} undetermined", a.key, b.key),
            &[a, b],
        ),
    )
}

/// Shared memory check against one platform part (CPU or board).
fn memory_platform(
    ram: &Part,
    platform: &Part,
    supported: Option<(&[rack_spec::MemoryType], Option<bool>)>,
) -> Check {
    let (Some(module), Some((types, ecc))) = (ram.attributes.ram(), supported) else {
        return undetermined(ram, platform, "memory support");
    };
    let mut findings = Vec::new();
    let mut score = 100;
    match module.memory_type {
        Some(kind) if !types.is_empty() && !types.contains(&kind) => {
            let list: Vec<String> = types.iter().map(ToString::to_string).collect();
            return Check::fail(finding(
                RuleKind::MemoryTypeMismatch,
                Severity::Error,
                FindingCategory::Compatibility,
                format!(
                    "{} is {kind} but {} supports {}",
                    ram.key,
                    platform.key,
                    list.join("/")
                ),
                &[ram, platform],
            ));
        }
        Some(_) if !types.is_empty() => {}
        _ => {
            let check = undetermined(ram, platform, "memory type");
            score = check.score;
            findings.extend(check.findings);
        }
    }
    if module.ecc == Some(true) && ecc == Some(false) {
        score = score.min(80);
        findings.push(finding(
            RuleKind::EccUnsupported,
            Severity::Warning,
            FindingCategory::Compatibility,
            format!("{} is ECC but {} has no ECC support", ram.key, platform.key),
            &[ram, platform],
        ));
    }
    Check { score, findings }
}

fn memory_cpu(ram: &Part, cpu: &Part) -> Check {
    let supported = cpu
        .attributes
        .cpu()
        .map(|c| (c.memory_types.as_slice(), c.ecc));
    memory_platform(ram, cpu, supported)
}

fn memory_board(ram: &Part, board: &Part) -> Check {
    let supported = board
        .attributes
        .motherboard()
        .map(|m| (m.memory_types.as_slice(), m.ecc));
    memory_platform(ram, board, supported)
}

fn memory_parity(a: &Part, b: &Part) -> Check {
    let (Some(x), Some(y)) = (a.attributes.ram(), b.attributes.ram()) else {
        return Check::pass(100);
    };
    if let (Some(tx), Some(ty)) = (x.memory_type, y.memory_type) {
        if tx != ty {
            return Check::fail(finding(
                RuleKind::MemoryTypeMismatch,
                Severity::Error,
                FindingCategory::Compatibility,
                format!("{} is {tx} but {} is {ty}", a.key, b.key),
                &[a, b],
            ));
        }
    }
    match (x.frequency_mhz, y.frequency_mhz) {
        (Some(fx), Some(fy)) if fx != fy => Check::warn(
            85,
            finding(
                RuleKind::MixedMemoryFrequency,
                Severity::Warning,
                FindingCategory::Compatibility,
                format!(
                    "{} runs at {fx} MHz and {} at {fy} MHz; both run at {} MHz",
                    a.key,
                    b.key,
                    fx.min(fy)
                ),
                &[a, b],
            ),
        ),
        _ => Check::pass(100),
    }
}

fn normalize_form_factor(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

fn chassis_form_factor(chassis: &Part, board: &Part) -> Check {
    let fits = chassis.attributes.chassis().map(|c| &c.form_factors);
    let ff = board
        .attributes
        .motherboard()
        .and_then(|m| m.form_factor.as_deref());
    match (fits, ff) {
        (Some(fits), Some(ff)) if !fits.is_empty() => {
            let norm = normalize_form_factor(ff);
            if fits.iter().any(|f| normalize_form_factor(f) == norm) {
                Check::pass(100)
            } else {
                Check::fail(finding(
                    RuleKind::FormFactorMismatch,
                    Severity::Error,
                    FindingCategory::Compatibility,
                    format!(
                        "{} ({ff}) does not fit {} ({})",
                        board.key,
                        chassis.key,
                        fits.join(", ")
                    ),
                    &[chassis, board],
                ))
            }
        }
        _ => Check::warn(
            75,
            finding(
                RuleKind::FormFactorUndetermined,
                Severity::Warning,
                FindingCategory::Data,
                format!(
                    "form factor fit of {} in {} undetermined",
                    board.key, chassis.key
                ),
                &[chassis, board],
            ),
        ),
    }
}

fn of_kind<'a>(parts: &[&'a Part], kind: ComponentType) -> Vec<&'a Part> {
    parts.iter().copied().filter(|p| p.key.kind == kind).collect()
}

fn total_quantity(parts: &[&Part]) -> u64 {
    parts.iter().map(|p| u64::from(p.quantity)).sum()
}

/// Sum of per-part lane counts; `None` when it does not fit in 64 bits.
fn lane_total(parts: &[(&Part, u64)]) -> Option<u64> {
    parts.iter().try_fold(0u64, |acc, (_, n)| acc.checked_add(*n))
}

fn single_instance(parts: &[&Part]) -> Vec<Check> {
    ComponentType::ALL
        .into_iter()
        .filter(|kind| kind.is_single_instance())
        .filter_map(|kind| {
            let present = of_kind(parts, kind);
            let count = total_quantity(&present);
            (count > 1).then(|| {
                Check::fail(finding(
                    RuleKind::SingleInstance,
                    Severity::Error,
                    FindingCategory::Capacity,
                    format!("{count} units of {kind}; at most one is allowed"),
                    &present,
                ))
            })
        })
        .collect()
}

fn cpu_socket_capacity(parts: &[&Part]) -> Vec<Check> {
    let cpus = of_kind(parts, ComponentType::Cpu);
    let count = total_quantity(&cpus);
    of_kind(parts, ComponentType::Motherboard)
        .into_iter()
        .filter_map(|board| {
            let sockets = board.attributes.motherboard()?.socket_count?;
            (count > u64::from(sockets)).then(|| {
                let mut involved = cpus.clone();
                involved.push(board);
                Check::fail(finding(
                    RuleKind::CpuSocketCapacity,
                    Severity::Error,
                    FindingCategory::Capacity,
                    format!("{count} CPUs exceed the {sockets} socket(s) of {}", board.key),
                    &involved,
                ))
            })
        })
        .collect()
}

fn dimm_capacity(parts: &[&Part]) -> Vec<Check> {
    let modules = of_kind(parts, ComponentType::Ram);
    let count = total_quantity(&modules);
    of_kind(parts, ComponentType::Motherboard)
        .into_iter()
        .filter_map(|board| {
            let slots = board.attributes.motherboard()?.dimm_slots?;
            (count > u64::from(slots)).then(|| {
                let mut involved = modules.clone();
                involved.push(board);
                Check::fail(finding(
                    RuleKind::DimmCapacity,
                    Severity::Error,
                    FindingCategory::Capacity,
                    format!("{count} memory modules exceed the {slots} DIMM slots of {}", board.key),
                    &involved,
                ))
            })
        })
        .collect()
}

fn memory_frequency_clamped(parts: &[&Part]) -> Vec<Check> {
    let mut limits: Vec<(&Part, u32)> = Vec::new();
    for &part in parts {
        let max = match part.key.kind {
            ComponentType::Cpu => part.attributes.cpu().and_then(|c| c.max_memory_mhz),
            ComponentType::Motherboard => {
                part.attributes.motherboard().and_then(|m| m.max_memory_mhz)
            }
            _ => None,
        };
        if let Some(max) = max {
            limits.push((part, max));
        }
    }
    let Some(effective) = limits.iter().map(|(_, max)| *max).min() else {
        return Vec::new();
    };
    let limiting: Vec<&Part> = limits
        .iter()
        .filter(|(_, max)| *max == effective)
        .map(|(p, _)| *p)
        .collect();
    of_kind(parts, ComponentType::Ram)
        .into_iter()
        .filter_map(|module| {
            let rated = module.attributes.ram()?.frequency_mhz?;
            (rated > effective).then(|| {
                let mut involved = vec![module];
                involved.extend(limiting.iter().copied());
                Check::warn(
                    85,
                    finding(
                        RuleKind::MemoryFrequencyClamped,
                        Severity::Warning,
                        FindingCategory::Compatibility,
                        format!(
                            "{} rated {rated} MHz will run at {effective} MHz",
                            module.key
                        ),
                        &involved,
                    ),
                )
            })
        })
        .collect()
}

fn chassis_bay_capacity(parts: &[&Part]) -> Vec<Check> {
    let drives: Vec<&Part> = of_kind(parts, ComponentType::Storage)
        .into_iter()
        .filter(|p| p.attributes.slot_requirement() != Some(SlotRequirement::M2))
        .collect();
    let count = total_quantity(&drives);
    of_kind(parts, ComponentType::Chassis)
        .into_iter()
        .filter_map(|chassis| {
            let bays = chassis.attributes.chassis()?.drive_bays?;
            (count > u64::from(bays)).then(|| {
                let mut involved = drives.clone();
                involved.push(chassis);
                Check::warn(
                    80,
                    finding(
                        RuleKind::ChassisBayCapacity,
                        Severity::Warning,
                        FindingCategory::Capacity,
                        format!("{count} drives exceed the {bays} bays of {}", chassis.key),
                        &involved,
                    ),
                )
            })
        })
        .collect()
}

fn pcie_lane_oversubscription(parts: &[&Part]) -> Vec<Check> {
    let cpus: Vec<(&Part, u64)> = of_kind(parts, ComponentType::Cpu)
        .into_iter()
        .filter_map(|p| {
            let lanes = p.attributes.cpu()?.pcie_lanes?;
            Some((p, u64::from(lanes) * u64::from(p.quantity)))
        })
        .collect();
    if cpus.is_empty() {
        return Vec::new();
    }
    let cards: Vec<(&Part, u64)> = parts
        .iter()
        .copied()
        .filter(|p| p.key.kind.is_expansion() && p.key.kind != ComponentType::Riser)
        .filter_map(|p| {
            let width = p.attributes.expansion()?.pcie_width?;
            Some((p, u64::from(width.lanes()) * u64::from(p.quantity)))
        })
        .collect();
    let involved: Vec<&Part> = cpus.iter().chain(cards.iter()).map(|(p, _)| *p).collect();
    let (Some(provided), Some(requested)) = (lane_total(&cpus), lane_total(&cards)) else {
        return vec![Check::fail(finding(
            RuleKind::PcieLaneOversubscription,
            Severity::Error,
            FindingCategory::Capacity,
            "PCIe lane totals exceed the countable range".to_string(),
            &involved,
        ))];
    };
    if requested <= provided {
        return Vec::new();
    }
    vec![Check::warn(
        80,
        finding(
            RuleKind::PcieLaneOversubscription,
            Severity::Warning,
            FindingCategory::Capacity,
            format!("cards request {requested} PCIe lanes but CPUs provide {provided}"),
            &involved,
        ),
    )]
}

/// Keys named by a check, for filtering aggregate results.
pub(crate) fn involves(check: &Check, key: &ComponentKey) -> bool {
    check
        .findings
        .iter()
        .any(|f| f.components.iter().any(|k| k == key))
}
