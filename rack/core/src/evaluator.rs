//! Compatibility evaluator.
//!
//! Pure functions over attribute snapshots. A candidate is checked against
//! every present part its type pairs with, plus the aggregate rules over the
//! set with the candidate included. Verdicts do not depend on the order in
//! which parts were added.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::trace;

use rack_spec::ComponentKey;

use crate::resolve::ResolvedSpec;
use crate::rules::{involves, AggregateRule, Check, RuleKind, RuleSet};

/// Blocking or advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Blocks the operation.
    Error,
    /// Reported alongside a successful result.
    Warning,
}

/// What a finding is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    /// Parts cannot work together.
    Compatibility,
    /// Not enough sockets, slots or bays.
    Capacity,
    /// Attributes missing or low confidence.
    Data,
    /// Lifecycle or assembly policy.
    Policy,
}

/// One rule outcome worth reporting.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Finding {
    /// Machine-checkable kind.
    pub rule: RuleKind,
    /// Blocking or advisory.
    pub severity: Severity,
    /// Finding category.
    pub category: FindingCategory,
    /// Human-readable reason.
    pub message: String,
    /// Components involved, sorted.
    pub components: Vec<ComponentKey>,
}

impl Finding {
    /// Build a finding; component keys are sorted and deduplicated.
    pub fn new(
        rule: RuleKind,
        severity: Severity,
        category: FindingCategory,
        message: impl Into<String>,
        mut components: Vec<ComponentKey>,
    ) -> Self {
        components.sort();
        components.dedup();
        Self {
            rule,
            severity,
            category,
            message: message.into(),
            components,
        }
    }

    /// Advisory policy finding.
    pub fn policy(rule: RuleKind, message: impl Into<String>, components: Vec<ComponentKey>) -> Self {
        Self::new(rule, Severity::Warning, FindingCategory::Policy, message, components)
    }

    /// Whether the finding blocks.
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Evaluation outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// No blocking findings.
    pub compatible: bool,
    /// Minimum link score; 0 when blocked, 100 when nothing applied.
    pub score: u8,
    /// Blocking findings.
    pub failures: Vec<Finding>,
    /// Advisory findings.
    pub warnings: Vec<Finding>,
}

impl Default for Verdict {
    fn default() -> Self {
        Self {
            compatible: true,
            score: 100,
            failures: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl Verdict {
    fn from_checks(checks: Vec<Check>) -> Self {
        let score = checks.iter().map(|c| c.score).min().unwrap_or(100);
        let findings: BTreeSet<Finding> = checks.into_iter().flat_map(|c| c.findings).collect();
        let (failures, warnings): (Vec<_>, Vec<_>) =
            findings.into_iter().partition(Finding::is_blocking);
        let compatible = failures.is_empty();
        Self {
            compatible,
            score: if compatible { score } else { 0 },
            failures,
            warnings,
        }
    }

    /// Any blocking compatibility finding.
    pub fn blocks_compatibility(&self) -> bool {
        self.failures
            .iter()
            .any(|f| f.category != FindingCategory::Capacity)
    }

    /// Any blocking capacity finding.
    pub fn blocks_capacity(&self) -> bool {
        self.failures
            .iter()
            .any(|f| f.category == FindingCategory::Capacity)
    }

    /// Kinds of the blocking findings.
    pub fn failure_kinds(&self) -> BTreeSet<RuleKind> {
        self.failures.iter().map(|f| f.rule).collect()
    }

    /// Append an advisory finding.
    pub fn warn(&mut self, finding: Finding) {
        if !self.warnings.contains(&finding) {
            self.warnings.push(finding);
        }
    }
}

/// A component as the evaluator sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// Identity.
    pub key: ComponentKey,
    /// Units of this component in the configuration.
    pub quantity: u32,
    /// Resolved attributes.
    pub attributes: ResolvedSpec,
}

impl Part {
    /// Build a part.
    pub fn new(key: ComponentKey, quantity: u32, attributes: ResolvedSpec) -> Self {
        Self {
            key,
            quantity,
            attributes,
        }
    }
}

/// Check `candidate` against `existing`. Parts of `existing` with the
/// candidate's key are ignored.
pub fn evaluate(candidate: &Part, existing: &[Part], rules: &RuleSet, inferred_cap: u8) -> Verdict {
    let others: Vec<&Part> = existing.iter().filter(|p| p.key != candidate.key).collect();
    let mut checks = Vec::new();
    let mut involved: Vec<&Part> = vec![candidate];
    for &other in &others {
        let applied = apply_pairs(candidate, other, rules, inferred_cap, &mut checks);
        if applied {
            involved.push(other);
        }
    }
    let mut all = others.clone();
    all.push(candidate);
    all.sort_by(|a, b| a.key.cmp(&b.key));
    for rule in rules.aggregates {
        checks.extend(
            run_aggregate(rule, &all)
                .into_iter()
                .filter(|c| involves(c, &candidate.key)),
        );
    }
    checks.extend(data_checks(&involved, inferred_cap));
    Verdict::from_checks(checks)
}

/// Whole-set verdict, independent of the order of `parts`.
pub fn evaluate_set(parts: &[Part], rules: &RuleSet, inferred_cap: u8) -> Verdict {
    let mut checks = Vec::new();
    for (idx, a) in parts.iter().enumerate() {
        for b in &parts[idx + 1..] {
            apply_pairs(a, b, rules, inferred_cap, &mut checks);
        }
    }
    let mut all: Vec<&Part> = parts.iter().collect();
    all.sort_by(|a, b| a.key.cmp(&b.key));
    for rule in rules.aggregates {
        checks.extend(run_aggregate(rule, &all));
    }
    checks.extend(data_checks(&all, inferred_cap));
    Verdict::from_checks(checks)
}

fn run_aggregate(rule: &AggregateRule, parts: &[&Part]) -> Vec<Check> {
    let checks = (rule.check)(parts);
    if !checks.is_empty() {
        trace!(rule = rule.name, raised = checks.len(), "aggregate rule");
    }
    checks
}

fn apply_pairs(a: &Part, b: &Part, rules: &RuleSet, cap: u8, out: &mut Vec<Check>) -> bool {
    let mut applied = false;
    for rule in rules.pairs {
        let Some((left, right)) = rule.orient(a, b) else {
            continue;
        };
        let mut check = (rule.check)(left, right);
        if left.attributes.is_inferred() || right.attributes.is_inferred() {
            check.score = check.score.min(cap);
        }
        trace!(
            rule = rule.name,
            left = %left.key,
            right = %right.key,
            score = check.score,
            "pair rule"
        );
        out.push(check);
        applied = true;
    }
    applied
}

fn data_checks(parts: &[&Part], cap: u8) -> Vec<Check> {
    let mut checks = Vec::new();
    for part in parts {
        if let Some(err) = &part.attributes.lookup_error {
            checks.push(Check::warn(
                70,
                Finding::new(
                    RuleKind::OracleUnavailable,
                    Severity::Warning,
                    FindingCategory::Data,
                    format!("specification lookup for {} failed: {err}", part.key),
                    vec![part.key.clone()],
                ),
            ));
        }
        if part.attributes.is_inferred() {
            checks.push(Check::warn(
                cap,
                Finding::new(
                    RuleKind::InferredAttributes,
                    Severity::Warning,
                    FindingCategory::Data,
                    format!("attributes of {} inferred from inventory notes", part.key),
                    vec![part.key.clone()],
                ),
            ));
        }
    }
    checks
}
