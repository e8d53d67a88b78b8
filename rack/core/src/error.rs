//! Assembler error surface.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rack_spec::{ComponentKey, ConfigId};

use crate::evaluator::{Finding, FindingCategory, Severity, Verdict};
use crate::ledger::LedgerError;
use crate::rules::RuleKind;
use crate::slots::SlotError;
use crate::store::StoreError;

/// Machine-checkable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown component or configuration.
    NotFound,
    /// Component owned by another configuration.
    Conflict,
    /// Blocking compatibility findings.
    CompatibilityBlocked,
    /// Not enough sockets, slots or bays.
    CapacityExhausted,
    /// Lifecycle or input precondition not met.
    ValidationFailed,
    /// Caller lacks the privilege for the mutation.
    PermissionDenied,
    /// Persistence failed; nothing was applied.
    Storage,
}

/// Failure of an assembler operation. Every variant leaves ledger, pool and
/// configuration exactly as they were before the call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssemblyError {
    /// Unknown component or configuration.
    #[error("not found: {0}")]
    NotFound(String),
    /// Component owned by another configuration.
    #[error("component {component} is claimed by configuration {owner}")]
    Conflict {
        /// Contested component.
        component: ComponentKey,
        /// Current owner.
        owner: ConfigId,
    },
    /// Blocking compatibility findings.
    #[error("compatibility blocked: {}", summarize(&verdict.failures))]
    CompatibilityBlocked {
        /// Full verdict, warnings included.
        verdict: Verdict,
    },
    /// Not enough sockets, slots or bays.
    #[error("capacity exhausted: {reason}")]
    CapacityExhausted {
        /// Human-readable reason.
        reason: String,
        /// Blocking capacity findings.
        findings: Vec<Finding>,
    },
    /// Lifecycle or input precondition not met.
    #[error("validation failed: {reason}")]
    ValidationFailed {
        /// Human-readable reason.
        reason: String,
        /// Findings behind the refusal.
        findings: Vec<Finding>,
    },
    /// Caller lacks the privilege for the mutation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Persistence failed; nothing was applied.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

fn summarize(findings: &[Finding]) -> String {
    findings
        .iter()
        .map(|f| format!("{} ({})", f.rule, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl AssemblyError {
    /// Error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::CompatibilityBlocked { .. } => ErrorKind::CompatibilityBlocked,
            Self::CapacityExhausted { .. } => ErrorKind::CapacityExhausted,
            Self::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Findings attached to the error.
    pub fn findings(&self) -> &[Finding] {
        match self {
            Self::CompatibilityBlocked { verdict } => &verdict.failures,
            Self::CapacityExhausted { findings, .. } | Self::ValidationFailed { findings, .. } => {
                findings
            }
            _ => &[],
        }
    }

    /// Serializable form.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            findings: self.findings().to_vec(),
        }
    }

    /// Blocking verdict to error: compatibility failures win over capacity.
    pub(crate) fn from_verdict(verdict: Verdict) -> Self {
        if verdict.blocks_compatibility() {
            return Self::CompatibilityBlocked { verdict };
        }
        Self::CapacityExhausted {
            reason: summarize(&verdict.failures),
            findings: verdict.failures,
        }
    }

    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            reason: reason.into(),
            findings: Vec::new(),
        }
    }
}

/// Error as printed by front ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Error kind.
    pub kind: ErrorKind,
    /// Human-readable reason.
    pub message: String,
    /// Findings behind the error.
    pub findings: Vec<Finding>,
}

impl From<LedgerError> for AssemblyError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(key) => Self::NotFound(format!("component {key}")),
            LedgerError::Conflict { key, owner } => Self::Conflict {
                component: key,
                owner,
            },
            LedgerError::Failed(_) | LedgerError::InvalidTransition { .. } => {
                Self::validation(err.to_string())
            }
        }
    }
}

impl From<SlotError> for AssemblyError {
    fn from(err: SlotError) -> Self {
        match &err {
            SlotError::RiserOccupied { riser, occupants } => {
                let mut involved = occupants.clone();
                involved.push(riser.clone());
                Self::ValidationFailed {
                    reason: err.to_string(),
                    findings: vec![Finding::new(
                        RuleKind::SlotUnavailable,
                        Severity::Error,
                        FindingCategory::Policy,
                        err.to_string(),
                        involved,
                    )],
                }
            }
            _ => Self::CapacityExhausted {
                reason: err.to_string(),
                findings: vec![Finding::new(
                    RuleKind::SlotUnavailable,
                    Severity::Error,
                    FindingCategory::Capacity,
                    err.to_string(),
                    Vec::new(),
                )],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rack_spec::{ComponentType, PcieWidth, SlotRequirement};

    #[test]
    fn ledger_errors_map_to_kinds() {
        let key = ComponentKey::new(ComponentType::Cpu, "c1");
        let conflict: AssemblyError = LedgerError::Conflict {
            key: key.clone(),
            owner: "cfg-a".into(),
        }
        .into();
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        let failed: AssemblyError = LedgerError::Failed(key.clone()).into();
        assert_eq!(failed.kind(), ErrorKind::ValidationFailed);
        let missing: AssemblyError = LedgerError::NotFound(key).into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn slot_exhaustion_is_capacity() {
        let err: AssemblyError = SlotError::Exhausted {
            requirement: SlotRequirement::Pcie(PcieWidth::X16),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::CapacityExhausted);
        assert_eq!(err.findings()[0].rule, RuleKind::SlotUnavailable);
        let report = serde_json::to_value(err.report()).unwrap();
        assert_eq!(report["kind"], "capacity_exhausted");
    }

    #[test]
    fn compatibility_wins_over_capacity() {
        let verdict = Verdict {
            compatible: false,
            score: 0,
            failures: vec![
                Finding::new(
                    RuleKind::SocketMismatch,
                    Severity::Error,
                    FindingCategory::Compatibility,
                    "x",
                    Vec::new(),
                ),
                Finding::new(
                    RuleKind::CpuSocketCapacity,
                    Severity::Error,
                    FindingCategory::Capacity,
                    "y",
                    Vec::new(),
                ),
            ],
            warnings: Vec::new(),
        };
        assert_eq!(
            AssemblyError::from_verdict(verdict).kind(),
            ErrorKind::CompatibilityBlocked
        );
    }
}
