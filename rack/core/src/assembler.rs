//! Configuration assembler.
//!
//! Every mutation runs as one unit of work: configuration lock, evaluation,
//! ledger row lock, slot allocation on a working copy, store commit, and
//! only then the row write and the swap of the working copy. A failure at
//! any step leaves nothing behind.
//!
//! Locks are taken in that order: configuration, rows in key order, then the
//! journal. The journal lock is shared by every configuration, so store
//! commits are serialized even when the rows involved are disjoint.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use rack_spec::{
    AttributeSource, ComponentKey, ComponentSpec, ComponentType, ConfigId, ConfigMode,
    ConfigStatus, Privilege, SlotId, SlotRequirement, SpecificationOracle, Timestamp,
};

use crate::config::EngineConfig;
use crate::error::AssemblyError;
use crate::evaluator::{evaluate, evaluate_set, Finding, FindingCategory, Part, Severity, Verdict};
use crate::journal::{ClaimJournal, JournalEntry};
use crate::ledger::{ClaimRequest, ComponentRow, Ledger, Release, ReleaseRequest};
use crate::model::{ComponentAssociation, ConfigurationRecord};
use crate::now_millis;
use crate::resolve::{resolve, ResolvedSpec};
use crate::rules::{RuleKind, RuleSet};
use crate::slots::{ClassUsage, Slot, SlotError, SlotPool};
use crate::store::{ConfigurationChange, Store, StoreError, UnitOfWork};

type ConfigCell = Arc<Mutex<Option<ConfigurationRecord>>>;

/// Request to add a component to a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    /// Target configuration.
    pub config: ConfigId,
    /// Component to add.
    pub component: ComponentKey,
    /// Units; must be 1 for slot-bound components.
    pub quantity: u32,
    /// Preferred slot.
    pub slot_hint: Option<SlotId>,
    /// Pre-empt a component owned by another configuration.
    pub allow_override: bool,
    /// Caller privilege.
    pub privilege: Privilege,
}

impl AddRequest {
    /// One unit, no hint, no override, standard privilege.
    pub fn new(config: impl Into<ConfigId>, component: ComponentKey) -> Self {
        Self {
            config: config.into(),
            component,
            quantity: 1,
            slot_hint: None,
            allow_override: false,
            privilege: Privilege::Standard,
        }
    }

    /// Set the quantity.
    pub fn quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    /// Ask for a specific slot.
    pub fn slot(mut self, slot: impl Into<SlotId>) -> Self {
        self.slot_hint = Some(slot.into());
        self
    }

    /// Pre-empt a foreign owner.
    pub fn override_owner(mut self) -> Self {
        self.allow_override = true;
        self
    }

    /// Set the caller privilege.
    pub fn privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }
}

/// Result of a successful add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOutcome {
    /// The membership record.
    pub association: ComponentAssociation,
    /// Assigned slot, if placed.
    pub assigned_slot: Option<SlotId>,
    /// Compatibility of the component with the rest of the configuration.
    pub compatibility: Verdict,
}

/// Result of a successful remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveOutcome {
    /// Removed component.
    pub component: ComponentKey,
    /// Slot it vacated.
    pub released_slot: Option<SlotId>,
    /// Ledger effect.
    pub release: Release,
    /// Components returned to deferred placement (motherboard removal).
    pub deferred: Vec<ComponentKey>,
}

/// Whole-configuration check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Configuration checked.
    pub config: ConfigId,
    /// No blocking findings.
    pub valid: bool,
    /// Minimum link score.
    pub score: u8,
    /// Blocking findings.
    pub critical_errors: Vec<Finding>,
    /// Advisory findings.
    pub warnings: Vec<Finding>,
    /// Status after the check.
    pub status: ConfigStatus,
}

/// Proof of finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeReceipt {
    /// Finalized configuration.
    pub config: ConfigId,
    /// When it was finalized.
    pub finalized_at: Timestamp,
    /// Score at finalization.
    pub score: u8,
}

/// Slot usage of a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolReport {
    /// Configuration.
    pub config: ConfigId,
    /// Per-class usage; empty before a motherboard is added.
    pub classes: Vec<ClassUsage>,
    /// Every slot with its occupant.
    pub slots: Vec<Slot>,
    /// Slot-bound components waiting for a pool.
    pub deferred: Vec<ComponentKey>,
}

/// An available component that fits a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateReport {
    /// Candidate component.
    pub component: ComponentKey,
    /// Provenance of its attributes.
    pub source: AttributeSource,
    /// Score it would add with.
    pub score: u8,
    /// Advisory findings it would add with.
    pub warnings: Vec<Finding>,
}

/// Orchestrates ledger, evaluator, allocator and store.
pub struct Assembler {
    ledger: Ledger,
    oracle: Arc<dyn SpecificationOracle>,
    store: Arc<dyn Store>,
    config: EngineConfig,
    rules: &'static RuleSet,
    configurations: RwLock<BTreeMap<ConfigId, ConfigCell>>,
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("config", &self.config)
            .field("configurations", &self.configurations.read().len())
            .finish_non_exhaustive()
    }
}

impl Assembler {
    /// Empty assembler.
    pub fn new(
        oracle: Arc<dyn SpecificationOracle>,
        store: Arc<dyn Store>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger: Ledger::new(),
            oracle,
            store,
            config,
            rules: RuleSet::standard(),
            configurations: RwLock::new(BTreeMap::new()),
        }
    }

    /// Assembler over everything `store` has persisted. The journal chain
    /// is replayed before anything is loaded.
    pub fn restore(
        oracle: Arc<dyn SpecificationOracle>,
        store: Arc<dyn Store>,
        config: EngineConfig,
    ) -> Result<Self, AssemblyError> {
        let snapshot = store.snapshot()?;
        let journal = ClaimJournal::from_entries(snapshot.journal).map_err(|e| {
            error!("persisted journal failed replay: {e}");
            StoreError::Encoding(format!("journal replay: {e}"))
        })?;
        let ledger = Ledger::with_journal(journal);
        ledger.load_rows(snapshot.components);
        let configurations = snapshot
            .configurations
            .into_iter()
            .map(|c| (c.id.clone(), Arc::new(Mutex::new(Some(c)))))
            .collect();
        info!(
            "restored {} component(s), {} journal entr(ies)",
            ledger.rows().len(),
            ledger.journal().len()
        );
        Ok(Self {
            ledger,
            oracle,
            store,
            config,
            rules: RuleSet::standard(),
            configurations: RwLock::new(configurations),
        })
    }

    /// Component ledger.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Claim journal.
    pub fn journal(&self) -> &ClaimJournal {
        self.ledger.journal()
    }

    /// Engine configuration.
    pub fn engine_config(&self) -> &EngineConfig {
        &self.config
    }

    /// Onboard component rows. Rows already known are left untouched.
    /// Returns how many were added.
    pub fn provision(&self, rows: Vec<ComponentRow>) -> Result<usize, AssemblyError> {
        let fresh: Vec<ComponentRow> = rows
            .into_iter()
            .filter(|r| self.ledger.row(&r.key).is_none())
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }
        self.store.commit(&UnitOfWork {
            rows: fresh.clone(),
            ..UnitOfWork::default()
        })?;
        let count = fresh
            .into_iter()
            .filter(|row| self.ledger.provision(row.clone()))
            .count();
        info!("provisioned {count} component(s)");
        Ok(count)
    }

    /// Repair hook: take a component out of service.
    pub fn mark_failed(&self, key: &ComponentKey) -> Result<ComponentRow, AssemblyError> {
        self.ledger
            .mark_failed_with(key, |row, entries| self.commit_row(row, entries))
    }

    /// Repair hook: return a failed component to service.
    pub fn restore_component(&self, key: &ComponentKey) -> Result<ComponentRow, AssemblyError> {
        self.ledger
            .restore_with(key, |row, entries| self.commit_row(row, entries))
    }

    fn commit_row(&self, row: &ComponentRow, entries: &[JournalEntry]) -> Result<(), AssemblyError> {
        self.store.commit(&UnitOfWork {
            rows: vec![row.clone()],
            configuration: None,
            journal: entries.to_vec(),
        })?;
        Ok(())
    }

    /// Create an empty draft configuration.
    pub fn create_configuration(
        &self,
        id: impl Into<ConfigId>,
        name: impl Into<String>,
        mode: ConfigMode,
    ) -> Result<ConfigurationRecord, AssemblyError> {
        let id = id.into();
        let mut configurations = self.configurations.write();
        if configurations.contains_key(&id) {
            return Err(AssemblyError::validation(format!(
                "configuration {id} already exists"
            )));
        }
        let record = ConfigurationRecord::new(id.clone(), name, mode, now_millis());
        self.store.commit(&UnitOfWork {
            configuration: Some(ConfigurationChange::Upsert(record.clone())),
            ..UnitOfWork::default()
        })?;
        configurations.insert(id.clone(), Arc::new(Mutex::new(Some(record.clone()))));
        info!("created configuration {id} ({mode:?})");
        Ok(record)
    }

    /// Snapshot of one configuration.
    pub fn configuration(&self, id: &ConfigId) -> Result<ConfigurationRecord, AssemblyError> {
        let cell = self.cell(id)?;
        let guard = cell.lock();
        guard.clone().ok_or_else(|| not_found(id))
    }

    /// Snapshots of every configuration, ordered by id.
    pub fn list(&self) -> Vec<ConfigurationRecord> {
        let cells: Vec<ConfigCell> = self.configurations.read().values().cloned().collect();
        cells.iter().filter_map(|c| c.lock().clone()).collect()
    }

    /// Add a component: evaluate, claim, place, commit.
    ///
    /// Compatibility is checked before the ledger is consulted, so a part
    /// that is both incompatible and owned elsewhere reports
    /// `CompatibilityBlocked` rather than `Conflict`.
    pub fn add_component(&self, req: AddRequest) -> Result<AddOutcome, AssemblyError> {
        let cell = self.cell(&req.config)?;
        let mut guard = cell.lock();
        let record = guard.as_mut().ok_or_else(|| not_found(&req.config))?;
        ensure_mutable(record, req.privilege)?;
        if req.quantity == 0 {
            return Err(AssemblyError::validation("quantity must be at least 1"));
        }
        if req.quantity > self.config.max_quantity {
            return Err(AssemblyError::validation(format!(
                "quantity {} exceeds the limit of {}",
                req.quantity, self.config.max_quantity
            )));
        }
        if req.allow_override && !self.config.allow_override {
            return Err(AssemblyError::PermissionDenied(
                "component override is disabled".into(),
            ));
        }

        let existing = self.parts(record);
        if let Some(association) = record.association(&req.component) {
            let part = existing
                .iter()
                .find(|p| p.key == req.component)
                .cloned()
                .unwrap_or_else(|| {
                    Part::new(req.component.clone(), association.quantity, ResolvedSpec::unknown())
                });
            let mut compatibility = self.check(&part, &existing);
            compatibility.warn(Finding::policy(
                RuleKind::AlreadyPresent,
                format!("{} is already in configuration {}", req.component, req.config),
                vec![req.component.clone()],
            ));
            debug!("{} already in {}, returning existing association", req.component, req.config);
            return Ok(AddOutcome {
                association: association.clone(),
                assigned_slot: association.slot.clone(),
                compatibility,
            });
        }

        let row = self
            .ledger
            .row(&req.component)
            .ok_or_else(|| AssemblyError::NotFound(format!("component {}", req.component)))?;
        let part = Part::new(
            req.component.clone(),
            req.quantity,
            resolve(self.oracle.as_ref(), &req.component, row.notes.as_deref()),
        );
        let requirement = part.attributes.slot_requirement();
        if requirement.is_some() && req.quantity != 1 {
            return Err(AssemblyError::validation(format!(
                "{} occupies a slot; quantity must be 1",
                req.component
            )));
        }

        let mut compatibility = self.check(&part, &existing);
        if !compatibility.compatible {
            warn!(
                "adding {} to {} blocked: {:?}",
                req.component,
                req.config,
                compatibility.failure_kinds()
            );
            return Err(AssemblyError::from_verdict(compatibility));
        }
        if requirement.is_none() && needs_slot(req.component.kind) {
            compatibility.warn(Finding::new(
                RuleKind::RequirementsUndetermined,
                Severity::Warning,
                FindingCategory::Data,
                format!("slot requirement of {} unknown; not placed", req.component),
                vec![req.component.clone()],
            ));
        }

        let claim_req = ClaimRequest {
            key: req.component.clone(),
            config: req.config.clone(),
            mode: record.mode,
            allow_preempt: req.allow_override,
        };
        let snapshot: &ConfigurationRecord = &*record;
        let (claim, (working, association, notes)) =
            self.ledger.claim_with(&claim_req, |claim| {
                let mut working = snapshot.clone();
                let mut notes = Vec::new();
                let slot = self.place_candidate(
                    &mut working,
                    &part,
                    &existing,
                    req.slot_hint.as_ref(),
                    &mut notes,
                )?;
                let preempted_from = claim.preempted_owner().cloned();
                let association = ComponentAssociation {
                    config: req.config.clone(),
                    component: req.component.clone(),
                    quantity: req.quantity,
                    slot,
                    virtual_claim: claim.virtual_claim,
                    preempted_from,
                    added_at: now_millis(),
                };
                working.associations.push(association.clone());
                let rows = if claim.virtual_claim {
                    Vec::new()
                } else {
                    vec![claim.row.clone()]
                };
                self.commit(rows, &working, vec![claim.event(req.allow_override)])?;
                Ok::<_, AssemblyError>((working, association, notes))
            })
            .map_err(|e| {
                debug!("add of {} to {} rolled back: {e}", req.component, req.config);
                e
            })?;
        *record = working;

        for finding in notes {
            compatibility.warn(finding);
        }
        if let Some(previous_owner) = claim.preempted_owner() {
            compatibility.warn(Finding::policy(
                RuleKind::OverridePreempted,
                format!("{} taken from configuration {previous_owner}", req.component),
                vec![req.component.clone()],
            ));
        }
        info!(
            "added {} to {} (slot {:?}, score {})",
            req.component, req.config, association.slot, compatibility.score
        );
        Ok(AddOutcome {
            assigned_slot: association.slot.clone(),
            association,
            compatibility,
        })
    }

    /// Remove a component: release slot and claim, commit.
    pub fn remove_component(
        &self,
        config: &ConfigId,
        component: &ComponentKey,
        privilege: Privilege,
    ) -> Result<RemoveOutcome, AssemblyError> {
        let cell = self.cell(config)?;
        let mut guard = cell.lock();
        let record = guard.as_mut().ok_or_else(|| not_found(config))?;
        ensure_mutable(record, privilege)?;
        if !record.contains(component) {
            return Err(AssemblyError::NotFound(format!(
                "component {component} in configuration {config}"
            )));
        }

        let mut working = record.clone();
        working.associations.retain(|a| &a.component != component);
        let mut deferred = Vec::new();
        let released_slot = if component.kind == ComponentType::Motherboard {
            working.pool = None;
            for association in working.associations.iter_mut() {
                if association.slot.take().is_some() {
                    deferred.push(association.component.clone());
                }
            }
            None
        } else {
            match working.pool.as_mut() {
                Some(pool) => pool.release_occupant(component)?,
                None => None,
            }
        };

        let mode = record.mode;
        let request = ReleaseRequest {
            key: component.clone(),
            config: config.clone(),
            mode,
        };
        let (mut releases, ()) =
            self.ledger
                .release_many_with(std::slice::from_ref(&request), |releases| {
                    self.commit_releases(releases, mode, &working)
                })?;
        *record = working;
        let release = releases.remove(0);
        info!(
            "removed {component} from {config} (slot {released_slot:?}, {} deferred)",
            deferred.len()
        );
        Ok(RemoveOutcome {
            component: component.clone(),
            released_slot,
            release,
            deferred,
        })
    }

    /// Evaluate the whole configuration; a clean draft becomes validated.
    pub fn validate(&self, config: &ConfigId) -> Result<ValidationReport, AssemblyError> {
        let cell = self.cell(config)?;
        let mut guard = cell.lock();
        let record = guard.as_mut().ok_or_else(|| not_found(config))?;
        let mut verdict = self.check_set(record);
        for finding in self.policy_findings(record, Severity::Warning) {
            verdict.warn(finding);
        }
        if verdict.compatible && record.status == ConfigStatus::Draft {
            let mut working = record.clone();
            working.status = ConfigStatus::Validated;
            self.commit(Vec::new(), &working, Vec::new())?;
            *record = working;
            info!("configuration {config} validated (score {})", verdict.score);
        }
        Ok(ValidationReport {
            config: config.clone(),
            valid: verdict.compatible,
            score: verdict.score,
            critical_errors: verdict.failures,
            warnings: verdict.warnings,
            status: record.status,
        })
    }

    /// Record that a validated configuration was physically built.
    pub fn mark_built(&self, config: &ConfigId) -> Result<ConfigurationRecord, AssemblyError> {
        let cell = self.cell(config)?;
        let mut guard = cell.lock();
        let record = guard.as_mut().ok_or_else(|| not_found(config))?;
        if record.mode == ConfigMode::Test {
            return Err(test_mode_barred(config, "built"));
        }
        if record.status != ConfigStatus::Validated {
            return Err(AssemblyError::validation(format!(
                "configuration {config} is {:?}; only validated configurations can be built",
                record.status
            )));
        }
        let verdict = self.check_set(record);
        if !verdict.compatible {
            return Err(AssemblyError::ValidationFailed {
                reason: format!("configuration {config} no longer validates"),
                findings: verdict.failures,
            });
        }
        let mut working = record.clone();
        working.status = ConfigStatus::Built;
        self.commit(Vec::new(), &working, Vec::new())?;
        *record = working.clone();
        info!("configuration {config} built");
        Ok(working)
    }

    /// Make the configuration a permanent record.
    pub fn finalize(&self, config: &ConfigId) -> Result<FinalizeReceipt, AssemblyError> {
        let cell = self.cell(config)?;
        let mut guard = cell.lock();
        let record = guard.as_mut().ok_or_else(|| not_found(config))?;
        if record.mode == ConfigMode::Test {
            return Err(test_mode_barred(config, "finalized"));
        }
        if record.status == ConfigStatus::Finalized {
            return Err(AssemblyError::validation(format!(
                "configuration {config} is already finalized"
            )));
        }
        let verdict = self.check_set(record);
        let mut blocking = verdict.failures.clone();
        blocking.extend(self.policy_findings(record, Severity::Error));
        if !blocking.is_empty() {
            let kinds: Vec<&str> = blocking.iter().map(|f| f.rule.as_str()).collect();
            warn!("finalize of {config} refused: {kinds:?}");
            return Err(AssemblyError::ValidationFailed {
                reason: format!("configuration {config} cannot be finalized: {}", kinds.join(", ")),
                findings: blocking,
            });
        }
        let finalized_at = now_millis();
        let mut working = record.clone();
        working.status = ConfigStatus::Finalized;
        working.finalized_at = Some(finalized_at);
        self.commit(Vec::new(), &working, Vec::new())?;
        *record = working;
        info!("configuration {config} finalized at {finalized_at}");
        Ok(FinalizeReceipt {
            config: config.clone(),
            finalized_at,
            score: verdict.score,
        })
    }

    /// Elevated only: move a finalized configuration back to built.
    pub fn reopen(
        &self,
        config: &ConfigId,
        privilege: Privilege,
    ) -> Result<ConfigurationRecord, AssemblyError> {
        if privilege != Privilege::Elevated {
            return Err(AssemblyError::PermissionDenied(format!(
                "reopening {config} requires elevated privilege"
            )));
        }
        let cell = self.cell(config)?;
        let mut guard = cell.lock();
        let record = guard.as_mut().ok_or_else(|| not_found(config))?;
        if record.status != ConfigStatus::Finalized {
            return Err(AssemblyError::validation(format!(
                "configuration {config} is not finalized"
            )));
        }
        let mut working = record.clone();
        working.status = ConfigStatus::Built;
        working.finalized_at = None;
        self.commit(Vec::new(), &working, Vec::new())?;
        *record = working.clone();
        warn!("configuration {config} reopened");
        Ok(working)
    }

    /// Tear a configuration down, releasing every claim it holds.
    pub fn delete_configuration(
        &self,
        config: &ConfigId,
        privilege: Privilege,
    ) -> Result<Vec<Release>, AssemblyError> {
        let cell = self.cell(config)?;
        let mut guard = cell.lock();
        let record = guard.as_mut().ok_or_else(|| not_found(config))?;
        if record.status == ConfigStatus::Finalized && privilege != Privilege::Elevated {
            return Err(AssemblyError::PermissionDenied(format!(
                "configuration {config} is finalized; deleting it requires elevated privilege"
            )));
        }
        let mode = record.mode;
        let requests: Vec<ReleaseRequest> = record
            .associations
            .iter()
            .map(|a| ReleaseRequest {
                key: a.component.clone(),
                config: config.clone(),
                mode,
            })
            .collect();
        let (releases, ()) = self.ledger.release_many_with(&requests, |releases| {
            let rows = releases
                .iter()
                .filter(|r| r.writes_row())
                .map(|r| r.row.clone())
                .collect();
            let events = releases.iter().map(|r| r.event(mode)).collect();
            self.ledger
                .journal()
                .append_with(events, |entries| {
                    self.store.commit(&UnitOfWork {
                        rows,
                        configuration: Some(ConfigurationChange::Delete { id: config.clone() }),
                        journal: entries.to_vec(),
                    })
                })
                .map(|_| ())
                .map_err(AssemblyError::from)
        })?;
        *guard = None;
        self.configurations.write().remove(config);
        info!("deleted configuration {config}, released {} component(s)", releases.len());
        Ok(releases)
    }

    /// Slot usage of a configuration.
    pub fn pool_state(&self, config: &ConfigId) -> Result<PoolReport, AssemblyError> {
        let record = self.configuration(config)?;
        let deferred = self
            .parts(&record)
            .into_iter()
            .filter(|p| p.attributes.slot_requirement().is_some())
            .filter(|p| record.association(&p.key).is_some_and(|a| a.slot.is_none()))
            .map(|p| p.key)
            .collect();
        let (classes, slots) = match &record.pool {
            Some(pool) => (pool.state(), pool.slots().cloned().collect()),
            None => (Vec::new(), Vec::new()),
        };
        Ok(PoolReport {
            config: config.clone(),
            classes,
            slots,
            deferred,
        })
    }

    /// Available components of `kind` that would add cleanly, best first.
    /// Evaluated on a snapshot outside any lock, so the answer is advisory.
    pub fn compatible_candidates(
        &self,
        config: &ConfigId,
        kind: ComponentType,
    ) -> Result<Vec<CandidateReport>, AssemblyError> {
        let record = self.configuration(config)?;
        let existing = self.parts(&record);
        let mut candidates: Vec<CandidateReport> = self
            .ledger
            .available(kind)
            .into_iter()
            .filter(|row| !record.contains(&row.key))
            .filter_map(|row| {
                let attributes = resolve(self.oracle.as_ref(), &row.key, row.notes.as_deref());
                if !attributes.has_attributes() {
                    return None;
                }
                let source = attributes.source;
                let part = Part::new(row.key.clone(), 1, attributes);
                let verdict = self.check(&part, &existing);
                verdict.compatible.then(|| CandidateReport {
                    component: row.key,
                    source,
                    score: verdict.score,
                    warnings: verdict.warnings,
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.component.cmp(&b.component))
        });
        Ok(candidates)
    }

    fn cell(&self, id: &ConfigId) -> Result<ConfigCell, AssemblyError> {
        self.configurations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    fn parts(&self, record: &ConfigurationRecord) -> Vec<Part> {
        record
            .associations
            .iter()
            .map(|a| {
                let notes = self.ledger.row(&a.component).and_then(|r| r.notes);
                Part::new(
                    a.component.clone(),
                    a.quantity,
                    resolve(self.oracle.as_ref(), &a.component, notes.as_deref()),
                )
            })
            .collect()
    }

    fn check(&self, candidate: &Part, existing: &[Part]) -> Verdict {
        evaluate(candidate, existing, self.rules, self.config.inferred_score_cap)
    }

    fn check_set(&self, record: &ConfigurationRecord) -> Verdict {
        evaluate_set(&self.parts(record), self.rules, self.config.inferred_score_cap)
    }

    /// Required types, test mode and deferred placement, at `severity`.
    fn policy_findings(&self, record: &ConfigurationRecord, severity: Severity) -> Vec<Finding> {
        let mut findings: Vec<Finding> = self
            .config
            .required_types
            .iter()
            .filter(|kind| record.quantity_of(**kind) == 0)
            .map(|kind| {
                Finding::new(
                    RuleKind::RequiredTypeMissing,
                    severity,
                    FindingCategory::Policy,
                    format!("configuration has no {kind}"),
                    Vec::new(),
                )
            })
            .collect();
        if record.mode == ConfigMode::Test {
            findings.push(Finding::new(
                RuleKind::TestMode,
                Severity::Warning,
                FindingCategory::Policy,
                "test-mode configurations cannot be finalized",
                Vec::new(),
            ));
        }
        if record.pool.is_none() {
            let waiting: Vec<ComponentKey> = self
                .parts(record)
                .into_iter()
                .filter(|p| p.attributes.slot_requirement().is_some())
                .map(|p| p.key)
                .collect();
            if !waiting.is_empty() {
                findings.push(Finding::new(
                    RuleKind::SlotDeferred,
                    severity,
                    FindingCategory::Capacity,
                    format!("{} component(s) wait for a motherboard", waiting.len()),
                    waiting,
                ));
            }
        }
        findings
    }

    /// Place the candidate on `working`. A motherboard builds the pool and
    /// seats every deferred component.
    fn place_candidate(
        &self,
        working: &mut ConfigurationRecord,
        part: &Part,
        existing: &[Part],
        hint: Option<&SlotId>,
        notes: &mut Vec<Finding>,
    ) -> Result<Option<SlotId>, AssemblyError> {
        if part.key.kind == ComponentType::Motherboard {
            let Some(board) = part.attributes.motherboard() else {
                notes.push(Finding::new(
                    RuleKind::RequirementsUndetermined,
                    Severity::Warning,
                    FindingCategory::Data,
                    format!("slot capacity of {} unknown; no slot pool built", part.key),
                    vec![part.key.clone()],
                ));
                return Ok(None);
            };
            let mut pool = SlotPool::from_board(board);
            let mut waiting: Vec<&Part> = existing
                .iter()
                .filter(|p| p.attributes.slot_requirement().is_some())
                .collect();
            waiting.sort_by_key(|p| {
                let lanes = match p.attributes.slot_requirement() {
                    Some(SlotRequirement::Pcie(w)) => w.lanes(),
                    _ => 0,
                };
                (p.key.kind != ComponentType::Riser, Reverse(lanes))
            });
            for waiting_part in waiting {
                let slot = place(&mut pool, waiting_part, None)?;
                if let Some(association) = working
                    .associations
                    .iter_mut()
                    .find(|a| a.component == waiting_part.key)
                {
                    association.slot = slot;
                }
            }
            working.pool = Some(pool);
            return Ok(None);
        }
        if part.attributes.slot_requirement().is_none() {
            return Ok(None);
        }
        match working.pool.as_mut() {
            Some(pool) => Ok(place(pool, part, hint)?),
            None if hint.is_some() => Err(AssemblyError::CapacityExhausted {
                reason: "no slot pool until a motherboard is added".into(),
                findings: Vec::new(),
            }),
            None => {
                notes.push(Finding::new(
                    RuleKind::SlotDeferred,
                    Severity::Warning,
                    FindingCategory::Capacity,
                    format!("{} will be placed once a motherboard is added", part.key),
                    vec![part.key.clone()],
                ));
                Ok(None)
            }
        }
    }

    fn commit(
        &self,
        rows: Vec<ComponentRow>,
        record: &ConfigurationRecord,
        events: Vec<crate::journal::ClaimEvent>,
    ) -> Result<(), AssemblyError> {
        self.ledger
            .journal()
            .append_with(events, |entries| {
                self.store.commit(&UnitOfWork {
                    rows,
                    configuration: Some(ConfigurationChange::Upsert(record.clone())),
                    journal: entries.to_vec(),
                })
            })
            .map_err(|e| {
                error!("commit of configuration {} failed: {e}", record.id);
                AssemblyError::from(e)
            })?;
        Ok(())
    }

    fn commit_releases(
        &self,
        releases: &[Release],
        mode: ConfigMode,
        record: &ConfigurationRecord,
    ) -> Result<(), AssemblyError> {
        let rows = releases
            .iter()
            .filter(|r| r.writes_row())
            .map(|r| r.row.clone())
            .collect();
        let events = releases.iter().map(|r| r.event(mode)).collect();
        self.commit(rows, record, events)
    }
}

fn place(pool: &mut SlotPool, part: &Part, hint: Option<&SlotId>) -> Result<Option<SlotId>, SlotError> {
    let Some(req) = part.attributes.slot_requirement() else {
        return Ok(None);
    };
    match (part.key.kind, req) {
        (ComponentType::Riser, SlotRequirement::Pcie(width)) => {
            let provides = part
                .attributes
                .spec
                .as_ref()
                .map(ComponentSpec::provided_slots)
                .unwrap_or_default();
            pool.attach_riser(&part.key, width, provides, hint).map(Some)
        }
        _ => pool.assign(&part.key, req, hint).map(Some),
    }
}

fn needs_slot(kind: ComponentType) -> bool {
    kind.is_expansion() || matches!(kind, ComponentType::Ram | ComponentType::Storage)
}

fn ensure_mutable(record: &ConfigurationRecord, privilege: Privilege) -> Result<(), AssemblyError> {
    match (record.status, privilege) {
        (ConfigStatus::Finalized, _) => Err(AssemblyError::PermissionDenied(format!(
            "configuration {} is finalized; reopen it first",
            record.id
        ))),
        (ConfigStatus::Built, Privilege::Standard) => Err(AssemblyError::PermissionDenied(
            format!(
                "configuration {} is built; changes need elevated privilege",
                record.id
            ),
        )),
        _ => Ok(()),
    }
}

fn not_found(id: &ConfigId) -> AssemblyError {
    AssemblyError::NotFound(format!("configuration {id}"))
}

fn test_mode_barred(config: &ConfigId, what: &str) -> AssemblyError {
    AssemblyError::ValidationFailed {
        reason: format!("test-mode configuration {config} cannot be {what}"),
        findings: vec![Finding::new(
            RuleKind::TestMode,
            Severity::Error,
            FindingCategory::Policy,
            format!("test-mode configurations cannot be {what}"),
            Vec::new(),
        )],
    }
}
