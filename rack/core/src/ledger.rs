//! Inventory ledger: exclusive ownership state of every component row.
//!
//! Each row sits behind its own mutex. A claim checks and writes the row
//! while holding that mutex, so two configurations racing for the same
//! available component serialize and exactly one wins. Configurations
//! touching disjoint rows never contend.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use rack_spec::{ComponentKey, ComponentStatus, ComponentType, ConfigId, ConfigMode};

use crate::journal::{ClaimEvent, ClaimEventKind, ClaimJournal, JournalEntry};

/// Persisted state of one physical component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRow {
    /// Identity.
    #[serde(flatten)]
    pub key: ComponentKey,
    /// Ownership status.
    #[serde(default)]
    pub status: ComponentStatus,
    /// Owning configuration while in use.
    #[serde(default)]
    pub owner: Option<ConfigId>,
    /// Free-text inventory notes.
    #[serde(default)]
    pub notes: Option<String>,
}

impl ComponentRow {
    /// Fresh, available row.
    pub fn available(key: ComponentKey) -> Self {
        Self {
            key,
            status: ComponentStatus::Available,
            owner: None,
            notes: None,
        }
    }
}

/// Ledger failure. None of these leave a partial write behind.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// No such component row.
    #[error("component {0} not found")]
    NotFound(ComponentKey),
    /// Claimed by another configuration and no override was given.
    #[error("component {key} is claimed by configuration {owner}")]
    Conflict {
        /// Contested component.
        key: ComponentKey,
        /// Current owner.
        owner: ConfigId,
    },
    /// Component is out of service.
    #[error("component {0} is marked failed")]
    Failed(ComponentKey),
    /// Status change not allowed from the current state.
    #[error("invalid transition for {key}: {reason}")]
    InvalidTransition {
        /// Component concerned.
        key: ComponentKey,
        /// Why the transition was refused.
        reason: String,
    },
}

/// Claim request issued on behalf of a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    /// Component to claim.
    pub key: ComponentKey,
    /// Claiming configuration.
    pub config: ConfigId,
    /// Mode of the claiming configuration.
    pub mode: ConfigMode,
    /// Explicit pre-emption of a foreign owner.
    pub allow_preempt: bool,
}

/// How a claim was satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClaimKind {
    /// Component was available.
    Fresh,
    /// Component was already owned by the same configuration.
    Reclaimed,
    /// Component was taken from another configuration.
    Preempted {
        /// Owner that lost the component.
        previous_owner: ConfigId,
    },
}

/// Successful claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Claimed component.
    pub key: ComponentKey,
    /// Claiming configuration.
    pub config: ConfigId,
    /// Mode of the claiming configuration.
    pub mode: ConfigMode,
    /// How the claim was satisfied.
    pub kind: ClaimKind,
    /// Test-mode claim: the row is never written.
    pub virtual_claim: bool,
    /// Row state once the claim is committed.
    pub row: ComponentRow,
}

impl Claim {
    /// Owner the row is taken from. Virtual claims take nothing.
    pub fn preempted_owner(&self) -> Option<&ConfigId> {
        match &self.kind {
            ClaimKind::Preempted { previous_owner } if !self.virtual_claim => Some(previous_owner),
            _ => None,
        }
    }

    /// Journal body describing this claim.
    pub fn event(&self, override_used: bool) -> ClaimEvent {
        let (event, previous_owner) = match &self.kind {
            ClaimKind::Fresh => (ClaimEventKind::Claimed, None),
            ClaimKind::Reclaimed => (ClaimEventKind::Reclaimed, Some(self.config.clone())),
            ClaimKind::Preempted { previous_owner } => {
                (ClaimEventKind::Preempted, Some(previous_owner.clone()))
            }
        };
        ClaimEvent {
            event,
            component: self.key.clone(),
            config: Some(self.config.clone()),
            mode: Some(self.mode),
            override_used,
            virtual_claim: self.virtual_claim,
            previous_owner,
        }
    }
}

/// Release request issued on behalf of a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRequest {
    /// Component to release.
    pub key: ComponentKey,
    /// Releasing configuration.
    pub config: ConfigId,
    /// Mode of the releasing configuration.
    pub mode: ConfigMode,
}

/// Why a release left the row untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ReleaseSkip {
    /// Test-mode claims are virtual.
    TestMode,
    /// Row now belongs to someone else (pre-empted) or to nobody.
    NotOwner {
        /// Current owner.
        owner: Option<ConfigId>,
    },
}

/// Result of a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// Released component.
    pub key: ComponentKey,
    /// Releasing configuration.
    pub config: ConfigId,
    /// Set when the row was not written.
    pub skipped: Option<ReleaseSkip>,
    /// Row state once the release is committed.
    pub row: ComponentRow,
}

impl Release {
    /// Journal body describing this release.
    pub fn event(&self, mode: ConfigMode) -> ClaimEvent {
        let event = if self.skipped.is_some() {
            ClaimEventKind::ReleaseSkipped
        } else {
            ClaimEventKind::Released
        };
        let previous_owner = match &self.skipped {
            Some(ReleaseSkip::NotOwner { owner }) => owner.clone(),
            Some(ReleaseSkip::TestMode) => None,
            None => Some(self.config.clone()),
        };
        ClaimEvent {
            event,
            component: self.key.clone(),
            config: Some(self.config.clone()),
            mode: Some(mode),
            override_used: false,
            virtual_claim: mode == ConfigMode::Test,
            previous_owner,
        }
    }

    /// Whether the row changes on commit.
    pub fn writes_row(&self) -> bool {
        self.skipped.is_none()
    }
}

type Cell = Arc<Mutex<ComponentRow>>;

/// Component ownership ledger.
#[derive(Debug, Default, Clone)]
pub struct Ledger {
    rows: Arc<RwLock<HashMap<ComponentKey, Cell>>>,
    journal: ClaimJournal,
}

impl Ledger {
    /// Empty ledger with a fresh journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger over an existing journal.
    pub fn with_journal(journal: ClaimJournal) -> Self {
        Self {
            rows: Arc::default(),
            journal,
        }
    }

    /// Claim journal.
    pub fn journal(&self) -> &ClaimJournal {
        &self.journal
    }

    /// Onboard a row. Returns false (and leaves the row alone) if it exists.
    pub fn provision(&self, row: ComponentRow) -> bool {
        let mut rows = self.rows.write();
        if rows.contains_key(&row.key) {
            return false;
        }
        debug!("provisioned component {}", row.key);
        rows.insert(row.key.clone(), Arc::new(Mutex::new(row)));
        true
    }

    /// Replace rows wholesale from persisted state.
    pub fn load_rows(&self, loaded: impl IntoIterator<Item = ComponentRow>) {
        let mut rows = self.rows.write();
        for row in loaded {
            match rows.get(&row.key) {
                Some(cell) => *cell.lock() = row,
                None => {
                    rows.insert(row.key.clone(), Arc::new(Mutex::new(row)));
                }
            }
        }
    }

    /// Snapshot one row.
    pub fn row(&self, key: &ComponentKey) -> Option<ComponentRow> {
        let cell = self.rows.read().get(key).cloned()?;
        let row = cell.lock().clone();
        Some(row)
    }

    /// Snapshot all rows, ordered by key.
    pub fn rows(&self) -> Vec<ComponentRow> {
        let cells: Vec<Cell> = self.rows.read().values().cloned().collect();
        let mut rows: Vec<ComponentRow> = cells.iter().map(|c| c.lock().clone()).collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    /// Available rows of one type, ordered by key.
    pub fn available(&self, kind: ComponentType) -> Vec<ComponentRow> {
        self.rows()
            .into_iter()
            .filter(|r| r.key.kind == kind && r.status == ComponentStatus::Available)
            .collect()
    }

    /// One-shot compare-and-set claim, journaled.
    pub fn try_claim(&self, req: &ClaimRequest) -> Result<Claim, LedgerError> {
        let journal = self.journal.clone();
        let (claim, _) = self.claim_with(req, |claim| {
            journal.append(claim.event(req.allow_preempt));
            Ok::<_, LedgerError>(())
        })?;
        Ok(claim)
    }

    /// Check the row, run `work` while the row stays locked, and write the
    /// row only if `work` succeeds. Test-mode claims never write.
    pub fn claim_with<T, E>(
        &self,
        req: &ClaimRequest,
        work: impl FnOnce(&Claim) -> Result<T, E>,
    ) -> Result<(Claim, T), E>
    where
        E: From<LedgerError>,
    {
        let cell = self.cell(&req.key)?;
        let mut row = cell.lock();
        let claim = decide_claim(&row, req)?;
        let value = work(&claim)?;
        if !claim.virtual_claim {
            *row = claim.row.clone();
        }
        match &claim.kind {
            ClaimKind::Preempted { previous_owner } => warn!(
                "component {} pre-empted from {} by {}",
                claim.key, previous_owner, claim.config
            ),
            kind => info!(
                "component {} claimed by {} ({:?}, virtual={})",
                claim.key, claim.config, kind, claim.virtual_claim
            ),
        }
        Ok((claim, value))
    }

    /// One-shot release, journaled.
    pub fn release(&self, req: &ReleaseRequest) -> Result<Release, LedgerError> {
        let journal = self.journal.clone();
        let (mut releases, _) = self.release_many_with(std::slice::from_ref(req), |releases| {
            journal.append(releases[0].event(req.mode));
            Ok::<_, LedgerError>(())
        })?;
        Ok(releases.remove(0))
    }

    /// Lock every row in key order, compute the releases, run `work`, and
    /// write the rows only if `work` succeeds.
    pub fn release_many_with<T, E>(
        &self,
        reqs: &[ReleaseRequest],
        work: impl FnOnce(&[Release]) -> Result<T, E>,
    ) -> Result<(Vec<Release>, T), E>
    where
        E: From<LedgerError>,
    {
        let mut ordered: Vec<&ReleaseRequest> = reqs.iter().collect();
        ordered.sort_by(|a, b| a.key.cmp(&b.key));
        ordered.dedup_by(|a, b| a.key == b.key);
        let cells = ordered
            .iter()
            .map(|r| self.cell(&r.key))
            .collect::<Result<Vec<_>, _>>()?;
        let mut guards: Vec<_> = cells.iter().map(|c| c.lock()).collect();
        let releases: Vec<Release> = ordered
            .iter()
            .zip(guards.iter())
            .map(|(req, row)| decide_release(row, req))
            .collect();
        let value = work(&releases)?;
        for (guard, release) in guards.iter_mut().zip(releases.iter()) {
            if release.writes_row() {
                **guard = release.row.clone();
                info!("component {} released by {}", release.key, release.config);
            } else {
                debug!(
                    "release of {} by {} skipped: {:?}",
                    release.key, release.config, release.skipped
                );
            }
        }
        Ok((releases, value))
    }

    /// Take a component out of service. Refused while it is in use.
    pub fn mark_failed(&self, key: &ComponentKey) -> Result<ComponentRow, LedgerError> {
        self.mark_failed_with(key, |_, _| Ok::<_, LedgerError>(()))
    }

    /// [`Ledger::mark_failed`], writing the row only if `persist` accepts
    /// the new row and its journal entry.
    pub fn mark_failed_with<E>(
        &self,
        key: &ComponentKey,
        persist: impl FnOnce(&ComponentRow, &[JournalEntry]) -> Result<(), E>,
    ) -> Result<ComponentRow, E>
    where
        E: From<LedgerError>,
    {
        let cell = self.cell(key)?;
        let mut row = cell.lock();
        if let (ComponentStatus::InUse, Some(owner)) = (row.status, row.owner.as_ref()) {
            return Err(LedgerError::Conflict {
                key: key.clone(),
                owner: owner.clone(),
            }
            .into());
        }
        let next = ComponentRow {
            status: ComponentStatus::Failed,
            owner: None,
            ..row.clone()
        };
        let event = ClaimEvent::maintenance(ClaimEventKind::MarkedFailed, key.clone());
        self.journal
            .append_with(vec![event], |entries| persist(&next, entries))?;
        *row = next.clone();
        warn!("component {key} marked failed");
        Ok(next)
    }

    /// Repair workflow: return a failed component to service.
    pub fn restore(&self, key: &ComponentKey) -> Result<ComponentRow, LedgerError> {
        self.restore_with(key, |_, _| Ok::<_, LedgerError>(()))
    }

    /// [`Ledger::restore`], writing the row only if `persist` succeeds.
    pub fn restore_with<E>(
        &self,
        key: &ComponentKey,
        persist: impl FnOnce(&ComponentRow, &[JournalEntry]) -> Result<(), E>,
    ) -> Result<ComponentRow, E>
    where
        E: From<LedgerError>,
    {
        let cell = self.cell(key)?;
        let mut row = cell.lock();
        if row.status != ComponentStatus::Failed {
            return Err(LedgerError::InvalidTransition {
                key: key.clone(),
                reason: format!("status is {:?}, not failed", row.status),
            }
            .into());
        }
        let next = ComponentRow {
            status: ComponentStatus::Available,
            ..row.clone()
        };
        let event = ClaimEvent::maintenance(ClaimEventKind::Restored, key.clone());
        self.journal
            .append_with(vec![event], |entries| persist(&next, entries))?;
        *row = next.clone();
        info!("component {key} restored to service");
        Ok(next)
    }

    fn cell(&self, key: &ComponentKey) -> Result<Cell, LedgerError> {
        self.rows
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(key.clone()))
    }
}

fn decide_claim(row: &ComponentRow, req: &ClaimRequest) -> Result<Claim, LedgerError> {
    let kind = match (row.status, row.owner.as_ref()) {
        (ComponentStatus::Failed, _) => return Err(LedgerError::Failed(req.key.clone())),
        (ComponentStatus::Available, _) => ClaimKind::Fresh,
        (ComponentStatus::InUse, Some(owner)) if *owner == req.config => ClaimKind::Reclaimed,
        (ComponentStatus::InUse, Some(owner)) if req.allow_preempt => ClaimKind::Preempted {
            previous_owner: owner.clone(),
        },
        (ComponentStatus::InUse, Some(owner)) => {
            return Err(LedgerError::Conflict {
                key: req.key.clone(),
                owner: owner.clone(),
            })
        }
        // In use without an owner only happens through hand-edited state.
        (ComponentStatus::InUse, None) => ClaimKind::Fresh,
    };
    let virtual_claim = req.mode == ConfigMode::Test;
    let next = if virtual_claim {
        row.clone()
    } else {
        ComponentRow {
            status: ComponentStatus::InUse,
            owner: Some(req.config.clone()),
            ..row.clone()
        }
    };
    Ok(Claim {
        key: req.key.clone(),
        config: req.config.clone(),
        mode: req.mode,
        kind,
        virtual_claim,
        row: next,
    })
}

fn decide_release(row: &ComponentRow, req: &ReleaseRequest) -> Release {
    let skipped = if req.mode == ConfigMode::Test {
        Some(ReleaseSkip::TestMode)
    } else if row.owner.as_ref() != Some(&req.config) {
        Some(ReleaseSkip::NotOwner {
            owner: row.owner.clone(),
        })
    } else {
        None
    };
    let next = if skipped.is_some() {
        row.clone()
    } else {
        ComponentRow {
            status: ComponentStatus::Available,
            owner: None,
            ..row.clone()
        }
    };
    Release {
        key: req.key.clone(),
        config: req.config.clone(),
        skipped,
        row: next,
    }
}
