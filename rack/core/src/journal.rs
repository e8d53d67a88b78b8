//! Append-only claim journal with BLAKE3 hash chaining.
//!
//! Every ledger transition (claim, re-claim, pre-emption, release, repair)
//! lands here, so an override is always distinguishable after the fact and a
//! replay detects tampering or reordering.

use std::sync::Arc;

use blake3::Hasher;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rack_spec::{ComponentKey, ConfigId, ConfigMode, Timestamp};

use crate::now_millis;

const DOMAIN: &[u8] = b"rack-ledger:journal";

/// Kind of ledger transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimEventKind {
    /// Available component claimed.
    Claimed,
    /// Already self-owned component claimed again.
    Reclaimed,
    /// Component taken from another configuration by override.
    Preempted,
    /// Component returned to the pool.
    Released,
    /// Release left the row untouched (test mode or pre-empted owner).
    ReleaseSkipped,
    /// Component taken out of service.
    MarkedFailed,
    /// Repair workflow returned the component to service.
    Restored,
}

impl ClaimEventKind {
    fn tag(self) -> u8 {
        match self {
            Self::Claimed => 1,
            Self::Reclaimed => 2,
            Self::Preempted => 3,
            Self::Released => 4,
            Self::ReleaseSkipped => 5,
            Self::MarkedFailed => 6,
            Self::Restored => 7,
        }
    }
}

/// Body of a journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimEvent {
    /// Transition kind.
    pub event: ClaimEventKind,
    /// Component concerned.
    pub component: ComponentKey,
    /// Configuration that drove the transition, if any.
    pub config: Option<ConfigId>,
    /// Mode of that configuration.
    pub mode: Option<ConfigMode>,
    /// Whether an explicit override flag was set.
    pub override_used: bool,
    /// Row was not written (test-mode claim).
    #[serde(default)]
    pub virtual_claim: bool,
    /// Owner before the transition.
    pub previous_owner: Option<ConfigId>,
}

impl ClaimEvent {
    /// Event without a driving configuration (repair workflow).
    pub fn maintenance(event: ClaimEventKind, component: ComponentKey) -> Self {
        Self {
            event,
            component,
            config: None,
            mode: None,
            override_used: false,
            virtual_claim: false,
            previous_owner: None,
        }
    }
}

/// Chained journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Zero-based position.
    pub seq: u64,
    /// Wall-clock time of the append.
    pub timestamp: Timestamp,
    /// Entry body.
    #[serde(flatten)]
    pub body: ClaimEvent,
    /// Hash of the previous entry.
    pub prev: Option<[u8; 32]>,
    /// Hash over this entry.
    pub hash: [u8; 32],
}

/// Replay failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JournalError {
    /// Sequence number does not match position.
    #[error("sequence gap at index {0}")]
    SequenceGap(usize),
    /// `prev` does not point at the preceding entry.
    #[error("broken chain at index {0}")]
    BrokenChain(usize),
    /// Entry hash does not match its contents.
    #[error("hash mismatch at index {0}")]
    HashMismatch(usize),
}

/// Shared, append-only claim journal.
#[derive(Debug, Default, Clone)]
pub struct ClaimJournal {
    entries: Arc<RwLock<Vec<JournalEntry>>>,
}

impl ClaimJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load previously persisted entries after replaying the chain.
    pub fn from_entries(entries: Vec<JournalEntry>) -> Result<Self, JournalError> {
        verify_entries(&entries)?;
        Ok(Self {
            entries: Arc::new(RwLock::new(entries)),
        })
    }

    /// Append a single event.
    pub fn append(&self, event: ClaimEvent) -> JournalEntry {
        let appended: Result<_, std::convert::Infallible> =
            self.append_with(vec![event], |_| Ok(()));
        match appended {
            Ok(mut entries) => entries.remove(0),
            Err(never) => match never {},
        }
    }

    /// Chain `events`, hand them to `persist`, and publish them only if
    /// `persist` succeeds. The journal stays locked for the duration so
    /// concurrent writers never fork the chain.
    pub fn append_with<E>(
        &self,
        events: Vec<ClaimEvent>,
        persist: impl FnOnce(&[JournalEntry]) -> Result<(), E>,
    ) -> Result<Vec<JournalEntry>, E> {
        let mut entries = self.entries.write();
        let mut prev = entries.last().map(|e| e.hash);
        let mut seq = entries.len() as u64;
        let timestamp = now_millis();
        let chained: Vec<JournalEntry> = events
            .into_iter()
            .map(|body| {
                let hash = entry_hash(seq, timestamp, &body, prev.as_ref());
                let entry = JournalEntry {
                    seq,
                    timestamp,
                    body,
                    prev,
                    hash,
                };
                prev = Some(hash);
                seq += 1;
                entry
            })
            .collect();
        persist(&chained)?;
        entries.extend(chained.iter().cloned());
        Ok(chained)
    }

    /// Read a slice of entries.
    pub fn read(&self, offset: usize, limit: usize) -> Vec<JournalEntry> {
        let entries = self.entries.read();
        entries.iter().skip(offset).take(limit).cloned().collect()
    }

    /// History of one component, oldest first.
    pub fn entries_for(&self, component: &ComponentKey) -> Vec<JournalEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| &e.body.component == component)
            .cloned()
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the journal is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Replay the whole chain.
    pub fn verify(&self) -> Result<(), JournalError> {
        verify_entries(&self.entries.read())
    }
}

/// Replay a sequence from an empty journal, reporting the first defect.
pub fn verify_entries(entries: &[JournalEntry]) -> Result<(), JournalError> {
    let mut prev: Option<[u8; 32]> = None;
    for (idx, entry) in entries.iter().enumerate() {
        if entry.seq != idx as u64 {
            return Err(JournalError::SequenceGap(idx));
        }
        if entry.prev != prev {
            return Err(JournalError::BrokenChain(idx));
        }
        let computed = entry_hash(entry.seq, entry.timestamp, &entry.body, entry.prev.as_ref());
        if computed != entry.hash {
            return Err(JournalError::HashMismatch(idx));
        }
        prev = Some(entry.hash);
    }
    Ok(())
}

fn entry_hash(
    seq: u64,
    timestamp: Timestamp,
    body: &ClaimEvent,
    prev: Option<&[u8; 32]>,
) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN);
    hasher.update(&seq.to_le_bytes());
    hasher.update(&timestamp.to_le_bytes());
    hasher.update(&[body.event.tag()]);
    update_str(&mut hasher, body.component.kind.as_str());
    update_str(&mut hasher, body.component.id.as_str());
    update_opt_str(&mut hasher, body.config.as_ref().map(|c| c.as_str()));
    let mode = match body.mode {
        None => 0u8,
        Some(ConfigMode::Real) => 1,
        Some(ConfigMode::Test) => 2,
    };
    hasher.update(&[mode, body.override_used as u8, body.virtual_claim as u8]);
    update_opt_str(&mut hasher, body.previous_owner.as_ref().map(|c| c.as_str()));
    match prev {
        Some(p) => {
            hasher.update(&[1]);
            hasher.update(p);
        }
        None => {
            hasher.update(&[0]);
        }
    }
    *hasher.finalize().as_bytes()
}

fn update_str(hasher: &mut Hasher, value: &str) {
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

fn update_opt_str(hasher: &mut Hasher, value: Option<&str>) {
    match value {
        Some(v) => {
            hasher.update(&[1]);
            update_str(hasher, v);
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rack_spec::ComponentType;

    fn claimed(id: &str, config: &str) -> ClaimEvent {
        ClaimEvent {
            event: ClaimEventKind::Claimed,
            component: ComponentKey::new(ComponentType::Cpu, id),
            config: Some(config.into()),
            mode: Some(ConfigMode::Real),
            override_used: false,
            virtual_claim: false,
            previous_owner: None,
        }
    }

    #[test]
    fn append_chains_entries() {
        let journal = ClaimJournal::new();
        let first = journal.append(claimed("cpu-1", "cfg-a"));
        let second = journal.append(claimed("cpu-2", "cfg-a"));
        assert_eq!(first.seq, 0);
        assert_eq!(first.prev, None);
        assert_eq!(second.prev, Some(first.hash));
        assert_eq!(journal.read(1, 1), vec![second]);
        assert!(journal.verify().is_ok());
    }

    #[test]
    fn failed_persist_publishes_nothing() {
        let journal = ClaimJournal::new();
        let result: Result<_, &str> =
            journal.append_with(vec![claimed("cpu-1", "cfg-a")], |_| Err("disk full"));
        assert_eq!(result.unwrap_err(), "disk full");
        assert!(journal.is_empty());
    }

    #[test]
    fn replay_detects_tamper() {
        let journal = ClaimJournal::new();
        journal.append(claimed("cpu-1", "cfg-a"));
        journal.append(claimed("cpu-2", "cfg-a"));
        let mut entries = journal.read(0, 10);
        entries[1].body.override_used = true;
        assert_eq!(verify_entries(&entries), Err(JournalError::HashMismatch(1)));

        let mut reordered = journal.read(0, 10);
        reordered.swap(0, 1);
        assert_eq!(verify_entries(&reordered), Err(JournalError::SequenceGap(0)));
    }

    #[test]
    fn entries_filter_by_component() {
        let journal = ClaimJournal::new();
        journal.append(claimed("cpu-1", "cfg-a"));
        journal.append(claimed("cpu-2", "cfg-b"));
        journal.append(ClaimEvent::maintenance(
            ClaimEventKind::MarkedFailed,
            ComponentKey::new(ComponentType::Cpu, "cpu-1"),
        ));
        let history = journal.entries_for(&ComponentKey::new(ComponentType::Cpu, "cpu-1"));
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].body.event, ClaimEventKind::MarkedFailed);
    }
}
