//! Rack core: component claim ledger, compatibility evaluator, slot
//! allocator, and the configuration assembler that ties them together in
//! one atomic unit of work per mutation.
#![deny(missing_docs)]

use std::time::{SystemTime, UNIX_EPOCH};

use rack_spec::Timestamp;

pub mod assembler;
pub mod catalog;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod journal;
pub mod ledger;
pub mod model;
pub mod resolve;
pub mod rules;
pub mod slots;
pub mod store;

pub use assembler::{
    AddOutcome, AddRequest, Assembler, CandidateReport, FinalizeReceipt, PoolReport,
    RemoveOutcome, ValidationReport,
};
pub use catalog::{Catalog, CatalogEntry, CatalogError, CatalogOracle};
pub use config::{ConfigError, EngineConfig};
pub use error::{AssemblyError, ErrorKind, ErrorReport};
pub use evaluator::{evaluate, evaluate_set, Finding, FindingCategory, Part, Severity, Verdict};
pub use journal::{ClaimEvent, ClaimEventKind, ClaimJournal, JournalEntry, JournalError};
pub use ledger::{
    Claim, ClaimKind, ClaimRequest, ComponentRow, Ledger, LedgerError, Release, ReleaseRequest,
    ReleaseSkip,
};
pub use model::{ComponentAssociation, ConfigurationRecord};
pub use resolve::{infer_from_text, resolve, ResolvedSpec};
pub use rules::{RuleKind, RuleSet};
pub use slots::{ClassUsage, Slot, SlotClass, SlotError, SlotPool};
pub use store::{
    ConfigurationChange, JsonFileStore, MemoryStore, Snapshot, Store, StoreError, UnitOfWork,
};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}
