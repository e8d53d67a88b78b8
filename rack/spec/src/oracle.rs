//! Specification oracle seam.

use std::sync::Arc;

use thiserror::Error;

use crate::{ComponentKey, ComponentSpec};

/// Lookup failure. Absence of data is `Ok(None)`, not an error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OracleError {
    /// Backing source could not be queried.
    #[error("specification source unavailable: {0}")]
    Unavailable(String),
    /// Entry exists but does not describe the requested type.
    #[error("malformed specification for {key}: {reason}")]
    Malformed {
        /// Component that was looked up.
        key: ComponentKey,
        /// What was wrong with the entry.
        reason: String,
    },
}

/// Read-only source of per-component technical attributes.
pub trait SpecificationOracle: Send + Sync {
    /// Fetch the structured record for a component.
    fn lookup(&self, key: &ComponentKey) -> Result<Option<ComponentSpec>, OracleError>;
}

impl<T: SpecificationOracle + ?Sized> SpecificationOracle for Arc<T> {
    fn lookup(&self, key: &ComponentKey) -> Result<Option<ComponentSpec>, OracleError> {
        (**self).lookup(key)
    }
}
