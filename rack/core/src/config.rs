//! Engine configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rack_spec::ComponentType;

/// Configuration load failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// File could not be read.
    #[error("config io error: {0}")]
    Io(String),
    /// File is not valid JSON for this schema.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Values out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Assembly policy knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Types that must be present to finalize.
    pub required_types: Vec<ComponentType>,
    /// Highest pair score a text-inferred part can reach.
    pub inferred_score_cap: u8,
    /// Whether callers may pre-empt components owned by other configurations.
    pub allow_override: bool,
    /// Most units a single add may request.
    pub max_quantity: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            required_types: vec![
                ComponentType::Cpu,
                ComponentType::Motherboard,
                ComponentType::Ram,
            ],
            inferred_score_cap: 85,
            allow_override: true,
            max_quantity: 64,
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("read {}: {e}", path.display())))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inferred_score_cap > 100 {
            return Err(ConfigError::Invalid(format!(
                "inferred_score_cap must be at most 100, got {}",
                self.inferred_score_cap
            )));
        }
        if self.max_quantity == 0 {
            return Err(ConfigError::Invalid("max_quantity must be at least 1".into()));
        }
        let mut seen = Vec::new();
        for kind in &self.required_types {
            if seen.contains(kind) {
                return Err(ConfigError::Invalid(format!("{kind} listed twice in required_types")));
            }
            seen.push(*kind);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_require_core_parts() {
        let config = EngineConfig::default();
        assert_eq!(config.required_types.len(), 3);
        assert_eq!(config.inferred_score_cap, 85);
        assert!(config.allow_override);
        assert_eq!(config.max_quantity, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), r#"{"allow_override": false}"#).unwrap();
        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert!(!config.allow_override);
        assert_eq!(config.inferred_score_cap, 85);
    }

    #[test]
    fn out_of_range_cap_is_rejected() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), r#"{"inferred_score_cap": 120}"#).unwrap();
        assert!(matches!(
            EngineConfig::from_json_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
        fs::write(file.path(), r#"{"max_quantity": 0}"#).unwrap();
        assert!(matches!(
            EngineConfig::from_json_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
        fs::write(file.path(), r#"{"required_types": ["cpu", "cpu"]}"#).unwrap();
        assert!(matches!(
            EngineConfig::from_json_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
