//! Dispatcher configuration
//!
//! Loaded from TOML; every field has a default so an empty document is a
//! valid configuration.
//!
//! ```toml
//! skip_guard_eval_unsafe = false
//! chain_order = "most-recent-first"   # or "insertion-order"
//! promote_on_hit = true
//! ```

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::dispatch::ChainOrder;

/// Dispatcher settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Assert that warm-up is over: lookups evaluate diff guards and a cache
    /// miss is an error instead of a compile
    pub skip_guard_eval_unsafe: bool,

    /// Where newly compiled entries go in a unit's chain
    pub chain_order: ChainOrder,

    /// Move a hit entry to the front of its chain
    pub promote_on_hit: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            skip_guard_eval_unsafe: false,
            chain_order: ChainOrder::MostRecentFirst,
            promote_on_hit: true,
        }
    }
}

impl DispatchConfig {
    /// Parse a configuration document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }
}

/// Configuration loading errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// File could not be read
    Io(String),
    /// Document is not valid configuration
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "Failed to read config: {}", msg),
            Self::Parse(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = DispatchConfig::from_toml_str("").unwrap();
        assert_eq!(config, DispatchConfig::default());
        assert!(config.promote_on_hit);
        assert_eq!(config.chain_order, ChainOrder::MostRecentFirst);
    }

    #[test]
    fn test_parse_all_fields() {
        let config = DispatchConfig::from_toml_str(
            r#"
            skip_guard_eval_unsafe = true
            chain_order = "insertion-order"
            promote_on_hit = false
            "#,
        )
        .unwrap();
        assert!(config.skip_guard_eval_unsafe);
        assert_eq!(config.chain_order, ChainOrder::InsertionOrder);
        assert!(!config.promote_on_hit);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = DispatchConfig::from_toml_str("cache_size = 8").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = DispatchConfig::load("/nonexistent/evalhook.toml").unwrap_err();
        assert!(err.to_string().starts_with("Failed to read config"));
    }
}
