//! Startup configuration of the hypervisor engine
//!
//! The configuration is a JSON document. Every field has a default, so an empty object `{}`
//! is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HvConfig {
    /// Number of logical cores to virtualize
    pub cores: u32,
    /// Whether triggered events are evaluated at all
    pub events_enabled: bool,
    /// Whether a kernel debugger is connected and wants breakpoints and debug exceptions
    pub kernel_debugger: bool,
    pub transparent_mode: bool,
    pub unsafe_syscall_handling: bool,
    pub suppress_interrupts_while_stepping: bool,
}

impl Default for HvConfig {
    fn default() -> Self {
        Self {
            cores: 4,
            events_enabled: true,
            kernel_debugger: false,
            transparent_mode: false,
            unsafe_syscall_handling: false,
            suppress_interrupts_while_stepping: true,
        }
    }
}

impl HvConfig {
    /// Read a configuration from a JSON file
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is not a valid configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&raw)?;
        debug!("loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = HvConfig::from_json(r#"{ "cores": 2, "transparent_mode": true }"#).unwrap();
        assert_eq!(config.cores, 2);
        assert!(config.transparent_mode);
        assert!(config.events_enabled);
        assert!(config.suppress_interrupts_while_stepping);
    }

    #[test]
    fn test_bad_config_is_an_error() {
        assert!(HvConfig::from_json(r#"{ "cores": "many" }"#).is_err());
    }
}
