// Chain Manager Configuration
//
// Loaded from JSON by the CLI; the library falls back to the built-in
// defaults.

use serde::{Deserialize, Serialize};

/// When the manager re-audits a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    #[default]
    Never,
    /// Evaluate every chain invariant after each mutating operation.
    AfterWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub verify: VerifyMode,
    /// Unlink a record before the store deletes it.
    pub detach_on_destroy: bool,
}

impl ChainConfig {
    /// Built-in configuration (used if none is provided).
    pub fn default_config() -> Self {
        Self {
            verify: VerifyMode::Never,
            detach_on_destroy: true,
        }
    }

    /// Defaults plus post-write verification.
    pub fn verified() -> Self {
        Self {
            verify: VerifyMode::AfterWrite,
            ..Self::default_config()
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::default_config()
    }
}
