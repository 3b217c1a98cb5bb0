//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Keep cleanup-misuse diagnostics in memory in addition to logging them.
    #[serde(default = "default_record_diagnostics")]
    pub record_diagnostics: bool,
}

fn default_record_diagnostics() -> bool {
    false
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            record_diagnostics: default_record_diagnostics(),
        }
    }
}

impl EngineConfig {
    pub fn with_recorded_diagnostics(mut self) -> Self {
        self.record_diagnostics = true;
        self
    }
}
