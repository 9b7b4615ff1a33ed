use serde::{Deserialize, Serialize};

use crate::core::errors::{BatchError, Result};

/// Configuration for batch discovery behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Consecutive quiet scheduler ticks required before the registered
    /// task set is frozen as a batch. Growth resets the counter.
    #[serde(default = "default_stable_ticks")]
    pub stable_ticks: usize,
    /// Upper bound on collection ticks for registration streams that never
    /// converge. `None` collects indefinitely.
    #[serde(default)]
    pub max_collect_ticks: Option<u64>,
}

fn default_stable_ticks() -> usize {
    3
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stable_ticks: default_stable_ticks(),
            max_collect_ticks: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stable_ticks == 0 {
            return Err(BatchError::configuration("stable_ticks cannot be zero"));
        }
        if self.max_collect_ticks == Some(0) {
            return Err(BatchError::configuration(
                "max_collect_ticks cannot be zero",
            ));
        }
        Ok(())
    }
}
