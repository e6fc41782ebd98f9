//! Deadlines for scout runs

use serde::{Deserialize, Serialize};
use std::time::Duration;

use flowscout_common::AnalysisParams;

/// `steps × avg_step_secs + buffer_secs`, clamped to `[min_secs, max]`.
///
/// `max` is `extended_max_secs` for adaptive or extended runs and
/// `max_secs` otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    pub avg_step_secs: u64,
    pub buffer_secs: u64,
    pub min_secs: u64,
    pub max_secs: u64,
    pub extended_max_secs: u64,
    /// Absolute cap on a whole multi-device batch
    pub batch_ceiling_secs: u64,
    /// Cap on one test run, flows and scenarios together
    pub test_run_secs: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            avg_step_secs: 20,
            buffer_secs: 300,
            min_secs: 600,
            max_secs: 3600,
            extended_max_secs: 7200,
            batch_ceiling_secs: 14400,
            test_run_secs: 3600,
        }
    }
}

impl TimeoutPolicy {
    /// Deadline for one scout run
    pub fn deadline(&self, params: &AnalysisParams) -> Duration {
        let raw = u64::from(params.max_steps)
            .saturating_mul(self.avg_step_secs)
            .saturating_add(self.buffer_secs);
        let max = if params.adaptive || params.extended {
            self.extended_max_secs
        } else {
            self.max_secs
        };
        Duration::from_secs(raw.clamp(self.min_secs, max.max(self.min_secs)))
    }

    /// Shared deadline for every device of a batch
    pub fn batch_deadline(&self, params: &AnalysisParams) -> Duration {
        let devices = params.devices.len().max(1) as u32;
        let total = self.deadline(params).saturating_mul(devices);
        total.min(Duration::from_secs(self.batch_ceiling_secs))
    }

    pub fn test_run_deadline(&self) -> Duration {
        Duration::from_secs(self.test_run_secs.max(1))
    }
}
