use serde::Serialize;

use cloudpool_core::{Machine, MachineId, ScheduledTermination};

/// What a single reconciliation pass observed and did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub desired_size: u32,
    /// Allocated machines not queued for, or already given, termination
    /// when the pass compared sizes.
    pub effective_size: u32,
    pub launched: Vec<Machine>,
    pub scheduled: Vec<ScheduledTermination>,
    pub terminated: Vec<MachineId>,
    pub failures: Vec<String>,
}

impl PassReport {
    pub(crate) fn new(desired_size: u32) -> Self {
        Self {
            desired_size,
            ..Self::default()
        }
    }

    /// Nothing was launched, scheduled or terminated, and nothing failed.
    pub fn is_noop(&self) -> bool {
        self.launched.is_empty()
            && self.scheduled.is_empty()
            && self.terminated.is_empty()
            && self.failures.is_empty()
    }
}
