use deid::identity::{PseudonymOrigin, Resolution, ScrubCounts};
use serde::Serialize;

/// Counts reported once a run completes. Holds no identifier values.
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub lease: String,
    pub owner: String,
    pub generation: u64,
    pub previous_generation: Option<u64>,
    pub snapshot_records: usize,
    pub resolved: usize,
    pub minted: usize,
    pub reused: usize,
    pub conflicts: usize,
    pub tables: Vec<TableSummary>,
}

impl RunSummary {
    pub fn record_resolutions(&mut self, resolutions: &[Resolution]) {
        self.resolved = resolutions.len();
        self.minted = resolutions
            .iter()
            .filter(|resolution| resolution.origin == PseudonymOrigin::Minted)
            .count();
        self.reused = self.resolved - self.minted;
        self.conflicts = resolutions
            .iter()
            .map(|resolution| resolution.conflicts.len())
            .sum();
    }
}

#[derive(Debug, Default, Serialize)]
pub struct TableSummary {
    pub table: String,
    pub shards: usize,
    pub failed_shards: usize,
    pub scrubbed: usize,
    pub dropped: usize,
    pub passed_through: usize,
}

impl TableSummary {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn add(&mut self, counts: ScrubCounts) {
        self.shards += 1;
        self.scrubbed += counts.scrubbed;
        self.dropped += counts.dropped;
        self.passed_through += counts.passed_through;
    }
}
