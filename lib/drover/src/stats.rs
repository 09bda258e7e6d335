use serde::Serialize;

/// End-of-run accounting on the master rank.
#[derive(Default, Clone, Debug, Serialize)]
pub struct BatchSummary {
    pub keys_scheduled: u64,
    pub keys_dispatched: u64,
    pub results_received: u64,
    pub results_failed: u64,
    pub exits_sent: usize,
    pub workers: usize,
    pub wall_ms: u64,
}

/// What one worker rank did before receiving its exit signal.
#[derive(Default, Clone, Debug, Serialize)]
pub struct WorkerSummary {
    pub rank: usize,
    pub processed: u64,
    pub failed: u64,
    pub wall_ms: u64,
}
