//! Centralized environment variable names and default values for Drover runtime tuning.

// Environment variable names
pub const ENV_RANK: &str = "DROVER_RANK";
pub const ENV_WORLD_SIZE: &str = "DROVER_WORLD_SIZE";
pub const ENV_JOB_ID: &str = "DROVER_JOB_ID";
pub const ENV_MASTER_ADDR: &str = "DROVER_MASTER_ADDR";
pub const ENV_POOL_THREADS: &str = "DROVER_POOL_THREADS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "DROVER_CONNECT_TIMEOUT_MS";

// Defaults
pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1:7070";
/// How long a worker keeps retrying its initial connection while the master comes up.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
/// Delay between connection attempts.
pub const DEFAULT_CONNECT_RETRY_MS: u64 = 200;
/// Poll interval for the result-collection loop to re-check its exit condition.
pub const DEFAULT_RESULT_TICK_MS: u64 = 100;
