use crate::constants::{DEFAULT_MASTER_ADDR, ENV_JOB_ID, ENV_MASTER_ADDR, ENV_RANK, ENV_WORLD_SIZE};
use anyhow::{Context, Result};
use std::env;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of this process within the rank group, discovered from the
/// environment. `DROVER_*` variables take precedence; Slurm variables are
/// honored so `srun` launches work unchanged.
#[derive(Debug, Clone)]
pub struct ClusterEnv {
    pub job_id: String,
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
}

impl ClusterEnv {
    pub fn detect() -> Result<Self> {
        let rank = env::var(ENV_RANK)
            .ok()
            .or_else(|| env::var("SLURM_PROCID").ok())
            .and_then(|v| v.parse::<usize>().ok())
            .with_context(|| format!("{ENV_RANK} or SLURM_PROCID not set"))?;
        let world_size = env::var(ENV_WORLD_SIZE)
            .ok()
            .or_else(|| env::var("SLURM_NTASKS").ok())
            .or_else(|| {
                env::var("SLURM_TASKS_PER_NODE")
                    .ok()
                    .and_then(|s| s.split(',').next().map(str::to_string))
            })
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(1);
        let job_id = env::var(ENV_JOB_ID)
            .ok()
            .or_else(|| env::var("SLURM_JOB_ID").ok())
            .unwrap_or_else(local_job_id);
        let master_addr = env::var(ENV_MASTER_ADDR).unwrap_or_else(|_| DEFAULT_MASTER_ADDR.to_string());
        Ok(Self { job_id, rank, world_size, master_addr })
    }

    /// Like `detect`, falling back to a standalone single-rank identity.
    pub fn detect_or_local() -> Self {
        Self::detect().unwrap_or_else(|_| Self {
            job_id: local_job_id(),
            rank: 0,
            world_size: 1,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
        })
    }

    pub fn is_master(&self) -> bool {
        self.rank == 0
    }
}

fn local_job_id() -> String {
    let pid = std::process::id();
    let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    format!("local-{}-{}", pid, ts)
}
