//! Distributed per-file statistics: rank 0 schedules every file under
//! `--input` whose name matches `--pattern`, worker ranks read each file and
//! report `path\tlines\twords\tbytes`, and the master appends the lines to
//! `--output`.
//!
//! Launch one process per rank, e.g.:
//!
//!   DROVER_RANK=0 DROVER_WORLD_SIZE=3 filestats --input data --output stats.tsv &
//!   DROVER_RANK=1 DROVER_WORLD_SIZE=3 filestats --input data --output stats.tsv &
//!   DROVER_RANK=2 DROVER_WORLD_SIZE=3 filestats --input data --output stats.tsv
//!
//! or under Slurm: `srun -n 3 filestats ...`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use drover::{BatchProcessor, ClusterEnv, FileSink, KeyScheduler, TcpChannel, ThreadPool};
use regex::Regex;
use std::fs;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    /// Directory to scan for input files
    #[arg(long)]
    input: String,
    /// File-name regular expression
    #[arg(long, default_value = ".*")]
    pattern: String,
    /// Output file (written by rank 0)
    #[arg(long)]
    output: String,
    /// Local pool threads (defaults to DROVER_POOL_THREADS or the CPU count)
    #[arg(long)]
    threads: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let args = Args::parse();

    let env = ClusterEnv::detect_or_local();
    if env.world_size < 2 {
        bail!(
            "filestats needs at least two ranks; launch under Slurm or set DROVER_RANK/DROVER_WORLD_SIZE"
        );
    }
    info!(job_id = %env.job_id, rank = env.rank, world_size = env.world_size, "starting");
    if env.is_master() {
        info!(output = %args.output, "collecting results on this rank");
    }

    let channel = Arc::new(TcpChannel::from_env(&env).context("initializing rank transport")?);
    let pool = match args.threads {
        Some(threads) => Arc::new(ThreadPool::new(threads)),
        None => Arc::new(ThreadPool::from_env()),
    };
    let processor = BatchProcessor::new(channel, pool);

    let input = args.input.clone();
    let pattern = Regex::new(&args.pattern).context("compiling --pattern")?;
    let output = args.output.clone();

    processor.process_keys(
        move |scheduler: &KeyScheduler| schedule_files(&input, &pattern, scheduler),
        &file_stats,
        move || FileSink::create(&output),
    )?;
    processor.wait();
    Ok(())
}

fn schedule_files(directory: &str, pattern: &Regex, scheduler: &KeyScheduler) -> Result<()> {
    let mut scheduled = 0usize;
    for entry in walkdir::WalkDir::new(directory) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if pattern.is_match(&name) {
            scheduler.schedule_key(entry.path().display().to_string());
            scheduled += 1;
        }
    }
    info!(directory, scheduled, "input files scheduled");
    Ok(())
}

fn file_stats(key: &str) -> Result<String> {
    let contents = fs::read_to_string(key).with_context(|| format!("reading {key}"))?;
    let lines = contents.lines().count();
    let words = contents.split_whitespace().count();
    let bytes = contents.len();
    Ok(format!("{key}\t{lines}\t{words}\t{bytes}"))
}
