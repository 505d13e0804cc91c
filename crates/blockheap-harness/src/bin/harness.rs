//! CLI entrypoint for the blockheap workload harness.

use std::path::PathBuf;

use blockheap_core::malloc::{Heap, MallocConfig, SimulatedMapper};
use blockheap_harness::structured_log::LogEmitter;
use blockheap_harness::workload::{self, StressConfig};
use clap::{Parser, Subcommand};

/// Workload tooling for blockheap.
#[derive(Debug, Parser)]
#[command(name = "blockheap-harness")]
#[command(about = "Stress and trace-replay harness for blockheap")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run seeded multi-threaded allocation traffic against one heap.
    Stress {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Operations per thread.
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0x5EED")]
        seed: String,
        /// Upper bound for ordinary request sizes.
        #[arg(long, default_value_t = 4096)]
        max_size: usize,
        /// Write lifecycle records as JSONL to this path.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Replay a JSON op trace and print the final stats.
    Replay {
        /// Trace path (`[{"op":"malloc","id":1,"size":64}, ...]`).
        #[arg(long)]
        trace: PathBuf,
        /// Write lifecycle records as JSONL to this path.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Print the effective configuration and an empty heap's counters.
    Stats,
}

fn parse_seed(raw: &str) -> Result<u64, String> {
    let cleaned = raw.replace('_', "");
    let parsed = match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|err| format!("invalid seed `{raw}`: {err}"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Stress {
            threads,
            ops,
            seed,
            max_size,
            log,
        } => {
            let config = StressConfig {
                threads,
                ops_per_thread: ops,
                seed: parse_seed(&seed)?,
                max_size: max_size.max(1),
                log: log.is_some(),
            };
            eprintln!(
                "Stress: {} threads x {} ops, seed {:#x}",
                config.threads, config.ops_per_thread, config.seed
            );
            let mut emitter = log.as_deref().map(LogEmitter::to_file).transpose()?;
            let report = workload::run_stress(&config, emitter.as_mut())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Replay { trace, log } => {
            let ops = workload::load_trace(&trace)?;
            eprintln!("Replaying {} ops from {}", ops.len(), trace.display());
            let config = MallocConfig::default().with_log(log.is_some());
            let mut emitter = log.as_deref().map(LogEmitter::to_file).transpose()?;
            let report = workload::replay(&ops, config, emitter.as_mut())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stats => {
            let config = MallocConfig::from_env();
            println!("{}", serde_json::to_string_pretty(&config)?);
            let heap = Heap::new(config, SimulatedMapper::new());
            print!("{}", heap.dump_stats());
        }
    }

    Ok(())
}
