use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use grade_core::validate_trace;
use grade_runner::{CacheSimSuite, CacheTraceSuite, MallocTraceSuite};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "grade", version = "0.1.0", about = "Systems lab grading pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade the cache simulator and the transpose kernel
    CacheSim {
        /// Emit autoresult string for the grading platform
        #[arg(short = 'A', long)]
        autograde: bool,
    },
    /// Grade student-written cache trace files
    CacheTraces {
        /// Emit autoresult string for the grading platform
        #[arg(short = 'A', long, conflicts_with = "validate")]
        autograde: bool,
        /// Verify a specific trace is well written
        #[arg(short = 'f', long, value_name = "TRACE")]
        validate: Option<PathBuf>,
    },
    /// Grade allocator coalescing traces
    MallocTraces {
        /// Emit autoresult string for the grading platform
        #[arg(short = 'A', long, conflicts_with = "trace")]
        autograde: bool,
        /// Specify a trace to run in the range [1,3]
        #[arg(short = 't', long, value_name = "N")]
        trace: Option<usize>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    if let Some(payload) = run_command(cli.command)? {
        emit_json(&payload);
    }
    Ok(())
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::CacheSim { autograde } => {
            let suite = CacheSimSuite::standard();
            let report = grade_runner::run_cache_sim(&suite);
            print!("{}", grade_runner::render_cache_sim_summary(&report));
            Ok(autograde.then(|| report.autoresult()))
        }
        Commands::CacheTraces { autograde, validate } => {
            if let Some(path) = validate {
                validate_one(&path)?;
                return Ok(None);
            }
            let suite = CacheTraceSuite::standard();
            let report = grade_runner::run_cache_traces(&suite);
            print!("{}", grade_runner::render_cache_traces_summary(&suite, &report));
            Ok(autograde.then(|| report.autoresult()))
        }
        Commands::MallocTraces { autograde, trace } => {
            let suite = MallocTraceSuite::standard();
            if let Some(number) = trace {
                if !(1..=suite.benchmarks.len()).contains(&number) {
                    bail!(
                        "trace number must be in the range [1,{}]",
                        suite.benchmarks.len()
                    );
                }
                let result = grade_runner::run_single_malloc_trace(&suite, number);
                print!(
                    "{}",
                    grade_runner::render_single_malloc_trace(&suite, number, &result)
                );
                return Ok(None);
            }
            let report = grade_runner::run_malloc_traces(&suite);
            print!("{}", grade_runner::render_malloc_traces_summary(&suite, &report));
            Ok(autograde.then(|| report.autoresult()))
        }
    }
}

fn validate_one(path: &Path) -> Result<()> {
    if path.extension().and_then(|e| e.to_str()) != Some("trace") {
        bail!("please specify a .trace file");
    }
    match validate_trace(path, None) {
        Ok(()) => println!("{} is a well written trace", path.display()),
        Err(err) => println!("{err}"),
    }
    Ok(())
}

fn emit_json(payload: &Value) {
    println!("{payload}");
}
