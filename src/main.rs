// src/main.rs
//
// =============================================================================
// GRAVITATION: COMMAND LINE ENTRY POINT
// =============================================================================
//
// A thin dispatcher over the core library.
//
// Modes:
// 1. WORKER:    run one (kernel, variation, length) benchmark point.
// 2. BENCHMARK: sweep lengths per kernel via worker subprocesses.
// 3. VERIFY:    compare archived snapshots against a reference kernel.
// 4. INGEST:    turn a raw benchmark log into a session document.
// 5. KERNELS:   list registered kernels and their variations.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use gravitation::benchmark::{self, BenchmarkConfig, Display};
use gravitation::platform::Platform;
use gravitation::records::SessionLog;
use gravitation::registry::Registry;
use gravitation::variation::Variation;
use gravitation::verification::Verification;
use gravitation::worker::{Worker, WorkerConfig};

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(
    name = "gravitation",
    version,
    about = "n-body simulation performance test suite"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Isolated single-kernel benchmark worker.
    Worker {
        /// Number of point masses.
        #[arg(long = "len", default_value_t = 2000)]
        len: u64,

        /// Name of the data file.
        #[arg(long, short, default_value = "data.db")]
        datafile: PathBuf,

        /// Save the universe into the file after iteration N (repeatable).
        #[arg(long = "save_after_iteration", short)]
        save_after_iteration: Vec<u64>,

        /// Read the initial state from the data file.
        #[arg(long = "read_initial_state", short)]
        read_initial_state: bool,

        /// Minimum number of simulation steps; the largest checkpoint
        /// iteration takes precedence if bigger.
        #[arg(long = "min_iterations", short = 'i', default_value_t = 10)]
        min_iterations: u64,

        /// Minimal total runtime of all steps, in seconds.
        #[arg(long = "min_total_runtime", short = 't', default_value_t = 10)]
        min_total_runtime: u64,

        /// Kernel name.
        kernel: String,

        /// Variation options as `--field value` pairs (e.g. `--dtype float64`).
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        variation: Vec<String>,
    },

    /// Run a benchmark across kernels.
    Benchmark {
        /// Name of the log file.
        #[arg(long, short, default_value = "benchmark.log")]
        logfile: PathBuf,

        /// Name of the data file.
        #[arg(long, short, default_value = "data.db")]
        datafile: PathBuf,

        /// Use a common initial state per length for all kernels.
        #[arg(long = "common_initial_state", short)]
        common_initial_state: bool,

        /// Run all registered kernels.
        #[arg(long = "all_kernels", short)]
        all_kernels: bool,

        /// 2^x bodies in simulation, for x from lower to upper boundary.
        #[arg(long = "len_range", short = 'b', num_args = 2, default_values_t = [2, 16])]
        len_range: Vec<u32>,

        /// Save the universe into the file after iteration N (repeatable).
        #[arg(long = "save_after_iteration", short)]
        save_after_iteration: Vec<u64>,

        /// Minimum number of simulation steps per worker.
        #[arg(long = "min_iterations", short = 'i', default_value_t = 10)]
        min_iterations: u64,

        /// Minimal total runtime of all steps per worker, in seconds.
        #[arg(long = "min_total_runtime", short = 't', default_value_t = 10)]
        min_total_runtime: u64,

        /// What to show during the benchmark.
        #[arg(long, default_value = "plot", value_parser = ["plot", "log", "none"])]
        display: String,

        /// Kernels to benchmark.
        kernel: Vec<String>,
    },

    /// Verify archived snapshots against a reference kernel.
    Verify {
        /// Name of the data file.
        #[arg(long, short, default_value = "data.db")]
        datafile: PathBuf,

        /// Iteration to compare at.
        #[arg(long, short, default_value_t = 0)]
        iteration: u64,

        /// Write the per-body error report as JSON.
        #[arg(long, short)]
        out: Option<PathBuf>,

        /// Reference kernel name.
        kernel: String,

        /// Reference variation options as `--field value` pairs.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        variation: Vec<String>,
    },

    /// Ingest a raw benchmark log into a session document.
    Ingest {
        /// Name of the log file.
        #[arg(long, short, default_value = "benchmark.log")]
        logfile: PathBuf,

        /// Name of the session file to write.
        #[arg(long, short, default_value = "session.json")]
        sessionfile: PathBuf,
    },

    /// List registered kernels and their variations.
    Kernels,
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let registry = Registry::builtin();

    match cli.command {
        Commands::Worker {
            len,
            datafile,
            save_after_iteration,
            read_initial_state,
            min_iterations,
            min_total_runtime,
            kernel,
            variation,
        } => run_worker(
            &registry,
            WorkerArgs {
                len,
                datafile,
                save_after_iteration,
                read_initial_state,
                min_iterations,
                min_total_runtime,
                kernel,
                variation,
            },
        ),
        Commands::Benchmark {
            logfile,
            datafile,
            common_initial_state,
            all_kernels,
            len_range,
            save_after_iteration,
            min_iterations,
            min_total_runtime,
            display,
            kernel,
        } => {
            let kernels = if all_kernels {
                registry.names().map(String::from).collect()
            } else {
                kernel
            };
            if kernels.is_empty() {
                bail!("no kernels selected; name some or pass --all_kernels");
            }
            let display = Display::parse(&display)
                .ok_or_else(|| anyhow!("unknown display mode: {display}"))?;
            benchmark::run(
                &registry,
                BenchmarkConfig {
                    logfile,
                    datafile,
                    common_initial_state,
                    kernels,
                    len_range: (len_range[0], len_range[1]),
                    save_after_iteration,
                    min_iterations,
                    min_total_runtime_s: min_total_runtime,
                    display,
                },
            )
            .await
        }
        Commands::Verify {
            datafile,
            iteration,
            out,
            kernel,
            variation,
        } => run_verify(datafile, iteration, out, kernel, variation),
        Commands::Ingest {
            logfile,
            sessionfile,
        } => run_ingest(logfile, sessionfile),
        Commands::Kernels => run_kernels(&registry),
    }
}

// ============================================================================
// 3. SUBCOMMANDS
// ============================================================================

struct WorkerArgs {
    len: u64,
    datafile: PathBuf,
    save_after_iteration: Vec<u64>,
    read_initial_state: bool,
    min_iterations: u64,
    min_total_runtime: u64,
    kernel: String,
    variation: Vec<String>,
}

fn run_worker(registry: &Registry, args: WorkerArgs) -> Result<()> {
    let descriptor = registry.get(&args.kernel)?;
    let meta = descriptor.load_meta();

    let choices = parse_variation_args(&args.variation)?;
    let mut variations = meta.variations.clone();
    let variation = match variations.select(&choices) {
        Ok(variation) => variation.clone(),
        Err(e) => {
            eprintln!("The following variations are available:");
            for (index, variation) in meta.variations.iter().enumerate() {
                eprintln!("- {}: {}", index + 1, variation);
            }
            return Err(e).context("variation selection failed");
        }
    };

    let config = WorkerConfig {
        kernel: args.kernel,
        variation,
        length: args.len,
        datafile: args.datafile,
        save_after_iteration: args.save_after_iteration,
        read_initial_state: args.read_initial_state,
        min_iterations: args.min_iterations,
        min_total_runtime_s: args.min_total_runtime,
    };

    let worker = Worker::new(registry, config, std::io::stdout())?;
    worker.run()?;
    Ok(())
}

fn run_verify(
    datafile: PathBuf,
    iteration: u64,
    out: Option<PathBuf>,
    kernel: String,
    variation: Vec<String>,
) -> Result<()> {
    let choices = parse_variation_args(&variation)?;
    let variation = Variation::from_map(&choices)?;

    let verification = Verification::open(&datafile)?;
    let results = verification.verify(&kernel, iteration, &variation, Platform::current())?;

    for result in &results {
        for (length, dists) in &result.dists {
            let min = dists.iter().copied().fold(f64::INFINITY, f64::min);
            let max = dists.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            println!(
                "{}: length={} bodies={} min={:.2e} max={:.2e}",
                result.name,
                length,
                dists.len(),
                min,
                max
            );
        }
    }

    if let Some(out) = out {
        let report = serde_json::to_string_pretty(&results)?;
        std::fs::write(&out, report).with_context(|| format!("failed to write {out:?}"))?;
        log::info!("Report written to {:?}", out);
    }
    Ok(())
}

fn run_ingest(logfile: PathBuf, sessionfile: PathBuf) -> Result<()> {
    let session = SessionLog::from_log_file(&logfile)?;
    log::info!(
        "Ingested {:?}: {} benchmark(s), {} worker run(s)",
        logfile,
        session.len(),
        session.iter().map(|b| b.len()).sum::<usize>()
    );
    session.to_file(&sessionfile)?;
    log::info!("Session written to {:?}", sessionfile);
    Ok(())
}

fn run_kernels(registry: &Registry) -> Result<()> {
    for descriptor in registry.iter() {
        let meta = descriptor.load_meta();
        println!("{}: {}", descriptor.name(), meta.description);
        if !meta.requirements.is_empty() {
            println!("  requires: {}", meta.requirements.join(", "));
        }
        for option in meta.variations.to_options() {
            println!(
                "  --{} [{}]",
                option.name(),
                option.choices().collect::<Vec<_>>().join("|")
            );
        }
    }
    Ok(())
}

// ============================================================================
// 4. HELPERS
// ============================================================================

/// Parses trailing `--field value` pairs into a choice map.
fn parse_variation_args(args: &[String]) -> Result<BTreeMap<String, String>> {
    let mut choices = BTreeMap::new();
    let mut iter = args.iter();
    while let Some(field) = iter.next() {
        let field = field
            .strip_prefix("--")
            .ok_or_else(|| anyhow!("expected an option, got '{field}'"))?;
        let value = iter
            .next()
            .ok_or_else(|| anyhow!("option '--{field}' is missing a value"))?;
        choices.insert(field.to_string(), value.clone());
    }
    Ok(choices)
}
