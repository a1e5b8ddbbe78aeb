// src/benchmark.rs
//
// =============================================================================
// GRAVITATION: BENCHMARK DRIVER
// =============================================================================
//
// Sweeps lengths per (kernel, variation), one worker subprocess per
// benchmark point. The driver itself stays single-threaded: per child
// it runs two reader tasks that pump stdout/stderr lines into a
// bounded channel, and a 200 ms tick drains that channel into the
// live benchmark log. Bounded, so a runaway kernel can not OOM the
// driver. The archive is the only state shared with workers.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::archive::{GroupKey, SnapshotArchive};
use crate::errors::BenchmarkLogError;
use crate::records::{BenchmarkLog, LogLine};
use crate::registry::Registry;
use crate::universe::{GalaxyParams, Universe, ZeroKernel};
use crate::variation::Variation;

const DRAIN_INTERVAL: Duration = Duration::from_millis(200);
const LINE_CHANNEL_DEPTH: usize = 1024;
const PLOT_WIDTH: usize = 72;
const PLOT_HEIGHT: usize = 16;

// ============================================================================
// 1. CONFIGURATION
// ============================================================================

/// What to show while the benchmark runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Display {
    Plot,
    Log,
    None,
}

impl Display {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "plot" => Some(Self::Plot),
            "log" => Some(Self::Log),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    pub logfile: PathBuf,
    pub datafile: PathBuf,
    pub common_initial_state: bool,
    pub kernels: Vec<String>,
    pub len_range: (u32, u32),
    pub save_after_iteration: Vec<u64>,
    pub min_iterations: u64,
    pub min_total_runtime_s: u64,
    pub display: Display,
}

// ============================================================================
// 2. LENGTH SWEEP
// ============================================================================

/// Geometric length sweep: `2^s, round(2^(s+0.5)), 2^(s+1), ... 2^e`.
pub fn sq_range(start: u32, stop: u32) -> Vec<u64> {
    assert!(start <= stop, "invalid length range");
    let mut lengths = Vec::with_capacity(2 * (stop - start) as usize + 1);
    for exponent in start..stop {
        lengths.push(1u64 << exponent);
        lengths.push(2f64.powf(exponent as f64 + 0.5).round() as u64);
    }
    lengths.push(1u64 << stop);
    lengths
}

// ============================================================================
// 3. LIVE SESSION
// ============================================================================

/// Which child stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Handles the live output of one (kernel, variation) sweep: persists
/// every line to the session log file, wraps stderr into synthetic
/// records so the file stays homogeneous, feeds parsed records to the
/// rolling BenchmarkLog and replots on every step.
///
/// A malformed line sets the error flag; the remaining output is
/// echoed verbatim and the error is raised once the worker has
/// terminated.
struct LiveSession {
    logfile: File,
    display: Display,
    log: BenchmarkLog,
    error: Option<BenchmarkLogError>,
}

impl LiveSession {
    fn new(logfile: File, display: Display) -> Self {
        Self {
            logfile,
            display,
            log: BenchmarkLog::new(),
            error: None,
        }
    }

    fn handle(&mut self, stream: Stream, line: &str) -> Result<(), BenchmarkLogError> {
        let line = match stream {
            Stream::Stdout => line.to_string(),
            Stream::Stderr => LogLine::new("stderr", serde_json::json!(line)).encode()?,
        };

        writeln!(self.logfile, "{line}")?;
        self.logfile.flush()?;

        if self.display == Display::Log {
            println!("{line}");
        }
        if stream == Stream::Stderr {
            return Ok(());
        }

        if self.error.is_some() {
            // already broken: echo what the worker still says and move on
            if self.display != Display::Log {
                println!("{line}");
            }
            return Ok(());
        }

        let record = match LogLine::decode(&line) {
            Ok(record) => record,
            Err(e) => {
                if self.display != Display::Log {
                    println!("{line}");
                }
                self.error = Some(e);
                return Ok(());
            }
        };

        self.log.live(&record.key, &record.value)?;

        if self.display == Display::Plot && record.key == "step" {
            if let Some(plot) = self.log.to_plot(PLOT_WIDTH, PLOT_HEIGHT) {
                println!("{plot}");
            }
        }
        Ok(())
    }

    /// Raises the error stored while streaming, if any.
    fn check(&mut self) -> Result<(), BenchmarkLogError> {
        match self.error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// ============================================================================
// 4. THE DRIVER
// ============================================================================

/// Runs the configured set of benchmarks via worker subprocesses.
pub async fn run(registry: &Registry, config: BenchmarkConfig) -> Result<()> {
    let (start, stop) = config.len_range;
    if start > stop {
        bail!("invalid length range: 2^{start} .. 2^{stop}");
    }

    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".into());
    log::info!(
        "Driving benchmarks on {}: kernels={:?}, lengths 2^{}..2^{}",
        host,
        config.kernels,
        start,
        stop
    );

    if config.common_initial_state {
        common_initial_states(start, stop, &config.datafile)?;
    }

    let logfile = File::create(&config.logfile)
        .with_context(|| format!("failed to create log file {:?}", config.logfile))?;

    for kernel in &config.kernels {
        let descriptor = registry.get(kernel)?;
        let meta = descriptor.load_meta();

        for variation in meta.variations.iter() {
            // per-thread-count enumerations stay selectable for
            // workers but are redundant in sweeps
            if variation.threads().name().starts_with('t') {
                continue;
            }

            log::info!("Benchmark {} {}", kernel, variation);
            let mut session = LiveSession::new(logfile.try_clone()?, config.display);

            for length in sq_range(start, stop) {
                let status = spawn_worker(&config, kernel, variation, length, &mut session)
                    .await
                    .with_context(|| format!("worker {kernel} len={length} failed to run"))?;
                session.check()?;

                if !status.success() {
                    log::warn!(
                        "Worker {} len={} exited with {}; see log for its stop record",
                        kernel,
                        length,
                        status
                    );
                }
            }
        }
    }

    log::info!("Benchmark sweep complete.");
    Ok(())
}

/// Writes one shared galaxy per length so every kernel starts from the
/// same randomized initial state.
pub fn common_initial_states(start: u32, stop: u32, datafile: &Path) -> Result<()> {
    let archive = SnapshotArchive::open(datafile)
        .with_context(|| format!("failed to open archive {datafile:?}"))?;

    for length in sq_range(start, stop) {
        log::info!(
            "Creating initial state for {} masses (max {}) ...",
            length,
            1u64 << stop
        );
        let universe = Universe::from_galaxy(
            Box::new(ZeroKernel),
            Variation::default(),
            GalaxyParams::with_length(length as usize),
        )?;
        universe.save(&archive, &GroupKey::zero(length))?;
    }
    Ok(())
}

/// The concrete worker command line. Respawns this binary.
fn worker_command(
    config: &BenchmarkConfig,
    kernel: &str,
    variation: &Variation,
    length: u64,
) -> Result<Command> {
    let exe = std::env::current_exe().context("failed to locate own executable")?;
    let mut command = Command::new(exe);
    command
        .arg("worker")
        .arg("--len")
        .arg(length.to_string())
        .arg("--datafile")
        .arg(&config.datafile);
    for checkpoint in &config.save_after_iteration {
        command.arg("--save_after_iteration").arg(checkpoint.to_string());
    }
    command
        .arg("--min_iterations")
        .arg(config.min_iterations.to_string())
        .arg("--min_total_runtime")
        .arg(config.min_total_runtime_s.to_string());
    if config.common_initial_state {
        command.arg("--read_initial_state");
    }
    command.arg(kernel);
    for (field, value) in variation.to_map() {
        command.arg(format!("--{field}")).arg(value);
    }
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    Ok(command)
}

/// Spawns one worker and streams its output into the session until it
/// terminates.
async fn spawn_worker(
    config: &BenchmarkConfig,
    kernel: &str,
    variation: &Variation,
    length: u64,
    session: &mut LiveSession,
) -> Result<std::process::ExitStatus> {
    let mut child = worker_command(config, kernel, variation, length)?
        .spawn()
        .context("failed to spawn worker subprocess")?;

    let stdout = child.stdout.take().context("worker stdout not piped")?;
    let stderr = child.stderr.take().context("worker stderr not piped")?;

    let (tx, mut rx) = mpsc::channel::<(Stream, String)>(LINE_CHANNEL_DEPTH);
    tokio::spawn(pump_lines(stdout, tx.clone(), Stream::Stdout));
    tokio::spawn(pump_lines(stderr, tx, Stream::Stderr));

    let mut tick = tokio::time::interval(DRAIN_INTERVAL);
    let status = loop {
        tick.tick().await;
        while let Ok((stream, line)) = rx.try_recv() {
            session.handle(stream, &line)?;
        }
        if let Some(status) = child.try_wait()? {
            break status;
        }
    };

    // the child is gone; drain whatever the readers still hold
    while let Some((stream, line)) = rx.recv().await {
        session.handle(stream, &line)?;
    }

    Ok(status)
}

/// Reads lines from one child stream into the shared channel. The
/// bounded send is the backpressure point.
async fn pump_lines(
    stream: impl AsyncRead + Unpin,
    tx: mpsc::Sender<(Stream, String)>,
    id: Stream,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((id, line)).await.is_err() {
            break;
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sq_range_interpolates_half_steps() {
        assert_eq!(sq_range(3, 5), vec![8, 12, 16, 24, 32]);
    }

    #[test]
    fn sq_range_covers_bounds_and_is_increasing() {
        let lengths = sq_range(2, 10);
        assert_eq!(*lengths.first().unwrap(), 4);
        assert_eq!(*lengths.last().unwrap(), 1024);
        assert_eq!(lengths.len(), 2 * 8 + 1);
        assert!(lengths.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn sq_range_degenerate_is_a_single_length() {
        assert_eq!(sq_range(4, 4), vec![16]);
    }

    #[test]
    fn display_parses_known_modes() {
        assert_eq!(Display::parse("plot"), Some(Display::Plot));
        assert_eq!(Display::parse("log"), Some(Display::Log));
        assert_eq!(Display::parse("none"), Some(Display::None));
        assert_eq!(Display::parse("tui"), None);
    }

    #[test]
    fn stderr_lines_are_wrapped_for_the_logfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.log");
        let mut session = LiveSession::new(File::create(&path).unwrap(), Display::None);

        session.handle(Stream::Stderr, "warning: noisy child").unwrap();
        session.check().unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let record = LogLine::decode(raw.trim()).unwrap();
        assert_eq!(record.key, "stderr");
        assert_eq!(record.value, serde_json::json!("warning: noisy child"));
    }

    #[test]
    fn malformed_stdout_is_raised_after_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.log");
        let mut session = LiveSession::new(File::create(&path).unwrap(), Display::None);

        session.handle(Stream::Stdout, "{oops").unwrap();
        // later lines are still persisted
        session.handle(Stream::Stdout, "{even worse").unwrap();
        assert!(matches!(
            session.check(),
            Err(BenchmarkLogError::InvalidJson(_))
        ));
        // error is consumed by raising it
        session.check().unwrap();
    }

    #[test]
    fn worker_command_matches_the_launch_contract() {
        let config = BenchmarkConfig {
            logfile: "bench.log".into(),
            datafile: "data.db".into(),
            common_initial_state: true,
            kernels: vec!["naive".into()],
            len_range: (2, 4),
            save_after_iteration: vec![0, 2],
            min_iterations: 3,
            min_total_runtime_s: 0,
            display: Display::None,
        };
        let command = worker_command(&config, "naive", &Variation::default(), 16).unwrap();
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec![
                "worker",
                "--len",
                "16",
                "--datafile",
                "data.db",
                "--save_after_iteration",
                "0",
                "--save_after_iteration",
                "2",
                "--min_iterations",
                "3",
                "--min_total_runtime",
                "0",
                "--read_initial_state",
                "naive",
                "--dtype",
                "float64",
                "--target",
                "cpu",
                "--threads",
                "single",
            ]
        );
    }

    #[test]
    fn mid_kernel_variations_are_skipped_by_name() {
        use crate::variation::Threads;
        assert!(Threads::Count(4).name().starts_with('t'));
        assert!(!Threads::Auto.name().starts_with('t'));
        assert!(!Threads::Single.name().starts_with('t'));
        assert!(!Threads::Physical.name().starts_with('t'));
        assert!(!Threads::Logical.name().starts_with('t'));
    }
}
