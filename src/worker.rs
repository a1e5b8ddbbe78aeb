// src/worker.rs
//
// =============================================================================
// GRAVITATION: BENCHMARK WORKER
// =============================================================================
//
// Executes one (kernel, variation, length) benchmark point inside its
// own process, so a kernel crash or OOM never corrupts the driver or
// other points. Talks to the driver exclusively through line-delimited
// JSON records on the injected writer (stdout in production, a buffer
// in tests); state reaches disk only through the snapshot archive.
//
// Per iteration, only stage 1 sits inside the runtime timer. Scratch
// reclamation is triggered explicitly around it and timed separately,
// so allocator housekeeping never contaminates the measurement.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

use crate::archive::{GroupKey, SnapshotArchive};
use crate::errors::WorkerError;
use crate::records::{LogLine, StepLog, WorkerLog};
use crate::registry::Registry;
use crate::timing::{BestRunTimer, ElapsedTimer};
use crate::universe::{GalaxyParams, Universe};
use crate::variation::Variation;

/// Everything a worker needs to run one benchmark point. The variation
/// must already be resolved against the kernel's enumerated set.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub kernel: String,
    pub variation: Variation,
    pub length: u64,
    pub datafile: PathBuf,
    pub save_after_iteration: Vec<u64>,
    pub read_initial_state: bool,
    pub min_iterations: u64,
    pub min_total_runtime_s: u64,
}

pub struct Worker<W: Write> {
    kernel: String,
    archive: SnapshotArchive,
    save_after: BTreeSet<u64>,
    min_iterations: u64,
    min_total_runtime_ns: u64,
    rt: BestRunTimer,
    gt: BestRunTimer,
    universe: Universe,
    out: W,
}

impl<W: Write> Worker<W> {
    /// Emits the `start` record and constructs (or loads) the
    /// universe. Construction failures are reported through the log
    /// stream like any later failure.
    pub fn new(registry: &Registry, config: WorkerConfig, mut out: W) -> Result<Self, WorkerError> {
        let start = WorkerLog::start(&config.kernel, config.variation.clone(), config.length);
        if let Err(e) = LogLine::emit(&mut out, "start", start.to_value()) {
            return Err(WorkerError(format!("{e:#}")));
        }

        // checkpoints past the configured minimum extend it
        let save_after: BTreeSet<u64> = config.save_after_iteration.iter().copied().collect();
        let min_iterations = save_after
            .iter()
            .next_back()
            .copied()
            .unwrap_or(0)
            .max(config.min_iterations);

        let built: Result<(SnapshotArchive, Universe)> = (|| {
            LogLine::emit(&mut out, "info", serde_json::json!("Creating simulation ..."))?;

            let descriptor = registry.get(&config.kernel)?;
            descriptor.load_meta();
            descriptor.load_cls();

            let archive = SnapshotArchive::open(&config.datafile)
                .with_context(|| format!("failed to open archive {:?}", config.datafile))?;

            let kernel = descriptor.create(&config.variation)?;
            let universe = if config.read_initial_state {
                let universe = Universe::load(
                    kernel,
                    &archive,
                    &GroupKey::zero(config.length),
                    Some(config.variation.clone()),
                )
                .context("failed to load shared initial state")?;
                if universe.len() as u64 != config.length {
                    return Err(anyhow!(
                        "shared initial state has {} masses, expected {}",
                        universe.len(),
                        config.length
                    ));
                }
                universe
            } else {
                Universe::from_galaxy(
                    kernel,
                    config.variation.clone(),
                    GalaxyParams::with_length(config.length as usize),
                )?
            };

            LogLine::emit(&mut out, "info", serde_json::json!("Simulation created."))?;
            Ok((archive, universe))
        })();

        match built {
            Ok((archive, universe)) => Ok(Self {
                kernel: config.kernel,
                archive,
                save_after,
                min_iterations,
                min_total_runtime_ns: config.min_total_runtime_s * 1_000_000_000,
                rt: BestRunTimer::new(),
                gt: BestRunTimer::new(),
                universe,
                out,
            }),
            Err(e) => Err(Self::bail(&mut out, e)),
        }
    }

    /// Runs the benchmark: at least `min_iterations` steps, then as
    /// many more as the runtime floor demands. Always terminates with
    /// a `stop` record.
    pub fn run(mut self) -> Result<(), WorkerError> {
        match self.run_inner() {
            Ok(()) => {
                let _ = self.universe.stop();
                LogLine::emit(&mut self.out, "stop", serde_json::json!("ok"))
                    .map_err(|e| WorkerError(format!("{e:#}")))?;
                Ok(())
            }
            Err(e) => Err(Self::bail_with_universe(&mut self.out, &mut self.universe, e)),
        }
    }

    fn run_inner(&mut self) -> Result<()> {
        self.universe.start()?;

        if self.save_after.contains(&0) {
            self.store()?;
        }

        let elapsed = ElapsedTimer::new();

        for _ in 0..self.min_iterations {
            self.step()?;
        }

        let elapsed_ns = elapsed.elapsed_ns();
        if elapsed_ns >= self.min_total_runtime_ns {
            LogLine::emit(
                &mut self.out,
                "info",
                serde_json::json!("Minimum iterations sufficient."),
            )?;
            return Ok(());
        }

        LogLine::emit(
            &mut self.out,
            "info",
            serde_json::json!("Extra iterations required."),
        )?;

        // scale the batch so total runtime lands at or above the floor
        let remaining_ns = self.min_total_runtime_ns - elapsed_ns;
        let extra = remaining_ns / elapsed_ns.max(1) * self.min_iterations;
        for _ in 0..extra {
            self.step()?;
        }

        LogLine::emit(
            &mut self.out,
            "info",
            serde_json::json!("Extra iterations finished."),
        )?;
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        self.universe.push_stage1();
        self.universe.collect();

        self.rt.start()?;
        self.universe.iterate_stage1()?;
        let runtime = self.rt.stop()?;

        self.gt.start()?;
        self.universe.collect();
        let gctime = self.gt.stop()?;

        // stages 2 and 3 (incl. the NaN check) stay outside the timers
        self.universe.iterate_with(false)?;

        let iteration = self.universe.iteration();
        if self.save_after.contains(&iteration) {
            self.store()?;
        }

        let step = StepLog {
            iteration,
            runtime,
            gctime,
            runtime_min: self.rt.min()?,
            gctime_min: self.gt.min()?,
        };
        LogLine::emit(&mut self.out, "step", step.to_value())?;
        Ok(())
    }

    fn store(&mut self) -> Result<()> {
        let iteration = self.universe.iteration();
        LogLine::emit(
            &mut self.out,
            "info",
            serde_json::json!(format!("Saving data after iteration {iteration} ...")),
        )?;

        let key = self.universe.group_key(&self.kernel);
        self.universe.save(&self.archive, &key)?;

        LogLine::emit(
            &mut self.out,
            "info",
            serde_json::json!(format!("Data saved after iteration {iteration}.")),
        )?;
        Ok(())
    }

    /// Failure path without a universe yet.
    fn bail(out: &mut W, error: anyhow::Error) -> WorkerError {
        let status = format!("{error:#}");
        let _ = LogLine::emit(out, "stop", serde_json::json!(status.clone()));
        WorkerError(status)
    }

    /// Failure path with a universe: stop the kernel first, then
    /// report the chain as the terminal status.
    fn bail_with_universe(out: &mut W, universe: &mut Universe, error: anyhow::Error) -> WorkerError {
        let _ = universe.stop();
        Self::bail(out, error)
    }
}
