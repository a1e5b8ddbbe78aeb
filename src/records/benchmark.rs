// src/records/benchmark.rs
//
// =============================================================================
// GRAVITATION: BENCHMARK LOG
// =============================================================================
//
// Many worker runs sharing one (kernel, variation, platform), keyed by
// length. Fed either live (record by record, while the driver streams
// a child's stdout) or whole (from ingested worker logs). Maintains
// the rolling best-time-per-iteration map that the driver plots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::BenchmarkLogError;
use crate::records::WorkerLog;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchmarkLog {
    pub workers: BTreeMap<u64, WorkerLog>,
    /// Length of the worker currently receiving live records.
    #[serde(skip)]
    current: Option<u64>,
}

// identity is the member set; the live-ingestion cursor is transient
impl PartialEq for BenchmarkLog {
    fn eq(&self, other: &Self) -> bool {
        self.workers == other.workers
    }
}

impl BenchmarkLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn get(&self, length: u64) -> Result<&WorkerLog, BenchmarkLogError> {
        self.workers
            .get(&length)
            .ok_or(BenchmarkLogError::MissingLength(length))
    }

    /// Sorted lengths present in this benchmark.
    pub fn lengths(&self) -> impl Iterator<Item = u64> + '_ {
        self.workers.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerLog> {
        self.workers.values()
    }

    /// Whether `worker` belongs here. An empty benchmark accepts
    /// anything; afterwards identity is fixed by the first member.
    pub fn matches(&self, worker: &WorkerLog) -> bool {
        match self.workers.values().next() {
            None => true,
            Some(first) => first.matches(worker),
        }
    }

    pub fn add(&mut self, worker: WorkerLog) -> Result<(), BenchmarkLogError> {
        if !self.matches(&worker) {
            return Err(BenchmarkLogError::ForeignWorker);
        }
        if self.workers.contains_key(&worker.length) {
            return Err(BenchmarkLogError::DuplicateLength(worker.length));
        }
        self.current = Some(worker.length);
        self.workers.insert(worker.length, worker);
        Ok(())
    }

    /// Handles one record of a live stream. A `start` opens a new
    /// worker run; every other key is routed to the current one.
    /// Records arriving after the current run errored are dropped;
    /// the stream tail of a crashed worker is noise, not protocol.
    pub fn live(&mut self, key: &str, value: &serde_json::Value) -> Result<(), BenchmarkLogError> {
        if key == "start" {
            let worker =
                WorkerLog::from_value(value).map_err(BenchmarkLogError::InvalidJson)?;
            return self.add(worker);
        }

        let current = match self
            .current
            .and_then(|length| self.workers.get_mut(&length))
        {
            Some(worker) if worker.is_running() => worker,
            _ => return Ok(()),
        };
        current.live(key, value)
    }

    /// The rolling `length -> best stage-1 time [ns]` map.
    pub fn runtime_min_by_length(&self) -> BTreeMap<u64, u64> {
        self.workers
            .iter()
            .filter_map(|(&length, worker)| worker.runtime_min().ok().map(|min| (length, min)))
            .collect()
    }

    /// Renders the current state as a fixed-size ASCII plot, x
    /// log-scale base 2, y log-scale base 10. `None` until at least
    /// one step has been recorded.
    pub fn to_plot(&self, width: usize, height: usize) -> Option<String> {
        let data = self.runtime_min_by_length();
        if data.is_empty() {
            return None;
        }

        let points: Vec<(f64, f64)> = data
            .iter()
            .map(|(&length, &ns)| ((length as f64).log2(), (ns as f64 * 1e-9).log10()))
            .collect();

        let (width, height) = (width.max(20), height.max(5));
        let x_min = points.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
        let x_max = points.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
        let y_min = points.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
        let y_max = points.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
        let x_span = (x_max - x_min).max(1e-9);
        let y_span = (y_max - y_min).max(1e-9);

        let mut grid = vec![vec![' '; width]; height];
        for (x, y) in &points {
            let col = (((x - x_min) / x_span) * (width - 1) as f64).round() as usize;
            let row = (((y - y_min) / y_span) * (height - 1) as f64).round() as usize;
            grid[height - 1 - row][col] = 'x';
        }

        let (&current_length, current_worker) = self.workers.iter().next_back()?;
        let current_iteration = current_worker.steps.keys().next_back().copied().unwrap_or(0);
        let best = *data.values().min()? as f64 * 1e-9;

        let mut out = String::new();
        for row in grid {
            out.push_str(&row.into_iter().collect::<String>());
            out.push('\n');
        }
        out.push_str(&format!(
            "x: log2(len) [{:.0}..{:.0}]  y: log10(s/iter) [{:.2}..{:.2}]\n",
            x_min, x_max, y_min, y_max
        ));
        let first = self.workers.values().next()?;
        out.push_str(&format!(
            "kernel={} / variation={} / len={} / iteration={} / best={:.2e}s\n",
            first.kernel, first.variation, current_length, current_iteration, best
        ));
        Some(out)
    }
}

// =============================================================================
// TESTS
// =============================================================================
