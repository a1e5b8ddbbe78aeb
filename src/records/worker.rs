// src/records/worker.rs
//
// =============================================================================
// GRAVITATION: WORKER LOG
// =============================================================================
//
// One worker run: identity (kernel, variation, platform, length), a
// status with monotone transitions, and the step series. Status values:
//
//   "start"        emitted, nothing measured yet
//   "running"      at least one step recorded
//   "ok"           terminal, clean stop
//   "did not stop" terminal, stream ended without a stop record
//   anything else  terminal, the worker's formatted error chain
//
// Terminal states are frozen; trying to mutate a stopped run is a log
// protocol error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::BenchmarkLogError;
use crate::platform::Platform;
use crate::records::{LogLine, StepLog};
use crate::variation::Variation;

pub const STATUS_START: &str = "start";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_OK: &str = "ok";
pub const STATUS_DID_NOT_STOP: &str = "did not stop";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLog {
    pub kernel: String,
    pub variation: Variation,
    pub platform: Platform,
    pub status: String,
    pub length: u64,
    pub steps: BTreeMap<u64, StepLog>,
}

impl WorkerLog {
    /// A fresh run in `start` state, platform captured from this
    /// process.
    pub fn start(kernel: impl Into<String>, variation: Variation, length: u64) -> Self {
        Self {
            kernel: kernel.into(),
            variation,
            platform: Platform::current().clone(),
            status: STATUS_START.into(),
            length,
            steps: BTreeMap::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == STATUS_START || self.status == STATUS_RUNNING
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, iteration: u64) -> Result<&StepLog, BenchmarkLogError> {
        self.steps
            .get(&iteration)
            .ok_or(BenchmarkLogError::MissingIteration(iteration))
    }

    /// Best stage-1 time over the whole run, from the latest step's
    /// running minimum.
    pub fn runtime_min(&self) -> Result<u64, BenchmarkLogError> {
        self.steps
            .values()
            .next_back()
            .map(|step| step.runtime_min)
            .ok_or(BenchmarkLogError::Empty)
    }

    pub fn gctime_min(&self) -> Result<u64, BenchmarkLogError> {
        self.steps
            .values()
            .next_back()
            .map(|step| step.gctime_min)
            .ok_or(BenchmarkLogError::Empty)
    }

    /// Appends a step; first step moves the run to `running`.
    pub fn add(&mut self, step: StepLog) -> Result<(), BenchmarkLogError> {
        if !self.is_running() {
            return Err(BenchmarkLogError::AlreadyStopped(self.status.clone()));
        }
        if self.steps.contains_key(&step.iteration) {
            return Err(BenchmarkLogError::DuplicateIteration(step.iteration));
        }
        self.steps.insert(step.iteration, step);
        self.status = STATUS_RUNNING.into();
        Ok(())
    }

    /// Terminal transition; only legal from `start`/`running`.
    pub fn set_status(&mut self, status: impl Into<String>) -> Result<(), BenchmarkLogError> {
        if !self.is_running() {
            return Err(BenchmarkLogError::AlreadyStopped(self.status.clone()));
        }
        self.status = status.into();
        Ok(())
    }

    /// Whether two runs belong to the same benchmark.
    pub fn matches(&self, other: &Self) -> bool {
        self.kernel == other.kernel
            && self.variation == other.variation
            && self.platform == other.platform
    }

    /// Handles one record of the live stream. `start` must have been
    /// consumed by whoever created this log; `info` and `stderr` carry
    /// no state.
    pub fn live(&mut self, key: &str, value: &serde_json::Value) -> Result<(), BenchmarkLogError> {
        match key {
            "start" => Err(BenchmarkLogError::AlreadyStarted),
            "info" | "stderr" => Ok(()),
            "step" => {
                let step = StepLog::from_value(value).map_err(BenchmarkLogError::InvalidJson)?;
                self.add(step)
            }
            "stop" => {
                let status = value.as_str().ok_or_else(|| {
                    BenchmarkLogError::UnknownKey("stop value is not a string".into())
                })?;
                self.set_status(status)
            }
            other => Err(BenchmarkLogError::UnknownKey(other.into())),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("worker log fields are always serializable")
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// Reads one worker run from a line stream. Returns `None` when
    /// the stream is exhausted without a `start` record. A stream
    /// ending mid-run yields the run with status `"did not stop"`.
    pub fn from_stream(
        lines: &mut impl Iterator<Item = String>,
    ) -> Result<Option<Self>, BenchmarkLogError> {
        let mut run: Option<Self> = None;

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }

            let record = LogLine::decode(&line)?;
            match record.key.as_str() {
                "start" => {
                    if run.is_some() {
                        return Err(BenchmarkLogError::AlreadyStarted);
                    }
                    run = Some(
                        Self::from_value(&record.value).map_err(BenchmarkLogError::InvalidJson)?,
                    );
                }
                "info" | "stderr" => {}
                "step" => {
                    let run = run.as_mut().ok_or(BenchmarkLogError::NotStarted)?;
                    let step =
                        StepLog::from_value(&record.value).map_err(BenchmarkLogError::InvalidJson)?;
                    run.add(step)?;
                }
                "stop" => {
                    let mut run = run.take().ok_or(BenchmarkLogError::NotStarted)?;
                    let status = record.value.as_str().ok_or_else(|| {
                        BenchmarkLogError::UnknownKey("stop value is not a string".into())
                    })?;
                    run.set_status(status)?;
                    return Ok(Some(run));
                }
                other => return Err(BenchmarkLogError::UnknownKey(other.into())),
            }
        }

        // truncated stream: classify instead of failing
        if let Some(run) = run.as_mut() {
            run.set_status(STATUS_DID_NOT_STOP)?;
        }
        Ok(run)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn step(iteration: u64, runtime: u64, runtime_min: u64) -> StepLog {
        StepLog {
            iteration,
            runtime,
            gctime: 1,
            runtime_min,
            gctime_min: 1,
        }
    }

    fn sample() -> WorkerLog {
        WorkerLog::start("naive", Variation::default(), 4)
    }

    #[test]
    fn steps_drive_the_status() {
        let mut run = sample();
        assert_eq!(run.status, STATUS_START);

        run.add(step(1, 100, 100)).unwrap();
        assert_eq!(run.status, STATUS_RUNNING);
        assert_eq!(run.runtime_min().unwrap(), 100);

        run.add(step(2, 80, 80)).unwrap();
        assert_eq!(run.runtime_min().unwrap(), 80);

        run.set_status(STATUS_OK).unwrap();
        assert!(matches!(
            run.add(step(3, 50, 50)),
            Err(BenchmarkLogError::AlreadyStopped(_))
        ));
        assert!(matches!(
            run.set_status("ok"),
            Err(BenchmarkLogError::AlreadyStopped(_))
        ));
    }

    #[test]
    fn duplicate_iterations_are_rejected() {
        let mut run = sample();
        run.add(step(1, 100, 100)).unwrap();
        assert!(matches!(
            run.add(step(1, 90, 90)),
            Err(BenchmarkLogError::DuplicateIteration(1))
        ));
    }

    #[test]
    fn stream_parse_builds_a_complete_run() {
        let mut template = sample();
        let start = LogLine::new("start", template.to_value()).encode().unwrap();
        let s1 = LogLine::new("step", step(1, 100, 100).to_value())
            .encode()
            .unwrap();
        let s2 = LogLine::new("step", step(2, 80, 80).to_value())
            .encode()
            .unwrap();
        let stop = LogLine::new("stop", serde_json::json!("ok"))
            .encode()
            .unwrap();

        let mut lines = vec![start, s1, s2, stop].into_iter();
        let run = WorkerLog::from_stream(&mut lines).unwrap().unwrap();

        assert_eq!(run.len(), 2);
        assert_eq!(run.status, STATUS_OK);
        template.add(step(1, 100, 100)).unwrap();
        assert!(run.matches(&template));
    }

    #[test]
    fn corrupt_line_fails_the_parse() {
        let start = LogLine::new("start", sample().to_value()).encode().unwrap();
        let mut lines = vec![start, "{not json".into()].into_iter();
        assert!(matches!(
            WorkerLog::from_stream(&mut lines),
            Err(BenchmarkLogError::InvalidJson(_))
        ));
    }

    #[test]
    fn truncated_stream_did_not_stop() {
        let start = LogLine::new("start", sample().to_value()).encode().unwrap();
        let s1 = LogLine::new("step", step(1, 100, 100).to_value())
            .encode()
            .unwrap();
        let mut lines = vec![start, s1].into_iter();
        let run = WorkerLog::from_stream(&mut lines).unwrap().unwrap();
        assert_eq!(run.status, STATUS_DID_NOT_STOP);
    }

    #[test]
    fn empty_stream_yields_nothing() {
        let mut lines = std::iter::empty();
        assert!(WorkerLog::from_stream(&mut lines).unwrap().is_none());
    }

    #[test]
    fn json_round_trip_preserves_steps() {
        let mut run = sample();
        run.add(step(1, 100, 100)).unwrap();
        run.add(step(2, 80, 80)).unwrap();
        run.set_status(STATUS_OK).unwrap();

        let parsed = WorkerLog::from_value(&run.to_value()).unwrap();
        assert_eq!(parsed, run);
    }
}
