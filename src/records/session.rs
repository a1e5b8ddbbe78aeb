// src/records/session.rs
//
// =============================================================================
// GRAVITATION: SESSION LOG
// =============================================================================
//
// An unordered collection of benchmarks, the artifact of `ingest`.
// Built either from its own JSON document or by replaying a raw
// benchmark log file (concatenated worker streams, stderr wrappers
// included) and grouping the recovered worker runs by identity.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::BenchmarkLogError;
use crate::records::{BenchmarkLog, WorkerLog};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionLog {
    pub benchmarks: Vec<BenchmarkLog>,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.benchmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.benchmarks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BenchmarkLog> {
        self.benchmarks.iter()
    }

    /// Merges another session into this one.
    pub fn merge(&mut self, other: SessionLog) {
        self.benchmarks.extend(other.benchmarks);
    }

    /// Files a worker run into the benchmark it belongs to, opening a
    /// new benchmark if none matches.
    pub fn file_worker(&mut self, worker: WorkerLog) -> Result<(), BenchmarkLogError> {
        for benchmark in &mut self.benchmarks {
            if benchmark.matches(&worker) {
                return benchmark.add(worker);
            }
        }
        let mut benchmark = BenchmarkLog::new();
        benchmark.add(worker)?;
        self.benchmarks.push(benchmark);
        Ok(())
    }

    /// Replays a raw log stream: one worker run after another until
    /// the stream dries up. Truncated trailing runs come back as
    /// `"did not stop"` and are kept.
    pub fn from_log_lines(
        lines: &mut impl Iterator<Item = String>,
    ) -> Result<Self, BenchmarkLogError> {
        let mut session = Self::new();
        while let Some(worker) = WorkerLog::from_stream(lines)? {
            session.file_worker(worker)?;
        }
        Ok(session)
    }

    pub fn from_log_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("failed to open log {path:?}"))?;
        let mut lines = BufReader::new(file).lines().map_while(|line| line.ok());
        Self::from_log_lines(&mut lines)
            .with_context(|| format!("failed to ingest log {path:?}"))
    }

    /// Canonical session document: sorted keys, pretty-printed.
    pub fn to_json(&self) -> String {
        let value = serde_json::to_value(self).expect("session fields are always serializable");
        serde_json::to_string_pretty(&value).expect("value serialization is infallible")
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut file =
            File::create(path).with_context(|| format!("failed to create session {path:?}"))?;
        file.write_all(self.to_json().as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read session {path:?}"))?;
        Self::from_json(&raw).with_context(|| format!("failed to parse session {path:?}"))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{LogLine, StepLog};
    use crate::variation::{Dtype, Target, Threads, Variation};

    fn stream_for(kernel: &str, variation: Variation, length: u64, stop: Option<&str>) -> Vec<String> {
        let worker = WorkerLog::start(kernel, variation, length);
        let step = StepLog {
            iteration: 1,
            runtime: 100,
            gctime: 2,
            runtime_min: 100,
            gctime_min: 2,
        };
        let mut lines = vec![
            LogLine::new("start", worker.to_value()).encode().unwrap(),
            LogLine::new("info", serde_json::json!("Creating simulation ..."))
                .encode()
                .unwrap(),
            LogLine::new("step", step.to_value()).encode().unwrap(),
            LogLine::new("stderr", serde_json::json!("warning: noisy child"))
                .encode()
                .unwrap(),
        ];
        if let Some(status) = stop {
            lines.push(LogLine::new("stop", serde_json::json!(status)).encode().unwrap());
        }
        lines
    }

    #[test]
    fn workers_group_into_benchmarks_by_identity() {
        let f64_variation = Variation::default();
        let f32_variation = Variation::new(Dtype::Float32, Target::Cpu, Threads::Single);

        let mut lines = Vec::new();
        lines.extend(stream_for("naive", f64_variation.clone(), 4, Some("ok")));
        lines.extend(stream_for("naive", f64_variation, 8, Some("ok")));
        lines.extend(stream_for("naive", f32_variation, 4, Some("ok")));

        let mut iter = lines.into_iter();
        let session = SessionLog::from_log_lines(&mut iter).unwrap();

        assert_eq!(session.len(), 2);
        let sizes: Vec<usize> = session.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[test]
    fn truncated_tail_is_kept_as_did_not_stop() {
        let mut lines = stream_for("naive", Variation::default(), 4, None).into_iter();
        let session = SessionLog::from_log_lines(&mut lines).unwrap();
        assert_eq!(session.len(), 1);
        let worker = session.benchmarks[0].get(4).unwrap();
        assert_eq!(worker.status, "did not stop");
        assert_eq!(worker.len(), 1);
    }

    #[test]
    fn session_document_round_trips() {
        let mut lines = stream_for("naive", Variation::default(), 4, Some("ok")).into_iter();
        let session = SessionLog::from_log_lines(&mut lines).unwrap();

        let parsed = SessionLog::from_json(&session.to_json()).unwrap();
        assert_eq!(parsed, session);
        assert!(session.to_json().contains("\"benchmarks\""));
    }

    #[test]
    fn merge_concatenates_benchmarks() {
        let mut first = {
            let mut lines = stream_for("naive", Variation::default(), 4, Some("ok")).into_iter();
            SessionLog::from_log_lines(&mut lines).unwrap()
        };
        let second = {
            let mut lines = stream_for("rayon", Variation::default(), 4, Some("ok")).into_iter();
            SessionLog::from_log_lines(&mut lines).unwrap()
        };
        first.merge(second);
        assert_eq!(first.len(), 2);
    }
}
