// src/records.rs
//
// =============================================================================
// GRAVITATION: STRUCTURED LOG RECORDS
// =============================================================================
//
// The line-delimited JSON protocol between worker and driver, and the
// nested log model built from it:
//
//   StepLog      one timed simulation step
//   WorkerLog    one worker run: one length, many steps
//   BenchmarkLog many worker runs: one kernel & variation, many lengths
//   SessionLog   many benchmarks: the artifact of `ingest`
//
// Each stdout line is `{"key": K, "value": V, "time": T_ns}` with
// K in {start, info, step, stop, stderr}.

pub mod benchmark;
pub mod session;
pub mod step;
pub mod worker;

pub use benchmark::BenchmarkLog;
pub use session::SessionLog;
pub use step::StepLog;
pub use worker::WorkerLog;

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::errors::BenchmarkLogError;

// ============================================================================
// 1. LINE ENVELOPE
// ============================================================================

/// One line of the worker's structured stdout stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub key: String,
    pub value: serde_json::Value,
    /// Wall-clock time of emission, epoch nanoseconds.
    pub time: i64,
}

impl LogLine {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
            time: now_ns(),
        }
    }

    /// Encodes as a single JSON line (no trailing newline).
    pub fn encode(&self) -> Result<String, BenchmarkLogError> {
        serde_json::to_string(self).map_err(BenchmarkLogError::Unencodable)
    }

    /// Decodes one line. Invalid JSON is a protocol error.
    pub fn decode(line: &str) -> Result<Self, BenchmarkLogError> {
        serde_json::from_str(line.trim_end_matches('\n')).map_err(BenchmarkLogError::InvalidJson)
    }

    /// Encodes, writes and flushes; every record must hit the pipe
    /// immediately so the driver's live ingestion stays live.
    pub fn emit(
        out: &mut impl Write,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), BenchmarkLogError> {
        let line = Self::new(key, value).encode()?;
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}

pub(crate) fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_round_trip() {
        let line = LogLine::new("info", serde_json::json!("Creating simulation ..."));
        let encoded = line.encode().unwrap();
        let decoded = LogLine::decode(&encoded).unwrap();
        assert_eq!(decoded.key, "info");
        assert_eq!(decoded.value, line.value);
        assert_eq!(decoded.time, line.time);
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(matches!(
            LogLine::decode("{\"key\": \"st"),
            Err(BenchmarkLogError::InvalidJson(_))
        ));
    }

    #[test]
    fn emit_terminates_and_flushes_lines() {
        let mut buffer = Vec::new();
        LogLine::emit(&mut buffer, "stop", serde_json::json!("ok")).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
    }
}
