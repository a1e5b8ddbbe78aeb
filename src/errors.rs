// src/errors.rs
//
// =============================================================================
// GRAVITATION: ERROR TAXONOMY
// =============================================================================
//
// One sum type per component boundary. All of these are fatal to the
// operation that raised them and propagate to the nearest boundary:
// worker -> stop record + non-zero exit, driver -> aborted sweep,
// verifier -> aborted pair. No retries anywhere.

use thiserror::Error;

/// Universe state machine violations.
#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("simulation was not started")]
    NotStarted,
    #[error("simulation is running")]
    AlreadyStarted,
    #[error("simulation was stopped")]
    Stopped,
    #[error("mass can not be added after start")]
    MassAfterStart,
    #[error("non-finite component in mass '{0}' after iteration")]
    NotFinite(String),
    #[error("universe of kernel '{0}' can not be iterated")]
    NotIterable(String),
    #[error("kernel failed: {0}")]
    Kernel(String),
}

/// Snapshot archive failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("snapshot group already exists: {0}")]
    DuplicateGroup(String),
    #[error("snapshot group not present: {0}")]
    MissingGroup(String),
    #[error("snapshot group malformed: {0}")]
    MalformedGroup(String),
    #[error("archive i/o failed")]
    Database(#[from] rusqlite::Error),
    #[error("attribute encoding failed")]
    Encoding(#[from] serde_json::Error),
}

/// CLI options do not resolve to an enumerated variation.
#[derive(Debug, Error)]
pub enum VariationError {
    #[error("argument not part of available options: {0}")]
    UnknownOption(String),
    #[error("value '{1}' is not a choice of option '{0}'")]
    UnknownChoice(String, String),
    #[error("no matching variation enumerated")]
    NoMatch,
    #[error("no variation selected")]
    NoneSelected,
}

/// Kernel descriptor used before its lazy halves were loaded.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel '{0}' is not registered")]
    Unknown(String),
    #[error("kernel meta data has not been loaded")]
    MetaNotLoaded,
    #[error("kernel class has not been loaded")]
    ClsNotLoaded,
}

/// Log line or log state machine violations.
#[derive(Debug, Error)]
pub enum BenchmarkLogError {
    #[error("line is not valid JSON")]
    InvalidJson(#[source] serde_json::Error),
    #[error("record can not be encoded as JSON")]
    Unencodable(#[source] serde_json::Error),
    #[error("unknown record key: {0}")]
    UnknownKey(String),
    #[error("log stream i/o failed")]
    Io(#[from] std::io::Error),
    #[error("trying to start a worker run that has been started earlier")]
    AlreadyStarted,
    #[error("trying to add to a worker run that has not been started")]
    NotStarted,
    #[error("trying to modify a stopped worker run (status: {0})")]
    AlreadyStopped(String),
    #[error("iteration {0} already present in worker run")]
    DuplicateIteration(u64),
    #[error("iteration {0} not present in worker run")]
    MissingIteration(u64),
    #[error("no step data available")]
    Empty,
    #[error("worker does not belong to benchmark")]
    ForeignWorker,
    #[error("length {0} already present in benchmark")]
    DuplicateLength(u64),
    #[error("length {0} not present in benchmark")]
    MissingLength(u64),
}

/// Verification engine failures.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("archive can not be opened: {0}")]
    NotOpen(String),
    #[error("no snapshots of reference kernel '{0}' present")]
    MissingReference(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Timer misuse.
#[derive(Debug, Error)]
pub enum TimerError {
    #[error("timer is already running")]
    AlreadyRunning,
    #[error("timer is not running")]
    NotRunning,
    #[error("nothing has been recorded")]
    Empty,
}

/// Terminal wrapper the worker raises so the driver sees a clean
/// non-zero exit. The inner chain ends up in the `stop` record.
#[derive(Debug, Error)]
#[error("worker failed: {0}")]
pub struct WorkerError(pub String);
