// src/lib.rs
//
// =============================================================================
// GRAVITATION: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

// 1. Declare Modules
pub mod archive;
pub mod benchmark;
pub mod errors;
pub mod kernels;
pub mod mass;
pub mod platform;
pub mod records;
pub mod registry;
pub mod timing;
pub mod universe;
pub mod variation;
pub mod verification;
pub mod worker;

// 2. Re-exports (The Public API)
pub use archive::{GroupKey, Snapshot, SnapshotArchive};
pub use mass::{Mass, DIMS};
pub use platform::Platform;
pub use records::{BenchmarkLog, SessionLog, StepLog, WorkerLog};
pub use registry::Registry;
pub use universe::{GalaxyParams, Kernel, Universe, UniverseSettings, ZeroKernel};
pub use variation::{Dtype, OptionSpec, Target, Threads, Variation, Variations};
pub use worker::{Worker, WorkerConfig};
