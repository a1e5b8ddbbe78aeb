// src/records/step.rs
//
// One timed benchmark step. All times are wall-clock nanoseconds; the
// `*_min` fields carry the running minimum over the worker run so a
// live reader never has to scan backwards.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLog {
    pub iteration: u64,
    pub runtime: u64,
    pub gctime: u64,
    pub runtime_min: u64,
    pub gctime_min: u64,
}

impl StepLog {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("step fields are always serializable")
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}
