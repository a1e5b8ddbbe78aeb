// src/platform.rs
//
// =============================================================================
// GRAVITATION: PLATFORM RECORD
// =============================================================================
//
// A frozen description of the host a worker ran on. Participates in
// snapshot and benchmark identity, so every field must be stable for
// the lifetime of the process: detection runs once and is cached.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

// ============================================================================
// 1. RECORD
// ============================================================================

/// Host fingerprint: runtime, OS, CPU topology, RAM, GPUs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub cpu_brand: String,
    pub cpu_logical: usize,
    pub cpu_machine: String,
    pub cpu_physical: usize,
    pub cpu_processor: String,
    /// Total RAM in GiB.
    pub cpu_ram: u64,
    /// Semicolon-joined GPU descriptors, `[none]` if detection found nothing.
    pub gpu_info: String,
    pub os_release: String,
    pub os_system: String,
    pub os_version: String,
    pub runtime_implementation: String,
    pub runtime_version: String,
}

static CURRENT: OnceLock<Platform> = OnceLock::new();

impl Platform {
    /// The platform of this process. Detected once, then frozen.
    pub fn current() -> &'static Platform {
        CURRENT.get_or_init(Platform::detect)
    }

    fn detect() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::nothing()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::everything()),
        );

        let (cpu_brand, cpu_processor) = sys
            .cpus()
            .first()
            .map(|cpu| (cpu.brand().trim().to_string(), cpu.vendor_id().to_string()))
            .unwrap_or_else(|| ("[unknown]".into(), "[unknown]".into()));

        Self {
            cpu_brand,
            cpu_logical: num_cpus::get(),
            cpu_machine: std::env::consts::ARCH.into(),
            cpu_physical: num_cpus::get_physical(),
            cpu_processor,
            cpu_ram: sys.total_memory() / 1024 / 1024 / 1024,
            gpu_info: Self::detect_gpus(),
            os_release: System::os_version().unwrap_or_else(|| "[unknown]".into()),
            os_system: System::name().unwrap_or_else(|| std::env::consts::OS.into()),
            os_version: System::kernel_version().unwrap_or_else(|| "[unknown]".into()),
            runtime_implementation: "rust".into(),
            runtime_version: env!("CARGO_PKG_RUST_VERSION").into(),
        }
    }

    fn detect_gpus() -> String {
        let output = match std::process::Command::new("nvidia-smi")
            .args([
                "--query-gpu=name,memory.total,driver_version",
                "--format=csv,noheader",
            ])
            .output()
        {
            Ok(output) if output.status.success() => output,
            _ => return "[none]".into(),
        };

        let gpus = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let fields = line.split(',').map(str::trim).collect::<Vec<_>>();
                match fields.as_slice() {
                    [name, memory, driver] => format!("{name} ({memory}, driver={driver})"),
                    _ => line.trim().to_string(),
                }
            })
            .collect::<Vec<_>>();

        if gpus.is_empty() {
            "[none]".into()
        } else {
            gpus.join("; ")
        }
    }

    /// Canonical JSON with sorted keys.
    pub fn to_json(&self) -> String {
        let value = serde_json::to_value(self).expect("platform fields are always serializable");
        value.to_string()
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_is_cached_and_round_trips() {
        let platform = Platform::current();
        assert_eq!(platform, Platform::current());

        let parsed = Platform::from_json(&platform.to_json()).unwrap();
        assert_eq!(&parsed, platform);
    }

    #[test]
    fn topology_fields_are_plausible() {
        let platform = Platform::current();
        assert!(platform.cpu_logical >= 1);
        assert!(platform.cpu_physical >= 1);
        assert!(platform.cpu_logical >= platform.cpu_physical);
        assert!(!platform.gpu_info.is_empty());
    }

    #[test]
    fn canonical_json_keys_are_sorted() {
        let json = Platform::current().to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
