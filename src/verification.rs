// src/verification.rs
//
// =============================================================================
// GRAVITATION: RESULT VERIFICATION
// =============================================================================
//
// Pairs snapshots at identical (length, iteration) between a reference
// kernel and every other (kernel, variation, platform) present in the
// archive, and reports the per-body Euclidean position error. No
// tolerance is enforced: the point is the error distribution, not an
// equality assertion.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::archive::{GroupKey, SnapshotArchive};
use crate::errors::VerificationError;
use crate::platform::Platform;
use crate::universe::{Universe, ZeroKernel};
use crate::variation::Variation;

/// Error distribution of one target against the reference: per length,
/// one distance per body.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub name: String,
    pub dists: BTreeMap<u64, Vec<f64>>,
}

pub struct Verification {
    archive: SnapshotArchive,
    snapshots: Vec<GroupKey>,
}

impl Verification {
    /// Opens an archive for verification and scans its group keys.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VerificationError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VerificationError::NotOpen(format!("{path:?}")));
        }
        let archive = SnapshotArchive::open(path)?;
        let snapshots = archive.groups()?;
        Ok(Self { archive, snapshots })
    }

    /// Compares every non-reference (kernel, variation, platform)
    /// against the reference at `iteration`, across all lengths in the
    /// archive. Missing pairs are logged and skipped.
    pub fn verify(
        &self,
        kernel: &str,
        iteration: u64,
        variation: &Variation,
        platform: &Platform,
    ) -> Result<Vec<VerifyResult>, VerificationError> {
        // shared zero states are inputs, not results
        let runs: Vec<&GroupKey> = self
            .snapshots
            .iter()
            .filter(|key| key.kernel != "zero")
            .collect();

        if !runs.iter().any(|key| key.kernel == kernel) {
            return Err(VerificationError::MissingReference(kernel.into()));
        }

        let mut lengths: Vec<u64> = runs.iter().map(|key| key.length).collect();
        lengths.sort_unstable();
        lengths.dedup();

        let mut target_kernels: Vec<&str> = runs.iter().map(|key| key.kernel.as_str()).collect();
        target_kernels.sort_unstable();
        target_kernels.dedup();

        let mut target_platforms: Vec<&Platform> = Vec::new();
        for key in &runs {
            if let Some(candidate) = key.platform.as_ref() {
                if !target_platforms.contains(&candidate) {
                    target_platforms.push(candidate);
                }
            }
        }

        let mut results = Vec::new();

        for target_kernel in &target_kernels {
            let mut target_variations: Vec<&Variation> = Vec::new();
            for key in &runs {
                if key.kernel != *target_kernel {
                    continue;
                }
                if let Some(candidate) = key.variation.as_ref() {
                    if !target_variations.contains(&candidate) {
                        target_variations.push(candidate);
                    }
                }
            }

            for target_variation in &target_variations {
                for target_platform in &target_platforms {
                    let is_reference = *target_kernel == kernel
                        && *target_variation == variation
                        && *target_platform == platform;
                    if is_reference {
                        continue;
                    }

                    let name = format!("{target_kernel} {target_variation}");
                    let mut dists: BTreeMap<u64, Vec<f64>> = BTreeMap::new();

                    for &length in &lengths {
                        let reference_key = GroupKey::new(
                            kernel,
                            length,
                            iteration,
                            variation.clone(),
                            platform.clone(),
                        );
                        let target_key = GroupKey::new(
                            *target_kernel,
                            length,
                            iteration,
                            (*target_variation).clone(),
                            (*target_platform).clone(),
                        );

                        if !self.snapshots.contains(&reference_key)
                            || !self.snapshots.contains(&target_key)
                        {
                            log::warn!(
                                "Data missing for {} at length={} iteration={}",
                                name,
                                length,
                                iteration
                            );
                            continue;
                        }

                        let dist = self.verify_pair(&reference_key, &target_key)?;
                        log::info!(
                            "Matching {}: length={} iteration={} min={:.2e} max={:.2e}",
                            name,
                            length,
                            iteration,
                            dist.iter().copied().fold(f64::INFINITY, f64::min),
                            dist.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                        );
                        dists.insert(length, dist);
                    }

                    results.push(VerifyResult { name, dists });
                }
            }
        }

        Ok(results)
    }

    /// Per-body Euclidean position distance between two snapshots.
    fn verify_pair(
        &self,
        reference: &GroupKey,
        target: &GroupKey,
    ) -> Result<Vec<f64>, VerificationError> {
        let reference = Universe::load(Box::new(ZeroKernel), &self.archive, reference, None)?;
        let target = Universe::load(Box::new(ZeroKernel), &self.archive, target, None)?;

        Ok(reference
            .masses()
            .iter()
            .zip(target.masses())
            .map(|(a, b)| {
                a.r()
                    .iter()
                    .zip(b.r())
                    .map(|(ar, br)| (ar - br) * (ar - br))
                    .sum::<f64>()
                    .sqrt()
            })
            .collect())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mass::DIMS;
    use crate::universe::{Kernel, UniverseSettings};
    use crate::variation::{Dtype, Target, Threads};
    use crate::errors::UniverseError;
    use crate::mass::Mass;

    struct CoastKernel;

    impl Kernel for CoastKernel {
        fn iterate_stage1(&mut self, _masses: &mut [Mass], _g: f64) -> Result<(), UniverseError> {
            Ok(())
        }
    }

    fn store_universe(
        archive: &SnapshotArchive,
        kernel: &str,
        variation: Variation,
        offset: f64,
    ) {
        let mut universe = Universe::new(
            Box::new(CoastKernel),
            variation,
            UniverseSettings::default(),
        );
        universe
            .create_mass("back hole", [0.0; DIMS], [0.0; DIMS], 10.0, false)
            .unwrap();
        universe
            .create_mass("disk star", [1.0 + offset, 2.0, 3.0], [0.0; DIMS], 1.0, false)
            .unwrap();
        universe
            .save(archive, &universe.group_key(kernel))
            .unwrap();
    }

    #[test]
    fn per_body_distances_against_the_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let archive = SnapshotArchive::open(&path).unwrap();

        let reference_variation = Variation::default();
        let target_variation = Variation::new(Dtype::Float32, Target::Cpu, Threads::Single);

        store_universe(&archive, "naive", reference_variation.clone(), 0.0);
        store_universe(&archive, "naive", target_variation, 0.5);

        let verification = Verification::open(&path).unwrap();
        let results = verification
            .verify("naive", 0, &reference_variation, Platform::current())
            .unwrap();

        assert_eq!(results.len(), 1);
        let dists = results[0].dists.get(&2).unwrap();
        assert_eq!(dists.len(), 2);
        assert!(dists[0].abs() < 1e-12);
        assert!((dists[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn zero_states_are_ignored_and_reference_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let archive = SnapshotArchive::open(&path).unwrap();

        let mut universe = Universe::new(
            Box::new(CoastKernel),
            Variation::default(),
            UniverseSettings::default(),
        );
        universe
            .create_mass("back hole", [0.0; DIMS], [0.0; DIMS], 1.0, false)
            .unwrap();
        universe.save(&archive, &GroupKey::zero(1)).unwrap();

        let verification = Verification::open(&path).unwrap();
        let err = verification
            .verify("naive", 0, &Variation::default(), Platform::current())
            .unwrap_err();
        assert!(matches!(err, VerificationError::MissingReference(_)));
    }

    #[test]
    fn missing_archive_refuses_to_open() {
        assert!(matches!(
            Verification::open("/nonexistent/archive.db"),
            Err(VerificationError::NotOpen(_))
        ));
    }
}
