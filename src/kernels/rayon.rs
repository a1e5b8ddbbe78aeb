// src/kernels/rayon.rs
//
// =============================================================================
// GRAVITATION: RAYON DATA-PARALLEL KERNEL
// =============================================================================
//
// O(N^2) gravity, parallelized over bodies with a dedicated rayon
// thread pool sized by the variation's threads mode. Each body sums
// the pull of every other body independently, so there is no pairwise
// write sharing to synchronize.
//
// The kernel keeps a packed read-only copy of positions and masses
// (published in `push_stage1`) and a parallel-written acceleration
// buffer synced back in `pull_stage1`.

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::errors::UniverseError;
use crate::mass::{Mass, DIMS};
use crate::registry::{KernelFactory, KernelMeta};
use crate::universe::Kernel;
use crate::variation::{Dtype, Target, Threads, Variation, Variations};

pub fn meta() -> KernelMeta {
    let variations = Variations::new(
        Threads::enumerate()
            .into_iter()
            .map(|threads| Variation::new(Dtype::Float64, Target::Cpu, threads)),
    );
    KernelMeta {
        description: "rayon backend, data-parallel across os threads".into(),
        requirements: vec!["rayon".into()],
        variations,
    }
}

pub fn factory() -> KernelFactory {
    |variation| Box::new(RayonKernel::new(variation.threads()))
}

pub struct RayonKernel {
    threads: Threads,
    pool: Option<ThreadPool>,
    r: Vec<[f64; DIMS]>,
    m: Vec<f64>,
    a: Vec<[f64; DIMS]>,
}

impl RayonKernel {
    pub fn new(threads: Threads) -> Self {
        Self {
            threads,
            pool: None,
            r: Vec::new(),
            m: Vec::new(),
            a: Vec::new(),
        }
    }
}

impl Kernel for RayonKernel {
    fn start(&mut self, masses: &[Mass]) -> Result<(), UniverseError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads.count())
            .build()
            .map_err(|e| UniverseError::Kernel(e.to_string()))?;
        self.pool = Some(pool);
        self.r = vec![[0.0; DIMS]; masses.len()];
        self.a = vec![[0.0; DIMS]; masses.len()];
        self.m = masses.iter().map(|m| m.m()).collect();
        Ok(())
    }

    fn push_stage1(&mut self, masses: &[Mass]) {
        for (slot, mass) in self.r.iter_mut().zip(masses) {
            slot.copy_from_slice(mass.r());
        }
    }

    fn iterate_stage1(&mut self, _masses: &mut [Mass], g: f64) -> Result<(), UniverseError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| UniverseError::Kernel("thread pool not started".into()))?;

        let positions = &self.r;
        let m = &self.m;
        let accelerations = &mut self.a;

        pool.install(|| {
            accelerations
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, acceleration)| {
                    let own = positions[i];
                    let mut total = [0.0f64; DIMS];
                    for (j, other) in positions.iter().enumerate() {
                        if i == j {
                            continue;
                        }
                        let mut relative = [0.0f64; DIMS];
                        let mut distance_sq = 0.0f64;
                        for dim in 0..DIMS {
                            relative[dim] = own[dim] - other[dim];
                            distance_sq += relative[dim] * relative[dim];
                        }
                        let distance = distance_sq.sqrt();
                        let pull = g * m[j] / distance_sq;
                        for dim in 0..DIMS {
                            total[dim] -= relative[dim] / distance * pull;
                        }
                    }
                    *acceleration = total;
                });
        });

        Ok(())
    }

    fn pull_stage1(&mut self, masses: &mut [Mass]) {
        for (slot, mass) in self.a.iter().zip(masses) {
            mass.a_mut().copy_from_slice(slot);
        }
    }

    fn stop(&mut self) {
        self.pool = None;
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::naive::NaiveKernel;
    use approx::assert_relative_eq;

    fn cluster() -> Vec<Mass> {
        vec![
            Mass::new("a", [0.0, 0.0, 0.0], [0.0; DIMS], 5.0),
            Mass::new("b", [1.0, 2.0, -1.0], [0.0; DIMS], 3.0),
            Mass::new("c", [-2.0, 0.5, 4.0], [0.0; DIMS], 7.0),
            Mass::new("d", [3.0, -3.0, 1.5], [0.0; DIMS], 1.0),
        ]
    }

    fn run_kernel(kernel: &mut dyn Kernel, masses: &mut Vec<Mass>, g: f64) {
        kernel.start(masses).unwrap();
        kernel.push_stage1(masses);
        kernel.iterate_stage1(masses, g).unwrap();
        kernel.pull_stage1(masses);
    }

    #[test]
    fn agrees_with_the_reference_kernel() {
        let g = 0.5;

        let mut reference = cluster();
        let mut naive = NaiveKernel::new(Dtype::Float64);
        run_kernel(&mut naive, &mut reference, g);

        for threads in [Threads::Single, Threads::Count(2)] {
            let mut masses = cluster();
            let mut kernel = RayonKernel::new(threads);
            run_kernel(&mut kernel, &mut masses, g);

            for (parallel, serial) in masses.iter().zip(&reference) {
                for dim in 0..DIMS {
                    assert_relative_eq!(
                        parallel.a()[dim],
                        serial.a()[dim],
                        epsilon = 1e-9,
                        max_relative = 1e-9
                    );
                }
            }
        }
    }

    #[test]
    fn iterate_before_start_is_an_error() {
        let mut kernel = RayonKernel::new(Threads::Single);
        let mut masses = cluster();
        assert!(kernel.iterate_stage1(&mut masses, 1.0).is_err());
    }
}
