// src/kernels/naive.rs
//
// =============================================================================
// GRAVITATION: NAIVE REFERENCE KERNEL
// =============================================================================
//
// Plain O(N^2) pairwise gravity, single-threaded. The reference every
// other kernel is verified against.
//
// float64 operates on the mass list in place. float32 keeps a private
// packed layout: positions and masses are published in `push_stage1`,
// accelerations are accumulated in f32 and synced back in
// `pull_stage1`, so the computation really happens at the selected
// precision, not just the snapshots.

use crate::errors::UniverseError;
use crate::mass::{Mass, DIMS};
use crate::registry::{KernelFactory, KernelMeta};
use crate::universe::Kernel;
use crate::variation::{Dtype, Target, Threads, Variation, Variations};

pub fn meta() -> KernelMeta {
    KernelMeta {
        description: "pure rust backend, reference kernel".into(),
        requirements: vec![],
        variations: Variations::new([
            Variation::new(Dtype::Float64, Target::Cpu, Threads::Single),
            Variation::new(Dtype::Float32, Target::Cpu, Threads::Single),
        ]),
    }
}

pub fn factory() -> KernelFactory {
    |variation| Box::new(NaiveKernel::new(variation.dtype()))
}

pub struct NaiveKernel {
    dtype: Dtype,
    // f32 layout, unused for float64
    r32: Vec<[f32; DIMS]>,
    m32: Vec<f32>,
    a32: Vec<[f32; DIMS]>,
}

impl NaiveKernel {
    pub fn new(dtype: Dtype) -> Self {
        Self {
            dtype,
            r32: Vec::new(),
            m32: Vec::new(),
            a32: Vec::new(),
        }
    }

    fn stage1_f64(masses: &mut [Mass], g: f64) {
        for i in 0..masses.len() {
            for j in (i + 1)..masses.len() {
                let (head, tail) = masses.split_at_mut(j);
                let first = &mut head[i];
                let second = &mut tail[0];

                let mut relative = [0.0f64; DIMS];
                let mut distance_sq = 0.0f64;
                for dim in 0..DIMS {
                    relative[dim] = first.r()[dim] - second.r()[dim];
                    distance_sq += relative[dim] * relative[dim];
                }
                let distance = distance_sq.sqrt();

                let a1 = g * second.m() / distance_sq;
                let a2 = g * first.m() / distance_sq;

                for dim in 0..DIMS {
                    let unit = relative[dim] / distance;
                    first.a_mut()[dim] -= unit * a1;
                    second.a_mut()[dim] += unit * a2;
                }
            }
        }
    }

    fn stage1_f32(&mut self, g: f32) {
        let count = self.r32.len();
        for i in 0..count {
            for j in (i + 1)..count {
                let mut relative = [0.0f32; DIMS];
                let mut distance_sq = 0.0f32;
                for dim in 0..DIMS {
                    relative[dim] = self.r32[i][dim] - self.r32[j][dim];
                    distance_sq += relative[dim] * relative[dim];
                }
                let distance = distance_sq.sqrt();

                let a1 = g * self.m32[j] / distance_sq;
                let a2 = g * self.m32[i] / distance_sq;

                for dim in 0..DIMS {
                    let unit = relative[dim] / distance;
                    self.a32[i][dim] -= unit * a1;
                    self.a32[j][dim] += unit * a2;
                }
            }
        }
    }
}

impl Kernel for NaiveKernel {
    fn start(&mut self, masses: &[Mass]) -> Result<(), UniverseError> {
        if self.dtype == Dtype::Float32 {
            self.r32 = vec![[0.0; DIMS]; masses.len()];
            self.a32 = vec![[0.0; DIMS]; masses.len()];
            self.m32 = masses.iter().map(|m| m.m() as f32).collect();
        }
        Ok(())
    }

    fn push_stage1(&mut self, masses: &[Mass]) {
        if self.dtype == Dtype::Float32 {
            for (slot, mass) in self.r32.iter_mut().zip(masses) {
                for dim in 0..DIMS {
                    slot[dim] = mass.r()[dim] as f32;
                }
            }
        }
    }

    fn iterate_stage1(&mut self, masses: &mut [Mass], g: f64) -> Result<(), UniverseError> {
        match self.dtype {
            Dtype::Float64 => Self::stage1_f64(masses, g),
            Dtype::Float32 => self.stage1_f32(g as f32),
        }
        Ok(())
    }

    fn pull_stage1(&mut self, masses: &mut [Mass]) {
        if self.dtype == Dtype::Float32 {
            for (slot, mass) in self.a32.iter_mut().zip(masses) {
                for dim in 0..DIMS {
                    mass.a_mut()[dim] = slot[dim] as f64;
                    slot[dim] = 0.0;
                }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pair() -> Vec<Mass> {
        vec![
            Mass::new("a", [0.0; DIMS], [0.0; DIMS], 2.0),
            Mass::new("b", [3.0, 4.0, 0.0], [0.0; DIMS], 8.0),
        ]
    }

    #[test]
    fn two_body_accelerations_have_newton_magnitudes() {
        let mut masses = pair();
        let g = 1.0;
        NaiveKernel::stage1_f64(&mut masses, g);

        // |r| = 5, so |a1| = G*m2/25, |a2| = G*m1/25
        let a1 = masses[0].a();
        let norm1 = (a1[0] * a1[0] + a1[1] * a1[1] + a1[2] * a1[2]).sqrt();
        assert_relative_eq!(norm1, 8.0 / 25.0, epsilon = 1e-12);

        let a2 = masses[1].a();
        let norm2 = (a2[0] * a2[0] + a2[1] * a2[1] + a2[2] * a2[2]).sqrt();
        assert_relative_eq!(norm2, 2.0 / 25.0, epsilon = 1e-12);

        // opposite directions, toward each other
        assert!(a1[0] > 0.0 && a2[0] < 0.0);
        assert_relative_eq!(a1[0] * 2.0, -a2[0] * 8.0, epsilon = 1e-12);
    }

    #[test]
    fn f32_layout_matches_f64_coarsely() {
        let mut reference = pair();
        NaiveKernel::stage1_f64(&mut reference, 1.0);

        let mut kernel = NaiveKernel::new(Dtype::Float32);
        let mut masses = pair();
        kernel.start(&masses).unwrap();
        kernel.push_stage1(&masses);
        kernel.iterate_stage1(&mut masses, 1.0).unwrap();
        kernel.pull_stage1(&mut masses);

        for (lo, hi) in masses.iter().zip(&reference) {
            for dim in 0..DIMS {
                assert_relative_eq!(lo.a()[dim], hi.a()[dim], epsilon = 1e-6);
            }
        }

        // scratch accumulator is cleared for the next iteration
        assert!(kernel.a32.iter().flatten().all(|&a| a == 0.0));
    }
}
