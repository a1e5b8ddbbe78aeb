// src/mass.rs
//
// =============================================================================
// GRAVITATION: POINT MASS
// =============================================================================
//
// The smallest unit of state. Owned and mutated exclusively by the
// Universe; kernels see masses only through the stage hooks.

use serde::{Deserialize, Serialize};

use crate::errors::UniverseError;

/// Number of spatial dimensions. Fixed; the wire and disk formats bake it in.
pub const DIMS: usize = 3;

/// A single point mass: position, velocity, acceleration accumulator.
/// Units are SI scaled by the owning universe's scale factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mass {
    name: String,
    r: [f64; DIMS],
    v: [f64; DIMS],
    a: [f64; DIMS],
    m: f64,
}

impl Mass {
    pub fn new(name: impl Into<String>, r: [f64; DIMS], v: [f64; DIMS], m: f64) -> Self {
        Self {
            name: name.into(),
            r,
            v,
            a: [0.0; DIMS],
            m,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position (scaled metres).
    pub fn r(&self) -> &[f64; DIMS] {
        &self.r
    }

    /// Velocity (scaled metres per second).
    pub fn v(&self) -> &[f64; DIMS] {
        &self.v
    }

    /// Acceleration accumulator, cleared at the end of every stage 2.
    pub fn a(&self) -> &[f64; DIMS] {
        &self.a
    }

    pub fn m(&self) -> f64 {
        self.m
    }

    pub fn r_mut(&mut self) -> &mut [f64; DIMS] {
        &mut self.r
    }

    pub fn v_mut(&mut self) -> &mut [f64; DIMS] {
        &mut self.v
    }

    pub fn a_mut(&mut self) -> &mut [f64; DIMS] {
        &mut self.a
    }

    /// Base stage 2: Euler half-kick then drift, acceleration cleared.
    /// v <- v + a*dt, r <- r + v*dt, a <- 0.
    pub fn advance(&mut self, dt: f64) {
        for dim in 0..DIMS {
            self.v[dim] += self.a[dim] * dt;
            self.r[dim] += self.v[dim] * dt;
            self.a[dim] = 0.0;
        }
    }

    /// Rejects NaN and infinity in any component.
    pub fn assert_finite(&self) -> Result<(), UniverseError> {
        let finite = self.r.iter().all(|d| d.is_finite())
            && self.v.iter().all(|d| d.is_finite())
            && self.a.iter().all(|d| d.is_finite())
            && self.m.is_finite();
        if !finite {
            return Err(UniverseError::NotFinite(self.name.clone()));
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn advance_kicks_then_drifts() {
        let mut mass = Mass::new("probe", [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], 2.0);
        mass.a_mut()[0] = -0.5;

        mass.advance(2.0);

        // v' = v + a*dt first, then r' = r + v'*dt
        assert_relative_eq!(mass.v()[0], -1.0);
        assert_relative_eq!(mass.r()[0], -1.0);
        assert_relative_eq!(mass.r()[1], 2.0);
        assert_eq!(mass.a(), &[0.0; DIMS]);
    }

    #[test]
    fn finite_check_catches_nan() {
        let mut mass = Mass::new("probe", [0.0; DIMS], [0.0; DIMS], 1.0);
        assert!(mass.assert_finite().is_ok());

        mass.r_mut()[2] = f64::NAN;
        assert!(mass.assert_finite().is_err());
    }
}
