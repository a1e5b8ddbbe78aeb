// src/universe.rs
//
// =============================================================================
// GRAVITATION: UNIVERSE
// =============================================================================
//
// The simulation model: an ordered collection of point masses plus the
// physical and integration constants, driven through a strict state
// machine (preinit -> started -> stopped).
//
// Kernels plug in through the `Kernel` trait. Only stage 1 (the
// acceleration computation) is required; the push/pull hooks let a
// kernel keep a private data layout and sync it with the mass list
// around the stages. Stage 2 is a plain forward Euler kick/drift and
// stage 3 advances time and the iteration counter. The benchmark
// measures kernel speed, not integrator quality.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::archive::{GroupKey, Snapshot, SnapshotArchive, SnapshotAttrs};
use crate::errors::{StorageError, UniverseError};
use crate::mass::{Mass, DIMS};
use crate::platform::Platform;
use crate::variation::Variation;

/// Unscaled gravitational constant [m^3 / (kg s^2)].
pub const G_SI: f64 = 6.6740831e-11;

// ============================================================================
// 1. KERNEL CONTRACT
// ============================================================================

/// A concrete implementation of the N-body acceleration computation.
///
/// `iterate_stage1` must fill the acceleration accumulator of every
/// mass (directly or via a private layout synced back in
/// `pull_stage1`). Everything else has a default no-op implementation.
/// Any suspension, synchronization or device transfer must complete
/// before a hook returns.
pub trait Kernel: Send {
    /// Called once when the simulation starts.
    fn start(&mut self, masses: &[Mass]) -> Result<(), UniverseError> {
        let _ = masses;
        Ok(())
    }

    /// Publish current positions into a kernel-private layout.
    fn push_stage1(&mut self, masses: &[Mass]) {
        let _ = masses;
    }

    /// Compute per-body accelerations. The only required method.
    fn iterate_stage1(&mut self, masses: &mut [Mass], g: f64) -> Result<(), UniverseError>;

    /// Sync a kernel-private layout back to the mass list after stage 1.
    fn pull_stage1(&mut self, masses: &mut [Mass]) {
        let _ = masses;
    }

    /// Sync a kernel-private layout back to the mass list after stage 2.
    fn pull_stage2(&mut self, masses: &mut [Mass]) {
        let _ = masses;
    }

    /// Reclaim kernel-internal scratch outside the timed region.
    fn collect(&mut self) {}

    /// Called once when the simulation stops.
    fn stop(&mut self) {}
}

/// Kernel for universes that are serialized but never iterated: the
/// driver's shared initial states and the verifier's snapshot loads.
pub struct ZeroKernel;

impl Kernel for ZeroKernel {
    fn iterate_stage1(&mut self, _masses: &mut [Mass], _g: f64) -> Result<(), UniverseError> {
        Err(UniverseError::NotIterable("zero".into()))
    }
}

// ============================================================================
// 2. SETTINGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UniverseState {
    Preinit,
    Started,
    Stopped,
}

/// Physical and integration constants. `g` is the unscaled constant;
/// the universe pre-scales it with `scale_r^3 / scale_m` on
/// construction (snapshot reload passes the stored value verbatim).
#[derive(Debug, Clone, Copy)]
pub struct UniverseSettings {
    pub t: f64,
    pub t_step: f64,
    pub g: f64,
    pub scale_m: f64,
    pub scale_r: f64,
}

impl Default for UniverseSettings {
    fn default() -> Self {
        Self {
            t: 0.0,
            t_step: 1.0e3,
            g: G_SI,
            scale_m: 1.0,
            scale_r: 1.0,
        }
    }
}

/// Parameters of the galaxy initializer. The defaults reproduce the
/// historical benchmark configuration.
#[derive(Debug, Clone)]
pub struct GalaxyParams {
    pub length: usize,
    pub t_step: f64,
    pub scale_m: f64,
    pub scale_r: f64,
    /// Centre of the galaxy (unscaled metres).
    pub r: [f64; DIMS],
    /// Bulk velocity of the galaxy (unscaled metres per second).
    pub v: [f64; DIMS],
    /// Rotation of the galactic plane about the z axis.
    pub g_alpha: f64,
    /// Rotation of the galactic plane about the x axis.
    pub g_beta: f64,
    /// Mass of the central black hole (kg).
    pub m_hole: f64,
    /// Catalogue mean star mass (kg); jittered log-normally per star.
    pub m_star: f64,
    /// Characteristic radius (m).
    pub radius: f64,
}

impl Default for GalaxyParams {
    fn default() -> Self {
        Self {
            length: 2000,
            t_step: 2.0e12,
            scale_m: 1.0e-30,
            scale_r: 1.0e-10,
            r: [0.0; DIMS],
            v: [0.0; DIMS],
            g_alpha: 0.0,
            g_beta: 0.0,
            m_hole: 4.0e40,
            m_star: 2.0e30,
            radius: 1.0e20,
        }
    }
}

impl GalaxyParams {
    pub fn with_length(length: usize) -> Self {
        Self {
            length,
            ..Self::default()
        }
    }
}

// ============================================================================
// 3. UNIVERSE
// ============================================================================

pub struct Universe {
    masses: Vec<Mass>,
    t: f64,
    t_step: f64,
    g: f64,
    scale_m: f64,
    scale_r: f64,
    state: UniverseState,
    variation: Variation,
    platform: Platform,
    iteration: u64,
    meta: BTreeMap<String, serde_json::Value>,
    kernel: Box<dyn Kernel>,
}

impl Universe {
    /// Creates an empty universe in preinit state. `settings.g` is
    /// taken unscaled and pre-scaled here.
    pub fn new(kernel: Box<dyn Kernel>, variation: Variation, settings: UniverseSettings) -> Self {
        assert!(settings.t_step > 0.0);
        assert!(settings.g > 0.0);
        assert!(settings.scale_m > 0.0);
        assert!(settings.scale_r > 0.0);

        let g = settings.g * settings.scale_r.powi(3) / settings.scale_m;
        Self::with_scaled_g(kernel, variation, UniverseSettings { g, ..settings })
    }

    /// Like [`Universe::new`] but `settings.g` is stored verbatim.
    /// Used by snapshot reload, where the stored constant is already
    /// scaled.
    pub fn with_scaled_g(
        kernel: Box<dyn Kernel>,
        variation: Variation,
        settings: UniverseSettings,
    ) -> Self {
        Self {
            masses: Vec::new(),
            t: settings.t,
            t_step: settings.t_step,
            g: settings.g,
            scale_m: settings.scale_m,
            scale_r: settings.scale_r,
            state: UniverseState::Preinit,
            variation,
            platform: Platform::current().clone(),
            iteration: 0,
            meta: BTreeMap::new(),
            kernel,
        }
    }

    // --- accessors ---

    pub fn masses(&self) -> &[Mass] {
        &self.masses
    }

    pub fn len(&self) -> usize {
        self.masses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masses.is_empty()
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn t_step(&self) -> f64 {
        self.t_step
    }

    /// Pre-scaled gravitational constant.
    pub fn g(&self) -> f64 {
        self.g
    }

    pub fn scale_m(&self) -> f64 {
        self.scale_m
    }

    pub fn scale_r(&self) -> f64 {
        self.scale_r
    }

    pub fn state(&self) -> UniverseState {
        self.state
    }

    pub fn variation(&self) -> &Variation {
        &self.variation
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn meta(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut BTreeMap<String, serde_json::Value> {
        &mut self.meta
    }

    // --- lifecycle ---

    /// Creates a point mass and adds it. Only allowed in preinit.
    /// With `scaled = false` the caller's physical units are scaled
    /// before storage; `scaled = true` stores verbatim (snapshot
    /// reload).
    pub fn create_mass(
        &mut self,
        name: impl Into<String>,
        mut r: [f64; DIMS],
        mut v: [f64; DIMS],
        mut m: f64,
        scaled: bool,
    ) -> Result<(), UniverseError> {
        match self.state {
            UniverseState::Preinit => {}
            UniverseState::Started => return Err(UniverseError::MassAfterStart),
            UniverseState::Stopped => return Err(UniverseError::Stopped),
        }

        if !scaled {
            for dim in 0..DIMS {
                r[dim] *= self.scale_r;
                v[dim] *= self.scale_r;
            }
            m *= self.scale_m;
        }

        self.masses.push(Mass::new(name, r, v, m));
        Ok(())
    }

    /// Shuffles the mass list so index order carries no physical
    /// meaning.
    pub fn shuffle(&mut self) {
        self.masses.shuffle(&mut rand::thread_rng());
    }

    /// Transitions preinit -> started and initializes the kernel.
    pub fn start(&mut self) -> Result<(), UniverseError> {
        match self.state {
            UniverseState::Preinit => {}
            UniverseState::Started => return Err(UniverseError::AlreadyStarted),
            UniverseState::Stopped => return Err(UniverseError::Stopped),
        }
        self.state = UniverseState::Started;
        self.kernel.start(&self.masses)
    }

    /// Transitions started -> stopped and tears the kernel down.
    pub fn stop(&mut self) -> Result<(), UniverseError> {
        match self.state {
            UniverseState::Preinit => return Err(UniverseError::NotStarted),
            UniverseState::Started => {}
            UniverseState::Stopped => return Err(UniverseError::Stopped),
        }
        self.state = UniverseState::Stopped;
        self.kernel.stop();
        Ok(())
    }

    // --- stages ---

    /// Stage 1 publish hook, exposed so the worker can keep it outside
    /// the timed region.
    pub fn push_stage1(&mut self) {
        self.kernel.push_stage1(&self.masses);
    }

    /// Raw stage 1: per-body accelerations. The worker times exactly
    /// this call; the caller is responsible for having started the
    /// simulation and pushed the current positions.
    pub fn iterate_stage1(&mut self) -> Result<(), UniverseError> {
        self.kernel.iterate_stage1(&mut self.masses, self.g)
    }

    /// Kernel-internal scratch reclamation, outside the timed region.
    pub fn collect(&mut self) {
        self.kernel.collect();
    }

    /// One full simulation step (stages 1 through 3).
    pub fn iterate(&mut self) -> Result<(), UniverseError> {
        self.iterate_with(true)
    }

    /// One simulation step, optionally without stage 1 (the worker
    /// runs stage 1 itself, inside its timers).
    pub fn iterate_with(&mut self, stage1: bool) -> Result<(), UniverseError> {
        match self.state {
            UniverseState::Preinit => return Err(UniverseError::NotStarted),
            UniverseState::Started => {}
            UniverseState::Stopped => return Err(UniverseError::Stopped),
        }

        if stage1 {
            self.push_stage1();
            self.iterate_stage1()?;
        }

        self.kernel.pull_stage1(&mut self.masses);

        // stage 2: v += a*T, r += v*T, a = 0
        for mass in &mut self.masses {
            mass.advance(self.t_step);
        }
        self.kernel.pull_stage2(&mut self.masses);

        // stage 3: advance time, count the iteration, reject NaN/Inf
        self.t += self.t_step;
        self.iteration += 1;
        for mass in &self.masses {
            mass.assert_finite()?;
        }

        Ok(())
    }

    // --- snapshots ---

    /// The group key of this universe's current state under `kernel`.
    pub fn group_key(&self, kernel: &str) -> GroupKey {
        GroupKey::new(
            kernel,
            self.len() as u64,
            self.iteration,
            self.variation.clone(),
            self.platform.clone(),
        )
    }

    /// Serializes the current state into the archive under `key`.
    pub fn save(&self, archive: &SnapshotArchive, key: &GroupKey) -> Result<(), StorageError> {
        let snapshot = Snapshot {
            dtype: self.variation.dtype(),
            names: self.masses.iter().map(|m| m.name().to_string()).collect(),
            r: self.masses.iter().map(|m| *m.r()).collect(),
            v: self.masses.iter().map(|m| *m.v()).collect(),
            m: self.masses.iter().map(|m| m.m()).collect(),
            attrs: SnapshotAttrs {
                scale_m: self.scale_m,
                scale_r: self.scale_r,
                t: self.t,
                t_step: self.t_step,
                g: self.g,
                variation: self.variation.to_json(),
                platform: self.platform.to_json(),
                iteration: self.iteration,
                meta: self.meta.clone(),
            },
        };
        archive.write(key, &snapshot)
    }

    /// Rebuilds a universe from a stored snapshot. The stored
    /// variation is used unless `variation` overrides it (a worker
    /// loading the shared zero state substitutes its own).
    pub fn load(
        kernel: Box<dyn Kernel>,
        archive: &SnapshotArchive,
        key: &GroupKey,
        variation: Option<Variation>,
    ) -> Result<Self, StorageError> {
        let snapshot = archive.read(key)?;
        let attrs = &snapshot.attrs;

        let variation = match variation {
            Some(variation) => variation,
            None => Variation::from_json(&attrs.variation).map_err(|_| {
                StorageError::MalformedGroup(format!("unreadable variation in {key}"))
            })?,
        };

        let mut universe = Self::with_scaled_g(
            kernel,
            variation,
            UniverseSettings {
                t: attrs.t,
                t_step: attrs.t_step,
                g: attrs.g,
                scale_m: attrs.scale_m,
                scale_r: attrs.scale_r,
            },
        );
        universe.iteration = attrs.iteration;
        universe.meta = attrs.meta.clone();
        universe.platform = Platform::from_json(&attrs.platform).map_err(|_| {
            StorageError::MalformedGroup(format!("unreadable platform in {key}"))
        })?;

        for index in 0..snapshot.len() {
            universe
                .create_mass(
                    snapshot.names[index].clone(),
                    snapshot.r[index],
                    snapshot.v[index],
                    snapshot.m[index],
                    true,
                )
                .expect("fresh universe is in preinit");
        }

        Ok(universe)
    }

    // --- galaxy initializer ---

    /// Creates a galaxy-like configuration: one heavy central black
    /// hole, a wedge-shaped disk of stars (80 %) and a spherical
    /// central cloud (20 %), all on circular Keplerian orbits, then
    /// shuffles the mass list.
    pub fn from_galaxy(
        kernel: Box<dyn Kernel>,
        variation: Variation,
        params: GalaxyParams,
    ) -> Result<Self, UniverseError> {
        use std::f64::consts::PI;

        let mut universe = Self::new(
            kernel,
            variation,
            UniverseSettings {
                t: 0.0,
                t_step: params.t_step,
                g: G_SI,
                scale_m: params.scale_m,
                scale_r: params.scale_r,
            },
        );

        // name kept verbatim for snapshot compatibility
        universe.create_mass("back hole", params.r, params.v, params.m_hole, false)?;
        universe
            .masses
            .last()
            .expect("black hole was just added")
            .assert_finite()?;

        let mut rng = rand::thread_rng();
        let log_jitter = Normal::new(0.0, 1.0).expect("unit normal parameters are valid");

        let stars = params.length.saturating_sub(1);
        let disk_stars = stars * 4 / 5;

        for n in 0..stars {
            let alpha: f64 = rng.gen::<f64>() * 2.0 * PI;

            let (mut r_s, name) = if n < disk_stars {
                // disk: wedge-shaped thickness tapering with radius
                let r_abs = (rng.gen::<f64>() * 4.5 + 0.1) * params.radius;
                let rim = (4.5 + 0.1) * params.radius;
                let z = (0.5 * rng.gen::<f64>() - 0.25) * params.radius * (rim - r_abs) / rim;
                (
                    [r_abs * alpha.cos(), r_abs * alpha.sin(), z],
                    "disk star",
                )
            } else {
                // central cloud: random inclination, spherical position
                let r_abs = (rng.gen::<f64>() * 0.75 + 0.1) * params.radius;
                let beta = PI * (rng.gen::<f64>() - 0.5);
                (
                    [
                        r_abs * alpha.cos() * beta.cos(),
                        r_abs * alpha.sin() * beta.cos(),
                        r_abs * beta.sin(),
                    ],
                    "cloud star",
                )
            };

            // circular Keplerian speed around the central body
            let r_norm = r_s.iter().map(|d| d * d).sum::<f64>().sqrt();
            let v_abs = (universe.g() * params.m_hole / r_norm).sqrt();
            let v_alpha = alpha - PI / 2.0;
            let mut v_s = [v_abs * v_alpha.cos(), v_abs * v_alpha.sin(), 0.0];

            // rotate velocity about x (beta), then about z (alpha)
            let vy = v_s[1];
            v_s[1] = vy * params.g_beta.cos();
            v_s[2] = vy * params.g_beta.sin();
            let v_angle = v_s[1].atan2(v_s[0]) + params.g_alpha;
            let v_factor = (v_s[0] * v_s[0] + v_s[1] * v_s[1]).sqrt();
            v_s[0] = v_factor * v_angle.cos();
            v_s[1] = v_factor * v_angle.sin();

            // shift by galaxy bulk velocity
            for dim in 0..DIMS {
                v_s[dim] += params.v[dim];
            }

            // rotate position about x (beta), then about z (alpha)
            let r_beta = r_s[2].atan2(r_s[1]) + params.g_beta;
            let r_factor = (r_s[2] * r_s[2] + r_s[1] * r_s[1]).sqrt();
            r_s[1] = r_factor * r_beta.cos();
            r_s[2] = r_factor * r_beta.sin();
            let r_alpha = r_s[1].atan2(r_s[0]) + params.g_alpha;
            let r_factor = (r_s[0] * r_s[0] + r_s[1] * r_s[1]).sqrt();
            r_s[0] = r_factor * r_alpha.cos();
            r_s[1] = r_factor * r_alpha.sin();

            // shift by galaxy centre
            for dim in 0..DIMS {
                r_s[dim] += params.r[dim];
            }

            // log-normal jitter around the catalogue mean
            let m_star = params.m_star * 10.0_f64.powf(log_jitter.sample(&mut rng));

            universe.create_mass(name, r_s, v_s, m_star, false)?;
            universe
                .masses
                .last()
                .expect("star was just added")
                .assert_finite()?;
        }

        universe.shuffle();

        Ok(universe)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Leaves all accelerations at zero; good enough to drive the
    /// state machine.
    struct CoastKernel;

    impl Kernel for CoastKernel {
        fn iterate_stage1(&mut self, _masses: &mut [Mass], _g: f64) -> Result<(), UniverseError> {
            Ok(())
        }
    }

    /// Poisons the first mass with NaN.
    struct PoisonKernel;

    impl Kernel for PoisonKernel {
        fn iterate_stage1(&mut self, masses: &mut [Mass], _g: f64) -> Result<(), UniverseError> {
            masses[0].a_mut()[0] = f64::NAN;
            Ok(())
        }
    }

    fn two_body_universe(kernel: Box<dyn Kernel>) -> Universe {
        let mut universe = Universe::new(kernel, Variation::default(), UniverseSettings::default());
        universe
            .create_mass("a", [0.0; DIMS], [0.0; DIMS], 1.0, false)
            .unwrap();
        universe
            .create_mass("b", [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], 2.0, false)
            .unwrap();
        universe
    }

    #[test]
    fn state_machine_is_strict() {
        let mut universe = two_body_universe(Box::new(CoastKernel));

        assert!(matches!(
            universe.iterate(),
            Err(UniverseError::NotStarted)
        ));

        universe.start().unwrap();
        assert!(matches!(
            universe.start(),
            Err(UniverseError::AlreadyStarted)
        ));
        assert!(matches!(
            universe.create_mass("late", [0.0; DIMS], [0.0; DIMS], 1.0, false),
            Err(UniverseError::MassAfterStart)
        ));

        universe.stop().unwrap();
        assert!(matches!(universe.stop(), Err(UniverseError::Stopped)));
        assert!(matches!(universe.iterate(), Err(UniverseError::Stopped)));
    }

    #[test]
    fn iterate_advances_time_and_counter() {
        let mut universe = two_body_universe(Box::new(CoastKernel));
        universe.start().unwrap();

        let t_before = universe.t();
        universe.iterate().unwrap();

        assert_eq!(universe.iteration(), 1);
        assert_relative_eq!(universe.t(), t_before + universe.t_step());
        for mass in universe.masses() {
            assert_eq!(mass.a(), &[0.0; DIMS]);
        }
    }

    #[test]
    fn nan_fails_the_iteration() {
        let mut universe = two_body_universe(Box::new(PoisonKernel));
        universe.start().unwrap();
        assert!(matches!(
            universe.iterate(),
            Err(UniverseError::NotFinite(_))
        ));
    }

    #[test]
    fn zero_kernel_refuses_iteration() {
        let mut universe = two_body_universe(Box::new(ZeroKernel));
        universe.start().unwrap();
        assert!(matches!(
            universe.iterate(),
            Err(UniverseError::NotIterable(_))
        ));
    }

    #[test]
    fn galaxy_proportions_and_tags() {
        let universe = Universe::from_galaxy(
            Box::new(ZeroKernel),
            Variation::default(),
            GalaxyParams::with_length(100),
        )
        .unwrap();

        assert_eq!(universe.len(), 100);

        let holes = universe
            .masses()
            .iter()
            .filter(|m| m.name() == "back hole")
            .count();
        let disk = universe
            .masses()
            .iter()
            .filter(|m| m.name() == "disk star")
            .count();
        let cloud = universe
            .masses()
            .iter()
            .filter(|m| m.name() == "cloud star")
            .count();

        assert_eq!(holes, 1);
        assert_eq!(disk, 79);
        assert_eq!(cloud, 20);

        for mass in universe.masses() {
            mass.assert_finite().unwrap();
        }
    }

    #[test]
    fn create_mass_scales_physical_units() {
        let mut universe = Universe::new(
            Box::new(CoastKernel),
            Variation::default(),
            UniverseSettings {
                scale_m: 0.5,
                scale_r: 0.25,
                ..UniverseSettings::default()
            },
        );
        universe
            .create_mass("probe", [4.0, 0.0, 0.0], [8.0, 0.0, 0.0], 2.0, false)
            .unwrap();

        let mass = &universe.masses()[0];
        assert_relative_eq!(mass.r()[0], 1.0);
        assert_relative_eq!(mass.v()[0], 2.0);
        assert_relative_eq!(mass.m(), 1.0);

        // scaled input is stored verbatim
        universe
            .create_mass("verbatim", [4.0, 0.0, 0.0], [8.0, 0.0, 0.0], 2.0, true)
            .unwrap();
        let mass = &universe.masses()[1];
        assert_relative_eq!(mass.r()[0], 4.0);
        assert_relative_eq!(mass.m(), 2.0);
    }

    #[test]
    fn g_is_prescaled_once() {
        let universe = Universe::new(
            Box::new(CoastKernel),
            Variation::default(),
            UniverseSettings {
                g: 2.0,
                scale_m: 4.0,
                scale_r: 2.0,
                ..UniverseSettings::default()
            },
        );
        // g * scale_r^3 / scale_m = 2 * 8 / 4
        assert_relative_eq!(universe.g(), 4.0);
    }
}
