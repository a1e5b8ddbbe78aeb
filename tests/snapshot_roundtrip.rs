// Integration tests for universe snapshot round-trips through the
// archive, across both dtypes.

use gravitation::archive::SnapshotArchive;
use gravitation::registry::Registry;
use gravitation::universe::{GalaxyParams, Universe, ZeroKernel};
use gravitation::variation::{Dtype, Target, Threads, Variation};

fn galaxy(variation: Variation, length: usize) -> Universe {
    let registry = Registry::builtin();
    let descriptor = registry.get("naive").expect("naive kernel registered");
    descriptor.load_meta();
    descriptor.load_cls();
    let kernel = descriptor.create(&variation).expect("kernel constructs");
    Universe::from_galaxy(kernel, variation, GalaxyParams::with_length(length))
        .expect("galaxy builds")
}

#[test]
fn test_f64_round_trip_is_structural_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = SnapshotArchive::open(dir.path().join("data.db")).expect("archive opens");

    let universe = galaxy(Variation::default(), 8);
    let key = universe.group_key("naive");
    universe.save(&archive, &key).expect("snapshot saves");

    let loaded =
        Universe::load(Box::new(ZeroKernel), &archive, &key, None).expect("snapshot loads");

    assert_eq!(loaded.len(), universe.len());
    assert_eq!(loaded.iteration(), universe.iteration());
    assert_eq!(loaded.t(), universe.t());
    assert_eq!(loaded.t_step(), universe.t_step());
    assert_eq!(loaded.g(), universe.g());
    assert_eq!(loaded.scale_m(), universe.scale_m());
    assert_eq!(loaded.scale_r(), universe.scale_r());
    assert_eq!(loaded.variation(), universe.variation());
    assert_eq!(loaded.platform(), universe.platform());

    // bit-exact per index for float64
    for (a, b) in loaded.masses().iter().zip(universe.masses()) {
        assert_eq!(a.name(), b.name());
        assert_eq!(a.r(), b.r());
        assert_eq!(a.v(), b.v());
        assert_eq!(a.m(), b.m());
    }
}

#[test]
fn test_f32_round_trip_narrows_to_dtype_precision() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = SnapshotArchive::open(dir.path().join("data.db")).expect("archive opens");

    let variation = Variation::new(Dtype::Float32, Target::Cpu, Threads::Single);
    let universe = galaxy(variation, 8);
    let key = universe.group_key("naive");
    universe.save(&archive, &key).expect("snapshot saves");

    let loaded =
        Universe::load(Box::new(ZeroKernel), &archive, &key, None).expect("snapshot loads");

    // exact under the narrowed dtype
    for (a, b) in loaded.masses().iter().zip(universe.masses()) {
        for dim in 0..3 {
            assert_eq!(a.r()[dim], b.r()[dim] as f32 as f64);
            assert_eq!(a.v()[dim], b.v()[dim] as f32 as f64);
        }
        assert_eq!(a.m(), b.m() as f32 as f64);
    }
}

#[test]
fn test_snapshot_after_iterations_round_trips_counters() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = SnapshotArchive::open(dir.path().join("data.db")).expect("archive opens");

    let mut universe = galaxy(Variation::default(), 4);
    universe.start().expect("starts");
    for _ in 0..5 {
        universe.iterate().expect("iterates");
    }

    let key = universe.group_key("naive");
    universe.save(&archive, &key).expect("snapshot saves");
    assert_eq!(key.iteration, 5);

    let loaded =
        Universe::load(Box::new(ZeroKernel), &archive, &key, None).expect("snapshot loads");
    assert_eq!(loaded.iteration(), 5);
    assert_eq!(loaded.t(), 5.0 * loaded.t_step());
}
