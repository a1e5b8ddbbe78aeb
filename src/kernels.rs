// src/kernels.rs
//
// =============================================================================
// GRAVITATION: KERNEL IMPLEMENTATIONS
// =============================================================================
//
// Every kernel module exposes `meta()` (description, requirements,
// variations; no construction cost) and `factory()` (the constructor
// bound by the registry's `load_cls`). The registry in
// `crate::registry` is the only place that wires them up.

pub mod naive;
pub mod rayon;
