// src/registry.rs
//
// =============================================================================
// GRAVITATION: KERNEL REGISTRY
// =============================================================================
//
// Build-time registry of compute kernels. Each descriptor keeps its
// two halves lazy:
//
// - `load_meta` materializes description, requirements and the
//   enumerated variations (cheap; the CLI lists kernels from this).
// - `load_cls` binds the constructor closure (the "heavy import" of
//   the original dynamic-discovery design collapses to a function
//   pointer here, but the split survives: meta can be inspected
//   without ever touching the implementation).
//
// Both loads are idempotent; accessors fail before the matching load.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::errors::KernelError;
use crate::universe::Kernel;
use crate::variation::{Variation, Variations};

// ============================================================================
// 1. DESCRIPTOR
// ============================================================================

/// Kernel meta data, available without constructing anything.
#[derive(Debug, Clone)]
pub struct KernelMeta {
    pub description: String,
    pub requirements: Vec<String>,
    pub variations: Variations,
}

/// Constructs a concrete kernel for one selected variation.
pub type KernelFactory = fn(&Variation) -> Box<dyn Kernel>;

pub struct KernelDescriptor {
    name: &'static str,
    meta_fn: fn() -> KernelMeta,
    cls_fn: fn() -> KernelFactory,
    meta: OnceLock<KernelMeta>,
    cls: OnceLock<KernelFactory>,
}

impl KernelDescriptor {
    pub fn new(name: &'static str, meta_fn: fn() -> KernelMeta, cls_fn: fn() -> KernelFactory) -> Self {
        Self {
            name,
            meta_fn,
            cls_fn,
            meta: OnceLock::new(),
            cls: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn meta_loaded(&self) -> bool {
        self.meta.get().is_some()
    }

    pub fn cls_loaded(&self) -> bool {
        self.cls.get().is_some()
    }

    /// Loads meta data. Idempotent.
    pub fn load_meta(&self) -> &KernelMeta {
        self.meta.get_or_init(self.meta_fn)
    }

    /// Binds the constructor. Idempotent.
    pub fn load_cls(&self) -> KernelFactory {
        *self.cls.get_or_init(self.cls_fn)
    }

    pub fn description(&self) -> Result<&str, KernelError> {
        self.meta
            .get()
            .map(|meta| meta.description.as_str())
            .ok_or(KernelError::MetaNotLoaded)
    }

    pub fn requirements(&self) -> Result<&[String], KernelError> {
        self.meta
            .get()
            .map(|meta| meta.requirements.as_slice())
            .ok_or(KernelError::MetaNotLoaded)
    }

    pub fn variations(&self) -> Result<&Variations, KernelError> {
        self.meta
            .get()
            .map(|meta| &meta.variations)
            .ok_or(KernelError::MetaNotLoaded)
    }

    /// Constructs a kernel instance for `variation`.
    pub fn create(&self, variation: &Variation) -> Result<Box<dyn Kernel>, KernelError> {
        let factory = self.cls.get().ok_or(KernelError::ClsNotLoaded)?;
        Ok(factory(variation))
    }
}

// ============================================================================
// 2. REGISTRY
// ============================================================================

pub struct Registry {
    kernels: BTreeMap<&'static str, KernelDescriptor>,
}

impl Registry {
    /// All kernels compiled into this binary.
    pub fn builtin() -> Self {
        let mut kernels = BTreeMap::new();
        for descriptor in [
            KernelDescriptor::new(
                "naive",
                crate::kernels::naive::meta,
                crate::kernels::naive::factory,
            ),
            KernelDescriptor::new(
                "rayon",
                crate::kernels::rayon::meta,
                crate::kernels::rayon::factory,
            ),
        ] {
            kernels.insert(descriptor.name(), descriptor);
        }
        Self { kernels }
    }

    pub fn get(&self, name: &str) -> Result<&KernelDescriptor, KernelError> {
        self.kernels
            .get(name)
            .ok_or_else(|| KernelError::Unknown(name.into()))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.kernels.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KernelDescriptor> {
        self.kernels.values()
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_fail_before_load() {
        let registry = Registry::builtin();
        let descriptor = registry.get("naive").unwrap();

        assert!(!descriptor.meta_loaded());
        assert!(matches!(
            descriptor.description(),
            Err(KernelError::MetaNotLoaded)
        ));
        assert!(matches!(
            descriptor.create(&Variation::default()),
            Err(KernelError::ClsNotLoaded)
        ));
    }

    #[test]
    fn loads_are_idempotent() {
        let registry = Registry::builtin();
        let descriptor = registry.get("naive").unwrap();

        let first = descriptor.load_meta().variations.len();
        let second = descriptor.load_meta().variations.len();
        assert_eq!(first, second);
        assert!(descriptor.meta_loaded());

        descriptor.load_cls();
        descriptor.load_cls();
        assert!(descriptor.cls_loaded());
        assert!(descriptor.create(&Variation::default()).is_ok());
    }

    #[test]
    fn unknown_kernel_is_an_error() {
        let registry = Registry::builtin();
        assert!(matches!(
            registry.get("warp9"),
            Err(KernelError::Unknown(_))
        ));
    }

    #[test]
    fn builtin_names_are_sorted() {
        let registry = Registry::builtin();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["naive", "rayon"]);
    }
}
