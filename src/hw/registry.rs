//! Process-wide lookup of [`HardwareOps`] by core family.

use crate::error::{NeoError, NeoResult};
use crate::hw::{GenericHwOps, GfxCoreFamily, HardwareOps};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Default)]
pub struct HwOpsRegistry {
    entries: HashMap<GfxCoreFamily, Arc<dyn HardwareOps>>,
}

impl HwOpsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with every family the core knows how to drive.
    #[must_use]
    pub fn with_known_families() -> Self {
        let mut registry = Self::new();
        for family in [
            GfxCoreFamily::Gen9,
            GfxCoreFamily::Gen11,
            GfxCoreFamily::Gen12Lp,
            GfxCoreFamily::XeHpCore,
        ] {
            registry.register(Arc::new(GenericHwOps::for_family(family)));
        }
        registry
    }

    /// Adds or replaces the entry for `ops.family()`.
    pub fn register(&mut self, ops: Arc<dyn HardwareOps>) {
        self.entries.insert(ops.family(), ops);
    }

    #[must_use]
    pub fn lookup(&self, family: GfxCoreFamily) -> Option<Arc<dyn HardwareOps>> {
        self.entries.get(&family).cloned()
    }
}

static REGISTRY: OnceLock<HwOpsRegistry> = OnceLock::new();

/// Returns the global registry, populating it on first use.
pub fn hw_ops_registry() -> &'static HwOpsRegistry {
    REGISTRY.get_or_init(HwOpsRegistry::with_known_families)
}

/// # Errors
/// Returns [`NeoError::Unsupported`] when no ops are registered for `family`.
pub fn hw_ops_for(family: GfxCoreFamily) -> NeoResult<Arc<dyn HardwareOps>> {
    hw_ops_registry()
        .lookup(family)
        .ok_or_else(|| NeoError::Unsupported(format!("no hardware ops for {family:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_families_resolve() {
        let ops = hw_ops_for(GfxCoreFamily::Gen12Lp).unwrap();
        assert_eq!(ops.family(), GfxCoreFamily::Gen12Lp);
        assert!(ops.is_direct_submission_supported());
    }

    #[test]
    fn empty_registry_has_nothing() {
        assert!(HwOpsRegistry::new().lookup(GfxCoreFamily::Gen9).is_none());
    }
}
