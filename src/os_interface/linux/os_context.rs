use crate::drm::ioctl::{I915_EXEC_BLT, I915_EXEC_BSD, I915_EXEC_RENDER, I915_EXEC_VEBOX};
use crate::error::{NeoError, NeoResult};
use crate::hw::{EngineDescriptor, EngineType, EngineUsage};
use crate::os_interface::DeviceBitfield;
use crate::os_interface::linux::drm::Drm;
use std::sync::Arc;
use tracing::debug;

/// i915 contexts backing one [`crate::os_interface::OsContext`], one per sub-device.
#[derive(Debug)]
pub struct OsContextLinux {
    drm: Arc<Drm>,
    engine_flag: u64,
    drm_context_ids: Vec<u32>,
    // Parallel to `drm_context_ids`; index is the VM handle id used for bind tracking.
    drm_vm_ids: Vec<u32>,
    owned_vm_ids: Vec<u32>,
}

const fn engine_flag(engine_type: EngineType) -> u64 {
    match engine_type {
        EngineType::Rcs | EngineType::Ccs(_) => I915_EXEC_RENDER,
        EngineType::Bcs => I915_EXEC_BLT,
        EngineType::Vcs => I915_EXEC_BSD,
        EngineType::Vecs => I915_EXEC_VEBOX,
    }
}

impl OsContextLinux {
    /// # Errors
    /// Fails if a VM or context cannot be created; already created objects are destroyed.
    pub fn new(
        drm: Arc<Drm>,
        engine: EngineDescriptor,
        device_bitfield: DeviceBitfield,
    ) -> NeoResult<Self> {
        let mut context = Self {
            drm: Arc::clone(&drm),
            engine_flag: engine_flag(engine.engine_type),
            drm_context_ids: Vec::new(),
            drm_vm_ids: Vec::new(),
            owned_vm_ids: Vec::new(),
        };
        let low_priority = engine.usage == EngineUsage::LowPriority;

        for sub_device in device_bitfield.indices() {
            let vm_id = if drm.is_per_context_vm_required() {
                let vm_id = drm.create_vm()?;
                context.owned_vm_ids.push(vm_id);
                vm_id
            } else {
                drm.virtual_memory_id(sub_device).ok_or_else(|| {
                    NeoError::General(format!("no VM for sub-device {sub_device}"))
                })?
            };
            let ctx_id = drm.create_context(vm_id, low_priority)?;
            context.drm_context_ids.push(ctx_id);
            context.drm_vm_ids.push(vm_id);
        }

        debug!(
            engine = ?engine.engine_type,
            contexts = ?context.drm_context_ids,
            vms = ?context.drm_vm_ids,
            "created drm contexts"
        );
        Ok(context)
    }

    #[must_use]
    pub const fn drm(&self) -> &Arc<Drm> {
        &self.drm
    }

    #[must_use]
    pub const fn engine_flag(&self) -> u64 {
        self.engine_flag
    }

    #[must_use]
    pub fn drm_context_ids(&self) -> &[u32] {
        &self.drm_context_ids
    }

    /// `(vm_handle_id, vm_id)` pairs the context submits into.
    pub fn drm_vms(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.drm_vm_ids
            .iter()
            .enumerate()
            .map(|(index, &vm_id)| (index as u32, vm_id))
    }
}

impl Drop for OsContextLinux {
    fn drop(&mut self) {
        for ctx_id in self.drm_context_ids.drain(..) {
            self.drm.destroy_context(ctx_id);
        }
        for vm_id in self.owned_vm_ids.drain(..) {
            self.drm.destroy_vm(vm_id);
        }
    }
}
