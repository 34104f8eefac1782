#![allow(clippy::cast_possible_truncation)]

use crate::direct_submission::DirectSubmissionOs;
use crate::drm::ioctl::{Execbuffer2Args, I915_EXEC_NO_RELOC};
use crate::error::{NeoError, NeoResult};
use crate::memory::{AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager};
use crate::os_interface::OsContext;
use crate::os_interface::fence::{MonitoredFence, TagAddress};
use crate::os_interface::linux::memory_operations::DrmMemoryOperations;
use crate::os_interface::linux::submission::GEM_WAIT_INFINITE;
use std::sync::Arc;
use tracing::warn;

/// Ring submission on i915: the ring is submitted once per start and every other
/// allocation is reached through VM bindings.
#[derive(Debug)]
pub struct DrmDirectSubmission {
    os_context: Arc<OsContext>,
    memory_operations: Arc<DrmMemoryOperations>,
    memory_manager: Arc<MemoryManager>,
    fence_allocation: Option<Arc<GraphicsAllocation>>,
    fence: MonitoredFence,
}

impl DrmDirectSubmission {
    /// # Errors
    /// Fails if the completion counter cannot be allocated or bound.
    pub fn new(
        os_context: Arc<OsContext>,
        memory_operations: Arc<DrmMemoryOperations>,
        memory_manager: Arc<MemoryManager>,
    ) -> NeoResult<Self> {
        let allocation = memory_manager.allocate_graphics_memory_with_properties(
            &AllocationProperties::new(
                os_context.root_device_index(),
                crate::utils::MEMORY_PAGE_SIZE,
                AllocationType::TagBuffer,
            ),
        )?;
        let tag = match TagAddress::from_allocation(&allocation, 0) {
            Ok(tag) => tag,
            Err(e) => {
                memory_manager.free_graphics_memory(allocation);
                return Err(e);
            }
        };
        tag.store(0);
        let fence = MonitoredFence::new(0, tag, allocation.gpu_address());
        let submission = Self {
            os_context,
            memory_operations,
            memory_manager,
            fence_allocation: Some(allocation),
            fence,
        };
        if let Some(allocation) = &submission.fence_allocation {
            submission
                .memory_operations
                .make_resident_within_os_context(&submission.os_context, std::slice::from_ref(allocation))?;
        }
        Ok(submission)
    }
}

impl DirectSubmissionOs for DrmDirectSubmission {
    fn completion_fence(&self) -> &MonitoredFence {
        &self.fence
    }

    fn handle_residency(&mut self, allocations: &[Arc<GraphicsAllocation>]) -> NeoResult<()> {
        self.memory_operations
            .make_resident_within_os_context(&self.os_context, allocations)
    }

    fn submit(&mut self, ring: &Arc<GraphicsAllocation>, offset: usize, size: usize) -> NeoResult<()> {
        let linux = self
            .os_context
            .linux()
            .ok_or_else(|| NeoError::General("drm submission on a non-drm context".into()))?;
        let bo = ring
            .buffer_object()
            .ok_or_else(|| NeoError::SubmissionFailed("ring has no buffer object".into()))?;
        let mut objects = [bo.exec_object(false)];
        let mut args = Execbuffer2Args {
            batch_start_offset: offset as u32,
            batch_len: crate::utils::align_up_usize(size, 8) as u32,
            flags: linux.engine_flag() | I915_EXEC_NO_RELOC,
            ..Default::default()
        };
        for &ctx_id in linux.drm_context_ids() {
            args.rsvd1 = u64::from(ctx_id);
            linux.drm().exec(&mut args, &mut objects)?;
        }
        self.fence.state().fence_handle = u64::from(bo.handle());
        Ok(())
    }

    fn wait_for_fence(&self, value: u64) -> NeoResult<()> {
        let Some(linux) = self.os_context.linux() else {
            return Ok(());
        };
        self.fence.wait_from_cpu(value, |handle, _| {
            linux.drm().wait_bo(handle as u32, GEM_WAIT_INFINITE)
        })
    }
}

impl Drop for DrmDirectSubmission {
    fn drop(&mut self) {
        if let Some(allocation) = self.fence_allocation.take() {
            if let Err(e) = self
                .memory_operations
                .evict_within_os_context(&self.os_context, &allocation)
            {
                warn!(error = %e, "failed to unbind direct submission fence");
            }
            self.memory_manager.free_graphics_memory(allocation);
        }
    }
}
