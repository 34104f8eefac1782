use crate::error::NeoResult;
use crate::memory::GraphicsAllocation;
use crate::os_interface::OsContext;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidencyMode {
    /// Residency is expressed by listing objects in every execbuffer.
    ExecObjects,
    /// Objects are bound into the context VMs ahead of submission.
    VmBind,
}

/// Allocations made resident outside any single submission (for example before a
/// CPU lock). They are merged into every residency container until evicted.
#[derive(Debug)]
pub struct DrmMemoryOperations {
    mode: ResidencyMode,
    resident: Mutex<Vec<Arc<GraphicsAllocation>>>,
}

impl DrmMemoryOperations {
    #[must_use]
    pub const fn new(mode: ResidencyMode) -> Self {
        Self {
            mode,
            resident: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn mode(&self) -> ResidencyMode {
        self.mode
    }

    pub fn make_resident(&self, allocations: &[Arc<GraphicsAllocation>]) {
        let mut resident = self.resident.lock().unwrap_or_else(PoisonError::into_inner);
        for allocation in allocations {
            if !resident.iter().any(|a| a.id() == allocation.id()) {
                resident.push(Arc::clone(allocation));
            }
        }
    }

    #[must_use]
    pub fn is_resident(&self, allocation: &GraphicsAllocation) -> bool {
        self.resident
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|a| a.id() == allocation.id())
    }

    /// Drops the allocation from the resident set and, in bind mode, from every VM.
    ///
    /// # Errors
    /// Propagates the unbind failure.
    pub fn evict(&self, allocation: &GraphicsAllocation) -> NeoResult<()> {
        self.resident
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|a| a.id() != allocation.id());
        if self.mode == ResidencyMode::VmBind
            && let Some(bo) = allocation.buffer_object()
        {
            bo.unbind_all()?;
        }
        Ok(())
    }

    /// [`Self::evict`] for teardown paths where failure can only be logged.
    pub fn release(&self, allocation: &GraphicsAllocation) {
        if let Err(e) = self.evict(allocation) {
            warn!(id = allocation.id(), error = %e, "failed to evict released allocation");
        }
    }

    /// Appends resident-set members not yet listed for `context_id`.
    pub fn merge_with_residency_container(
        &self,
        container: &mut Vec<Arc<GraphicsAllocation>>,
        context_id: u32,
    ) {
        let resident = self.resident.lock().unwrap_or_else(PoisonError::into_inner);
        for allocation in resident.iter() {
            if !allocation.set_residency_listed(context_id, true) {
                container.push(Arc::clone(allocation));
            }
        }
    }

    /// Binds every buffer object into each VM of `os_context`.
    ///
    /// # Errors
    /// Stops at the first failed bind.
    pub fn make_resident_within_os_context(
        &self,
        os_context: &OsContext,
        allocations: &[Arc<GraphicsAllocation>],
    ) -> NeoResult<()> {
        let Some(linux) = os_context.linux() else {
            return Ok(());
        };
        for allocation in allocations {
            let Some(bo) = allocation.buffer_object() else {
                continue;
            };
            for (vm_handle_id, vm_id) in linux.drm_vms() {
                bo.bind(os_context.context_id(), vm_handle_id, vm_id)?;
            }
        }
        trace!(
            context_id = os_context.context_id(),
            count = allocations.len(),
            "bound residency container"
        );
        Ok(())
    }

    /// # Errors
    /// Propagates the unbind failure.
    pub fn evict_within_os_context(
        &self,
        os_context: &OsContext,
        allocation: &GraphicsAllocation,
    ) -> NeoResult<()> {
        let (Some(linux), Some(bo)) = (os_context.linux(), allocation.buffer_object()) else {
            return Ok(());
        };
        for (vm_handle_id, vm_id) in linux.drm_vms() {
            bo.unbind(os_context.context_id(), vm_handle_id, vm_id)?;
        }
        Ok(())
    }
}
