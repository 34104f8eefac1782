use crate::error::{NeoError, NeoResult};
use crate::memory::{BackendRequest, GraphicsAllocation, MemoryBackend, MemoryPool, OsHandle};
use crate::os_interface::windows::allocation::WddmAllocation;
use crate::os_interface::windows::wddm::Wddm;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{trace, warn};

/// Creates kernel allocations mapped at the VA the memory manager reserved.
#[derive(Debug)]
pub struct WddmMemoryBackend {
    wddm: Arc<Wddm>,
    make_resident_before_lock_attempts: u32,
}

impl WddmMemoryBackend {
    #[must_use]
    pub const fn new(wddm: Arc<Wddm>, make_resident_before_lock_attempts: u32) -> Self {
        Self {
            wddm,
            make_resident_before_lock_attempts,
        }
    }

    #[must_use]
    pub const fn wddm(&self) -> &Arc<Wddm> {
        &self.wddm
    }
}

impl MemoryBackend for WddmMemoryBackend {
    fn create_os_handle(&self, request: &BackendRequest<'_>) -> NeoResult<OsHandle> {
        let size = request.size as u64;
        if request.host.is_none() && request.memory_pool != MemoryPool::LocalMemory {
            return Err(NeoError::General(
                "system memory allocation without host backing".into(),
            ));
        }
        let (handle, resource) = self
            .wddm
            .create_allocation(size, request.host.map(|h| h.as_ptr()))?;
        let allocation = WddmAllocation::new(Arc::clone(&self.wddm), handle, resource, size);

        let mapped = self.wddm.map_gpu_virtual_address(
            handle,
            request.gpu_address,
            request.heap_bounds,
            size,
        )?;
        if mapped != request.gpu_address {
            warn!(
                handle,
                preferred = format_args!("{:#x}", request.gpu_address),
                mapped = format_args!("{mapped:#x}"),
                "kernel ignored the preferred GPU VA"
            );
            return Err(NeoError::General("GPU VA mismatch".into()));
        }
        trace!(
            handle,
            gpu_va = format_args!("{mapped:#x}"),
            size,
            "created wddm allocation"
        );
        Ok(OsHandle::Wddm(allocation))
    }

    /// Drops every residency reference the driver keeps, so the kernel allocation is
    /// destroyed with the last caller reference.
    fn release(&self, allocation: Arc<GraphicsAllocation>) {
        self.wddm.remove_from_trim_candidate_lists(&allocation);
        if let Some(w) = allocation.wddm_allocation()
            && let Err(e) = self.wddm.temporary_resources().evict_resource(w.handle())
        {
            warn!(error = %e, handle = w.handle(), "failed to evict temporary resource");
        }
    }

    fn local_memory_supported(&self) -> bool {
        self.wddm.hw_info().local_memory_supported
    }

    /// A lock needs the allocation resident; it becomes a temporary resource.
    fn lock(&self, allocation: &GraphicsAllocation) -> NeoResult<NonNull<u8>> {
        let w = allocation
            .wddm_allocation()
            .ok_or_else(|| NeoError::General("lock of a non-wddm allocation".into()))?;
        self.wddm
            .temporary_resources()
            .make_resident_resource_with_attempts(w.handle(), self.make_resident_before_lock_attempts)?;
        self.wddm.lock(w.handle())
    }

    fn unlock(&self, allocation: &GraphicsAllocation) {
        if let Some(w) = allocation.wddm_allocation() {
            self.wddm.unlock(w.handle());
        }
    }
}
