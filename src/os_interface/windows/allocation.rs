use crate::memory::MAX_OS_CONTEXTS;
use crate::os_interface::windows::wddm::Wddm;
use crate::wddm::gdi::D3dkmtHandle;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Marker for "not in the trim candidate list".
pub const TRIM_LIST_UNUSED_POSITION: usize = usize::MAX;

#[derive(Debug)]
struct ResidencyData {
    resident: AtomicBool,
    last_fence: AtomicU64,
    trim_position: AtomicUsize,
}

impl Default for ResidencyData {
    fn default() -> Self {
        Self {
            resident: AtomicBool::new(false),
            last_fence: AtomicU64::new(0),
            trim_position: AtomicUsize::new(TRIM_LIST_UNUSED_POSITION),
        }
    }
}

/// A kernel allocation handle plus per-context residency bookkeeping.
///
/// Destroying the handle is tied to drop.
pub struct WddmAllocation {
    wddm: Arc<Wddm>,
    handle: D3dkmtHandle,
    resource_handle: D3dkmtHandle,
    size: u64,
    residency: Box<[ResidencyData]>,
}

impl WddmAllocation {
    #[must_use]
    pub fn new(
        wddm: Arc<Wddm>,
        handle: D3dkmtHandle,
        resource_handle: D3dkmtHandle,
        size: u64,
    ) -> Self {
        Self {
            wddm,
            handle,
            resource_handle,
            size,
            residency: (0..MAX_OS_CONTEXTS).map(|_| ResidencyData::default()).collect(),
        }
    }

    #[must_use]
    pub const fn handle(&self) -> D3dkmtHandle {
        self.handle
    }

    #[must_use]
    pub const fn resource_handle(&self) -> D3dkmtHandle {
        self.resource_handle
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    fn data(&self, context_id: u32) -> &ResidencyData {
        crate::unrecoverable_if!(context_id as usize >= self.residency.len());
        &self.residency[context_id as usize]
    }

    #[must_use]
    pub fn is_resident(&self, context_id: u32) -> bool {
        self.data(context_id).resident.load(Ordering::Acquire)
    }

    pub fn set_resident(&self, context_id: u32, resident: bool) {
        self.data(context_id).resident.store(resident, Ordering::Release);
    }

    /// Monitored fence value of the last submission on `context_id` that used the allocation.
    #[must_use]
    pub fn last_fence(&self, context_id: u32) -> u64 {
        self.data(context_id).last_fence.load(Ordering::Acquire)
    }

    pub fn set_last_fence(&self, context_id: u32, value: u64) {
        self.data(context_id).last_fence.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn trim_position(&self, context_id: u32) -> usize {
        self.data(context_id).trim_position.load(Ordering::Acquire)
    }

    pub fn set_trim_position(&self, context_id: u32, position: usize) {
        self.data(context_id)
            .trim_position
            .store(position, Ordering::Release);
    }
}

impl fmt::Debug for WddmAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WddmAllocation")
            .field("handle", &self.handle)
            .field("resource_handle", &self.resource_handle)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl Drop for WddmAllocation {
    fn drop(&mut self) {
        self.wddm.destroy_allocations(&[self.handle]);
    }
}
