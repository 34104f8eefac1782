#![allow(clippy::cast_possible_truncation)]

use crate::error::{NeoError, NeoResult};
use crate::memory::aperture::{Aperture, ApertureAllocator};
use crate::memory::{
    AllocationProperties, GraphicsAllocation, HostMemory, MAX_OS_CONTEXTS, MemoryPool, OsHandle,
    PageTableManager, next_allocation_id,
};
use crate::os_interface::fence::TagAddress;
use crate::utils::{MEMORY_PAGE_SIZE, MEMORY_PAGE_SIZE_64K, align_up_usize};
use std::collections::HashSet;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

// GPU VA layout of one root device (48-bit PPGTT)
pub const INTERNAL_HEAP_BASE: u64 = 0x1_0000_0000;
const INTERNAL_HEAP_LIMIT: u64 = 0x2_0000_0000; // 4GB window for 32-bit offsets
const STANDARD_HEAP_BASE: u64 = 0x10_0000_0000;
const STANDARD_HEAP_LIMIT: u64 = 0x4000_0000_0000;
const STANDARD_64K_HEAP_BASE: u64 = 0x4000_0000_0000;
const STANDARD_64K_HEAP_LIMIT: u64 = 0x8000_0000_0000;
const GUARD_PAGES: u64 = 0;

/// What a backend needs to create the kernel object for a new allocation.
#[derive(Debug)]
pub struct BackendRequest<'a> {
    pub properties: &'a AllocationProperties,
    pub size: usize,
    pub gpu_address: u64,
    pub memory_pool: MemoryPool,
    pub host: Option<&'a HostMemory>,
    /// Bounds of the heap `gpu_address` was reserved from.
    pub heap_bounds: (u64, u64),
}

/// OS-specific half of the memory manager.
pub trait MemoryBackend: Send + Sync + fmt::Debug {
    /// Creates the kernel object for an allocation at a reserved GPU VA.
    ///
    /// # Errors
    /// Returns [`NeoError::OutOfMemory`] when the kernel driver is out of memory.
    fn create_os_handle(&self, request: &BackendRequest<'_>) -> NeoResult<OsHandle>;

    /// Takes ownership of an allocation nobody will submit again.
    fn release(&self, allocation: Arc<GraphicsAllocation>);

    fn local_memory_supported(&self) -> bool {
        false
    }

    /// Returns a CPU pointer for an allocation without host backing.
    ///
    /// # Errors
    /// Returns an error if the allocation cannot be made resident or mapped.
    fn lock(&self, allocation: &GraphicsAllocation) -> NeoResult<NonNull<u8>> {
        let _ = allocation;
        Err(NeoError::Unsupported("lock of device-local memory".into()))
    }

    fn unlock(&self, allocation: &GraphicsAllocation) {
        let _ = allocation;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeapIndex {
    Internal,
    Standard,
    Standard64Kb,
}

#[derive(Debug)]
struct GfxPartition {
    internal: Aperture,
    standard: Aperture,
    standard_64kb: Aperture,
}

impl GfxPartition {
    fn new() -> Self {
        Self {
            internal: Aperture::new(
                INTERNAL_HEAP_BASE,
                INTERNAL_HEAP_LIMIT,
                MEMORY_PAGE_SIZE as u64,
                GUARD_PAGES,
            ),
            standard: Aperture::new(
                STANDARD_HEAP_BASE,
                STANDARD_HEAP_LIMIT,
                MEMORY_PAGE_SIZE as u64,
                GUARD_PAGES,
            ),
            standard_64kb: Aperture::new(
                STANDARD_64K_HEAP_BASE,
                STANDARD_64K_HEAP_LIMIT,
                MEMORY_PAGE_SIZE_64K as u64,
                GUARD_PAGES,
            ),
        }
    }

    fn heap(&mut self, index: HeapIndex) -> &mut Aperture {
        match index {
            HeapIndex::Internal => &mut self.internal,
            HeapIndex::Standard => &mut self.standard,
            HeapIndex::Standard64Kb => &mut self.standard_64kb,
        }
    }

    fn heap_containing(&mut self, gpu_address: u64) -> Option<&mut Aperture> {
        [HeapIndex::Internal, HeapIndex::Standard, HeapIndex::Standard64Kb]
            .into_iter()
            .find(|&i| self.heap(i).contains(gpu_address))
            .map(|i| self.heap(i))
    }
}

#[derive(Debug)]
struct RootMemory {
    backend: Box<dyn MemoryBackend>,
    partition: Mutex<GfxPartition>,
    page_table_manager: Mutex<Option<Arc<PageTableManager>>>,
    live: Mutex<HashSet<u64>>,
}

#[derive(Debug, Clone)]
struct RegisteredEngine {
    context_id: u32,
    root_device_index: u32,
    tag: TagAddress,
}

/// Owns GPU virtual address space and the lifetime of every [`GraphicsAllocation`].
#[derive(Debug)]
pub struct MemoryManager {
    roots: Vec<RootMemory>,
    engines: RwLock<Vec<RegisteredEngine>>,
    next_context_id: AtomicU32,
    deferred: Mutex<Vec<Arc<GraphicsAllocation>>>,
}

impl MemoryManager {
    /// One backend per root device, indexed by root device index.
    #[must_use]
    pub fn new(backends: Vec<Box<dyn MemoryBackend>>) -> Self {
        Self {
            roots: backends
                .into_iter()
                .map(|backend| RootMemory {
                    backend,
                    partition: Mutex::new(GfxPartition::new()),
                    page_table_manager: Mutex::new(None),
                    live: Mutex::new(HashSet::new()),
                })
                .collect(),
            engines: RwLock::new(Vec::new()),
            next_context_id: AtomicU32::new(0),
            deferred: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn root_device_count(&self) -> usize {
        self.roots.len()
    }

    fn root(&self, root_device_index: u32) -> NeoResult<&RootMemory> {
        self.roots
            .get(root_device_index as usize)
            .ok_or(NeoError::InvalidRootDevice(root_device_index))
    }

    /// # Errors
    /// Returns [`NeoError::InvalidRootDevice`] for an unknown index.
    pub fn backend(&self, root_device_index: u32) -> NeoResult<&dyn MemoryBackend> {
        Ok(self.root(root_device_index)?.backend.as_ref())
    }

    // ========================================================================
    // Engines
    // ========================================================================

    /// Hands out the next OS context id.
    pub fn create_os_context_id(&self) -> u32 {
        let id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
        crate::unrecoverable_if!(id as usize >= MAX_OS_CONTEXTS);
        id
    }

    /// Makes `tag` the completion source for allocations used on `context_id`.
    pub fn register_engine(&self, context_id: u32, root_device_index: u32, tag: TagAddress) {
        let mut engines = self.engines.write().unwrap_or_else(PoisonError::into_inner);
        engines.retain(|e| e.context_id != context_id);
        engines.push(RegisteredEngine {
            context_id,
            root_device_index,
            tag,
        });
    }

    pub fn unregister_engine(&self, context_id: u32) {
        self.engines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|e| e.context_id != context_id);
    }

    #[must_use]
    pub fn registered_engine_count(&self, root_device_index: u32) -> usize {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.root_device_index == root_device_index)
            .count()
    }

    /// True once every registered context has retired its last use of `allocation`.
    #[must_use]
    pub fn is_allocation_completed(&self, allocation: &GraphicsAllocation) -> bool {
        let engines = self.engines.read().unwrap_or_else(PoisonError::into_inner);
        allocation.used_contexts().all(|(context_id, task_count)| {
            engines
                .iter()
                .find(|e| e.context_id == context_id)
                .is_none_or(|e| e.tag.value() >= u64::from(task_count))
        })
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Reserves GPU VA, creates host backing when needed and asks the backend for
    /// the kernel object.
    ///
    /// # Errors
    /// [`NeoError::OutOfVirtualAddressSpace`] when the heap is full, otherwise whatever
    /// the backend reports.
    pub fn allocate_graphics_memory_with_properties(
        &self,
        properties: &AllocationProperties,
    ) -> NeoResult<Arc<GraphicsAllocation>> {
        let root = self.root(properties.root_device_index)?;
        let allocation_type = properties.allocation_type;

        let memory_pool = if allocation_type.prefers_local_memory()
            && root.backend.local_memory_supported()
        {
            MemoryPool::LocalMemory
        } else if properties.size >= MEMORY_PAGE_SIZE_64K {
            MemoryPool::System64KbPages
        } else {
            MemoryPool::System4KbPages
        };

        let alignment = properties.alignment.max(memory_pool.page_size());
        let size = align_up_usize(properties.size.max(1), memory_pool.page_size());

        let host = if allocation_type.is_cpu_accessible() || memory_pool != MemoryPool::LocalMemory
        {
            Some(HostMemory::allocate(size, alignment)?)
        } else {
            None
        };

        let heap_index = if allocation_type.uses_internal_heap() {
            HeapIndex::Internal
        } else if memory_pool == MemoryPool::System4KbPages {
            HeapIndex::Standard
        } else {
            HeapIndex::Standard64Kb
        };

        let (gpu_address, heap_bounds) = {
            let mut partition = root.partition.lock().unwrap_or_else(PoisonError::into_inner);
            let heap = partition.heap(heap_index);
            let va = heap
                .allocate_va(size, alignment)
                .ok_or(NeoError::OutOfVirtualAddressSpace)?;
            (va, heap.bounds())
        };

        let request = BackendRequest {
            properties,
            size,
            gpu_address,
            memory_pool,
            host: host.as_ref(),
            heap_bounds,
        };
        let os_handle = match root.backend.create_os_handle(&request) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    ?allocation_type,
                    size,
                    error = %e,
                    "backend failed to create allocation"
                );
                root.partition
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .heap(heap_index)
                    .free_va(gpu_address, size);
                return Err(e);
            }
        };

        let compressed = properties.compressed && allocation_type.prefers_local_memory();
        let allocation = Arc::new(GraphicsAllocation::new(
            next_allocation_id(),
            properties.root_device_index,
            allocation_type,
            memory_pool,
            gpu_address,
            size,
            compressed,
            host,
            os_handle,
        ));

        root.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(allocation.id());

        if compressed
            && let Some(ptm) = self.page_table_manager(properties.root_device_index)
            && let Err(e) = ptm.update_aux_table(gpu_address, size, true)
        {
            self.free_graphics_memory(allocation);
            return Err(e);
        }

        debug!(
            id = allocation.id(),
            ?allocation_type,
            ?memory_pool,
            gpu_va = format_args!("{gpu_address:#x}"),
            size,
            "allocated graphics memory"
        );
        Ok(allocation)
    }

    /// Hands the allocation to the backend, then returns its VA to the heap.
    ///
    /// Freeing an allocation twice, or one this manager did not create, is a driver bug.
    pub fn free_graphics_memory(&self, allocation: Arc<GraphicsAllocation>) {
        let Ok(root) = self.root(allocation.root_device_index()) else {
            crate::unrecoverable_if!(true);
            return;
        };
        let removed = root
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&allocation.id());
        crate::unrecoverable_if!(!removed);

        if allocation.is_compressed()
            && let Some(ptm) = self.page_table_manager(allocation.root_device_index())
            && let Err(e) =
                ptm.update_aux_table(allocation.gpu_address(), allocation.size(), false)
        {
            warn!(error = %e, "failed to unmap aux table entry");
        }

        let (gpu_address, size) = (allocation.gpu_address(), allocation.size());
        debug!(id = allocation.id(), "freeing graphics memory");
        root.backend.release(allocation);

        // The range is reusable only once the backend let go of its mapping.
        if let Some(heap) = root
            .partition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heap_containing(gpu_address)
        {
            heap.free_va(gpu_address, size);
        }
    }

    /// Frees now if idle on every context, otherwise parks the allocation until
    /// [`Self::drain_deferred_frees`] finds it idle.
    pub fn check_gpu_usage_and_destroy(&self, allocation: Arc<GraphicsAllocation>) {
        if self.is_allocation_completed(&allocation) {
            self.free_graphics_memory(allocation);
        } else {
            self.deferred
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(allocation);
        }
    }

    /// Frees every parked allocation that has completed. Returns how many remain.
    pub fn drain_deferred_frees(&self) -> usize {
        let ready: Vec<_> = {
            let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
            let (ready, pending) = std::mem::take(&mut *deferred)
                .into_iter()
                .partition(|a| self.is_allocation_completed(a));
            *deferred = pending;
            ready
        };
        for allocation in ready {
            self.free_graphics_memory(allocation);
        }
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn live_allocation_count(&self, root_device_index: u32) -> usize {
        self.root(root_device_index).map_or(0, |r| {
            r.live.lock().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    // ========================================================================
    // CPU access
    // ========================================================================

    /// # Errors
    /// Propagates the backend's failure to make the allocation resident or map it.
    pub fn lock_resource(&self, allocation: &GraphicsAllocation) -> NeoResult<NonNull<u8>> {
        if let Some(ptr) = allocation.cpu_ptr() {
            return Ok(ptr);
        }
        self.root(allocation.root_device_index())?
            .backend
            .lock(allocation)
    }

    pub fn unlock_resource(&self, allocation: &GraphicsAllocation) {
        if allocation.cpu_ptr().is_none()
            && let Ok(root) = self.root(allocation.root_device_index())
        {
            root.backend.unlock(allocation);
        }
    }

    // ========================================================================
    // Compression
    // ========================================================================

    #[must_use]
    pub fn page_table_manager(&self, root_device_index: u32) -> Option<Arc<PageTableManager>> {
        self.root(root_device_index).ok().and_then(|r| {
            r.page_table_manager
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// Installs the page table manager once; later calls return the existing one.
    ///
    /// # Errors
    /// Returns an error if the aux table allocation cannot be created.
    pub fn create_page_table_manager(
        &self,
        root_device_index: u32,
    ) -> NeoResult<Arc<PageTableManager>> {
        let root = self.root(root_device_index)?;
        if let Some(existing) = self.page_table_manager(root_device_index) {
            return Ok(existing);
        }
        let table = self.allocate_graphics_memory_with_properties(&AllocationProperties::new(
            root_device_index,
            MEMORY_PAGE_SIZE_64K,
            crate::memory::AllocationType::PageTable,
        ))?;

        let mut slot = root
            .page_table_manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref() {
            let existing = Arc::clone(existing);
            drop(slot);
            self.free_graphics_memory(table);
            return Ok(existing);
        }
        let ptm = Arc::new(PageTableManager::new(table));
        *slot = Some(Arc::clone(&ptm));
        Ok(ptm)
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        let deferred = std::mem::take(
            self.deferred
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if !deferred.is_empty() {
            warn!(count = deferred.len(), "releasing allocations still in flight");
        }
        for allocation in deferred {
            self.free_graphics_memory(allocation);
        }
        for index in 0..self.roots.len() {
            let ptm = self.roots[index]
                .page_table_manager
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(ptm) = ptm
                && let Ok(ptm) = Arc::try_unwrap(ptm)
            {
                self.free_graphics_memory(ptm.into_table());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Host-backed allocations without a kernel object.
    #[derive(Debug, Default)]
    pub(crate) struct HostOnlyBackend;

    impl MemoryBackend for HostOnlyBackend {
        fn create_os_handle(&self, _request: &BackendRequest<'_>) -> NeoResult<OsHandle> {
            Ok(OsHandle::None)
        }

        fn release(&self, _allocation: Arc<GraphicsAllocation>) {}
    }

    pub(crate) fn host_only_manager() -> Arc<MemoryManager> {
        Arc::new(MemoryManager::new(vec![Box::new(HostOnlyBackend)]))
    }
}
