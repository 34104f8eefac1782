//! GPU-addressable allocations and their lifecycle.

pub mod aperture;
pub mod host;
pub mod manager;
pub mod page_table;
pub mod storage;

pub use aperture::{Aperture, ApertureAllocator};
pub use host::HostMemory;
pub use manager::{BackendRequest, MemoryBackend, MemoryManager};
pub use page_table::PageTableManager;
pub use storage::{AllocationUsage, InternalAllocationStorage};

use crate::error::NeoResult;
use crate::os_interface::DeviceBitfield;
use crate::os_interface::linux::buffer_object::BufferObject;
use crate::os_interface::windows::allocation::WddmAllocation;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Upper bound on OS contexts registered with one memory manager.
pub const MAX_OS_CONTEXTS: usize = 32;

pub type TaskCountType = u32;

/// Task count of an allocation never submitted on a context.
pub const TASK_COUNT_NOT_USED: TaskCountType = 0;

/// Residency task count of an allocation not resident on a context.
pub const NOT_RESIDENT: TaskCountType = 0;

static NEXT_ALLOCATION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_allocation_id() -> u64 {
    NEXT_ALLOCATION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    Buffer,
    BufferHostMemory,
    CommandBuffer,
    LinearStream,
    KernelIsa,
    FillPattern,
    InternalHeap,
    InternalHostMemory,
    TagBuffer,
    RingBuffer,
    SemaphoreBuffer,
    PreemptionBuffer,
    ScratchSurface,
    Image,
    PageTable,
}

impl AllocationType {
    /// Types the CPU writes directly and that therefore always get host backing.
    #[must_use]
    pub const fn is_cpu_accessible(self) -> bool {
        matches!(
            self,
            Self::BufferHostMemory
                | Self::CommandBuffer
                | Self::LinearStream
                | Self::FillPattern
                | Self::InternalHeap
                | Self::InternalHostMemory
                | Self::TagBuffer
                | Self::RingBuffer
                | Self::SemaphoreBuffer
                | Self::PageTable
        )
    }

    /// Types addressed through 32-bit offsets from the internal heap base.
    #[must_use]
    pub const fn uses_internal_heap(self) -> bool {
        matches!(self, Self::KernelIsa | Self::InternalHeap)
    }

    /// Types whose CPU locks are announced to the KM-DAF listener.
    #[must_use]
    pub const fn requires_kmdaf_lock(self) -> bool {
        matches!(self, Self::LinearStream | Self::FillPattern | Self::CommandBuffer)
    }

    #[must_use]
    pub const fn prefers_local_memory(self) -> bool {
        matches!(
            self,
            Self::Buffer | Self::Image | Self::KernelIsa | Self::ScratchSurface | Self::PreemptionBuffer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryPool {
    System4KbPages,
    System64KbPages,
    LocalMemory,
}

impl MemoryPool {
    #[must_use]
    pub const fn page_size(self) -> usize {
        match self {
            Self::System4KbPages => crate::utils::MEMORY_PAGE_SIZE,
            Self::System64KbPages | Self::LocalMemory => crate::utils::MEMORY_PAGE_SIZE_64K,
        }
    }
}

/// Request passed to [`MemoryManager::allocate_graphics_memory_with_properties`].
#[derive(Debug, Clone, Copy)]
pub struct AllocationProperties {
    pub root_device_index: u32,
    pub size: usize,
    pub allocation_type: AllocationType,
    pub alignment: usize,
    pub compressed: bool,
    pub sub_devices: DeviceBitfield,
}

impl AllocationProperties {
    #[must_use]
    pub const fn new(root_device_index: u32, size: usize, allocation_type: AllocationType) -> Self {
        Self {
            root_device_index,
            size,
            allocation_type,
            alignment: 0,
            compressed: false,
            sub_devices: DeviceBitfield::single(),
        }
    }

    #[must_use]
    pub const fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    #[must_use]
    pub const fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }

    #[must_use]
    pub const fn sub_devices(mut self, sub_devices: DeviceBitfield) -> Self {
        self.sub_devices = sub_devices;
        self
    }
}

/// Kernel-driver object backing an allocation.
#[derive(Debug)]
pub enum OsHandle {
    None,
    Drm(BufferObject),
    Wddm(WddmAllocation),
}

#[derive(Debug, Default)]
struct UsageInfo {
    task_count: AtomicU32,
    residency_task_count: AtomicU32,
    listed: AtomicBool,
}

/// One piece of GPU-addressable memory.
///
/// Fields describing the placement are fixed at creation. Per-context bookkeeping
/// uses atomics so an `Arc<GraphicsAllocation>` can sit in several contexts' residency
/// containers at once.
#[derive(Debug)]
pub struct GraphicsAllocation {
    id: u64,
    root_device_index: u32,
    allocation_type: AllocationType,
    memory_pool: MemoryPool,
    gpu_address: u64,
    size: usize,
    compressed: bool,
    host: Option<HostMemory>,
    os_handle: OsHandle,
    usage: Box<[UsageInfo]>,
}

impl GraphicsAllocation {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        root_device_index: u32,
        allocation_type: AllocationType,
        memory_pool: MemoryPool,
        gpu_address: u64,
        size: usize,
        compressed: bool,
        host: Option<HostMemory>,
        os_handle: OsHandle,
    ) -> Self {
        Self {
            id,
            root_device_index,
            allocation_type,
            memory_pool,
            gpu_address,
            size,
            compressed,
            host,
            os_handle,
            usage: (0..MAX_OS_CONTEXTS).map(|_| UsageInfo::default()).collect(),
        }
    }

    /// Host-backed allocation with no kernel object, soft-pinned at `gpu_address`.
    ///
    /// # Errors
    /// Returns an error if host memory cannot be allocated.
    pub fn new_host_backed(
        allocation_type: AllocationType,
        size: usize,
        gpu_address: u64,
    ) -> NeoResult<Self> {
        let host = HostMemory::allocate(size, crate::utils::MEMORY_PAGE_SIZE)?;
        Ok(Self::new(
            next_allocation_id(),
            0,
            allocation_type,
            MemoryPool::System4KbPages,
            gpu_address,
            size,
            false,
            Some(host),
            OsHandle::None,
        ))
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    #[must_use]
    pub const fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    #[must_use]
    pub const fn memory_pool(&self) -> MemoryPool {
        self.memory_pool
    }

    #[must_use]
    pub const fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.compressed
    }

    #[must_use]
    pub fn cpu_ptr(&self) -> Option<NonNull<u8>> {
        self.host.as_ref().map(HostMemory::as_non_null)
    }

    #[must_use]
    pub const fn os_handle(&self) -> &OsHandle {
        &self.os_handle
    }

    #[must_use]
    pub const fn buffer_object(&self) -> Option<&BufferObject> {
        match &self.os_handle {
            OsHandle::Drm(bo) => Some(bo),
            _ => None,
        }
    }

    #[must_use]
    pub const fn wddm_allocation(&self) -> Option<&WddmAllocation> {
        match &self.os_handle {
            OsHandle::Wddm(allocation) => Some(allocation),
            _ => None,
        }
    }

    fn usage(&self, context_id: u32) -> &UsageInfo {
        crate::unrecoverable_if!(context_id as usize >= MAX_OS_CONTEXTS);
        &self.usage[context_id as usize]
    }

    /// Raises the context's task count; never lowers it.
    pub fn update_task_count(&self, task_count: TaskCountType, context_id: u32) {
        self.usage(context_id)
            .task_count
            .fetch_max(task_count, Ordering::AcqRel);
    }

    #[must_use]
    pub fn task_count(&self, context_id: u32) -> TaskCountType {
        self.usage(context_id).task_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_used_by_os_context(&self, context_id: u32) -> bool {
        self.task_count(context_id) != TASK_COUNT_NOT_USED
    }

    /// Contexts that ever submitted this allocation, with their last task count.
    pub fn used_contexts(&self) -> impl Iterator<Item = (u32, TaskCountType)> + '_ {
        self.usage.iter().enumerate().filter_map(|(ctx, usage)| {
            let task_count = usage.task_count.load(Ordering::Acquire);
            (task_count != TASK_COUNT_NOT_USED).then_some((ctx as u32, task_count))
        })
    }

    pub fn update_residency_task_count(&self, task_count: TaskCountType, context_id: u32) {
        self.usage(context_id)
            .residency_task_count
            .store(task_count, Ordering::Release);
    }

    #[must_use]
    pub fn residency_task_count(&self, context_id: u32) -> TaskCountType {
        self.usage(context_id)
            .residency_task_count
            .load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_resident(&self, context_id: u32) -> bool {
        self.residency_task_count(context_id) != NOT_RESIDENT
    }

    pub fn release_residency(&self, context_id: u32) {
        self.update_residency_task_count(NOT_RESIDENT, context_id);
    }

    /// Marks the allocation as present in the context's residency container.
    /// Returns the previous value.
    pub fn set_residency_listed(&self, context_id: u32, listed: bool) -> bool {
        self.usage(context_id).listed.swap(listed, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_residency_listed(&self, context_id: u32) -> bool {
        self.usage(context_id).listed.load(Ordering::Acquire)
    }
}
