use crate::error::{NeoError, NeoResult};
use crate::memory::{BackendRequest, GraphicsAllocation, MemoryBackend, MemoryPool, OsHandle};
use crate::os_interface::linux::buffer_object::BufferObject;
use crate::os_interface::linux::drm::Drm;
use crate::os_interface::linux::gem_close_worker::{GemCloseWorker, GemCloseWorkerMode};
use crate::os_interface::linux::memory_operations::DrmMemoryOperations;
use std::sync::Arc;
use tracing::trace;

/// Creates buffer objects for allocations and routes their release through the
/// GEM close worker.
#[derive(Debug)]
pub struct DrmMemoryBackend {
    drm: Arc<Drm>,
    memory_operations: Arc<DrmMemoryOperations>,
    gem_close_worker: Option<GemCloseWorker>,
}

impl DrmMemoryBackend {
    /// # Errors
    /// Fails if the worker thread cannot be started in active mode.
    pub fn new(
        drm: Arc<Drm>,
        memory_operations: Arc<DrmMemoryOperations>,
        mode: GemCloseWorkerMode,
    ) -> NeoResult<Self> {
        let gem_close_worker = match mode {
            GemCloseWorkerMode::Active => Some(GemCloseWorker::spawn()?),
            GemCloseWorkerMode::Inactive => None,
        };
        Ok(Self {
            drm,
            memory_operations,
            gem_close_worker,
        })
    }

    #[must_use]
    pub const fn drm(&self) -> &Arc<Drm> {
        &self.drm
    }

    #[must_use]
    pub const fn gem_close_worker(&self) -> Option<&GemCloseWorker> {
        self.gem_close_worker.as_ref()
    }

    #[must_use]
    pub const fn memory_operations(&self) -> &Arc<DrmMemoryOperations> {
        &self.memory_operations
    }
}

impl MemoryBackend for DrmMemoryBackend {
    fn create_os_handle(&self, request: &BackendRequest<'_>) -> NeoResult<OsHandle> {
        let size = request.size as u64;
        let handle = match request.host {
            Some(host) => self.drm.gem_userptr(host.as_ptr(), size)?,
            None if request.memory_pool == MemoryPool::LocalMemory => self.drm.gem_create(size)?,
            None => {
                return Err(NeoError::General(
                    "system memory allocation without host backing".into(),
                ));
            }
        };
        trace!(
            handle,
            gpu_va = format_args!("{:#x}", request.gpu_address),
            size,
            "created buffer object"
        );
        Ok(OsHandle::Drm(BufferObject::new(
            Arc::clone(&self.drm),
            handle,
            size,
            request.gpu_address,
        )))
    }

    fn release(&self, allocation: Arc<GraphicsAllocation>) {
        self.memory_operations.release(&allocation);
        match &self.gem_close_worker {
            Some(worker) => worker.push(allocation),
            None => drop(allocation),
        }
    }

    fn local_memory_supported(&self) -> bool {
        self.drm.hw_info().local_memory_supported
    }
}
