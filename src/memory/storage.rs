use crate::memory::{AllocationType, GraphicsAllocation, MemoryManager, TaskCountType};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationUsage {
    /// Freed once the owning context retires the stored task count.
    Temporary,
    /// Kept for reuse by later submissions of the same context.
    Reusable,
}

/// Per-CSR lists of allocations whose lifetime is tied to task completion.
#[derive(Debug)]
pub struct InternalAllocationStorage {
    memory_manager: Arc<MemoryManager>,
    context_id: u32,
    temporary: Mutex<Vec<Arc<GraphicsAllocation>>>,
    reusable: Mutex<Vec<Arc<GraphicsAllocation>>>,
}

impl InternalAllocationStorage {
    #[must_use]
    pub fn new(memory_manager: Arc<MemoryManager>, context_id: u32) -> Self {
        Self {
            memory_manager,
            context_id,
            temporary: Mutex::new(Vec::new()),
            reusable: Mutex::new(Vec::new()),
        }
    }

    fn list(&self, usage: AllocationUsage) -> &Mutex<Vec<Arc<GraphicsAllocation>>> {
        match usage {
            AllocationUsage::Temporary => &self.temporary,
            AllocationUsage::Reusable => &self.reusable,
        }
    }

    pub fn store_allocation_with_task_count(
        &self,
        allocation: Arc<GraphicsAllocation>,
        usage: AllocationUsage,
        task_count: TaskCountType,
    ) {
        allocation.update_task_count(task_count, self.context_id);
        self.list(usage)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(allocation);
    }

    /// Releases every stored allocation whose task count on this context is at most
    /// `completed_task_count`. Allocations still used by other contexts are deferred
    /// by the memory manager.
    pub fn clean_allocation_list(&self, completed_task_count: TaskCountType, usage: AllocationUsage) {
        let done: Vec<_> = {
            let mut list = self.list(usage).lock().unwrap_or_else(PoisonError::into_inner);
            let (done, pending) = std::mem::take(&mut *list)
                .into_iter()
                .partition(|a: &Arc<GraphicsAllocation>| {
                    a.task_count(self.context_id) <= completed_task_count
                });
            *list = pending;
            done
        };
        if !done.is_empty() {
            trace!(count = done.len(), ?usage, completed_task_count, "releasing stored allocations");
        }
        for allocation in done {
            self.memory_manager.check_gpu_usage_and_destroy(allocation);
        }
    }

    /// Takes a completed reusable allocation of `allocation_type` that is at least `size` bytes.
    pub fn obtain_reusable_allocation(
        &self,
        size: usize,
        allocation_type: AllocationType,
        completed_task_count: TaskCountType,
    ) -> Option<Arc<GraphicsAllocation>> {
        let mut list = self.reusable.lock().unwrap_or_else(PoisonError::into_inner);
        let index = list.iter().position(|a| {
            a.allocation_type() == allocation_type
                && a.size() >= size
                && a.task_count(self.context_id) <= completed_task_count
        })?;
        Some(list.swap_remove(index))
    }

    #[must_use]
    pub fn len(&self, usage: AllocationUsage) -> usize {
        self.list(usage)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self, usage: AllocationUsage) -> bool {
        self.len(usage) == 0
    }
}

impl Drop for InternalAllocationStorage {
    fn drop(&mut self) {
        for list in [&mut self.temporary, &mut self.reusable] {
            let allocations =
                std::mem::take(list.get_mut().unwrap_or_else(PoisonError::into_inner));
            for allocation in allocations {
                self.memory_manager.check_gpu_usage_and_destroy(allocation);
            }
        }
    }
}
