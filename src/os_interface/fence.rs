//! CPU views of GPU-written completion counters.

use crate::error::{NeoError, NeoResult};
use crate::memory::GraphicsAllocation;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::trace;

/// A 64-bit counter the GPU (or the kernel driver) writes and the CPU polls.
#[derive(Clone)]
pub struct TagAddress {
    ptr: NonNull<AtomicU64>,
    // Keeps the backing memory alive when it belongs to an allocation.
    _owner: Option<Arc<GraphicsAllocation>>,
}

// SAFETY: the pointee is only accessed atomically.
unsafe impl Send for TagAddress {}
unsafe impl Sync for TagAddress {}

impl TagAddress {
    /// Counter at `offset` bytes into a host-visible allocation.
    ///
    /// # Errors
    /// Fails if the allocation has no CPU mapping or the slot is out of bounds or misaligned.
    pub fn from_allocation(allocation: &Arc<GraphicsAllocation>, offset: usize) -> NeoResult<Self> {
        let base = allocation
            .cpu_ptr()
            .ok_or_else(|| NeoError::General("tag allocation is not CPU visible".into()))?;
        if offset % 8 != 0 || offset + 8 > allocation.size() {
            return Err(NeoError::General(format!("invalid tag offset {offset}")));
        }
        // SAFETY: bounds and alignment checked above; host memory is page aligned.
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset).cast::<AtomicU64>()) };
        Ok(Self {
            ptr,
            _owner: Some(Arc::clone(allocation)),
        })
    }

    /// # Safety
    /// `ptr` must stay valid and 8-byte aligned for as long as any clone is alive.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<AtomicU64>) -> Self {
        Self { ptr, _owner: None }
    }

    fn atomic(&self) -> &AtomicU64 {
        // SAFETY: validity is guaranteed by the constructors.
        unsafe { self.ptr.as_ref() }
    }

    #[must_use]
    pub fn value(&self) -> u64 {
        self.atomic().load(Ordering::Acquire)
    }

    /// CPU-side write, used for initialization and by the kernel-driver emulation in tests.
    pub fn store(&self, value: u64) {
        self.atomic().store(value, Ordering::Release);
    }

    /// Busy-polls until the counter reaches `target` or `budget` elapses.
    pub fn spin_until(&self, target: u64, budget: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.value() >= target {
                return true;
            }
            if start.elapsed() >= budget {
                return self.value() >= target;
            }
            std::hint::spin_loop();
        }
    }
}

impl fmt::Debug for TagAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagAddress")
            .field("ptr", &self.ptr)
            .field("value", &self.value())
            .finish()
    }
}

/// Bookkeeping updated on every submission that signals the fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceState {
    /// Kernel object waited on when the counter is behind.
    pub fence_handle: u64,
    /// Value the next submission will signal.
    pub current_fence_value: u64,
    pub last_submitted_fence: u64,
}

/// A kernel-driver synchronization object with a CPU-visible counter.
#[derive(Debug)]
pub struct MonitoredFence {
    cpu_address: TagAddress,
    gpu_address: u64,
    state: Mutex<FenceState>,
}

impl MonitoredFence {
    #[must_use]
    pub const fn new(fence_handle: u64, cpu_address: TagAddress, gpu_address: u64) -> Self {
        Self {
            cpu_address,
            gpu_address,
            state: Mutex::new(FenceState {
                fence_handle,
                current_fence_value: 1,
                last_submitted_fence: 0,
            }),
        }
    }

    #[must_use]
    pub const fn cpu_address(&self) -> &TagAddress {
        &self.cpu_address
    }

    #[must_use]
    pub const fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// Last value the GPU reported.
    #[must_use]
    pub fn cpu_value(&self) -> u64 {
        self.cpu_address.value()
    }

    /// Locks the submission bookkeeping.
    pub fn state(&self) -> MutexGuard<'_, FenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn fence_handle(&self) -> u64 {
        self.state().fence_handle
    }

    #[must_use]
    pub fn current_fence_value(&self) -> u64 {
        self.state().current_fence_value
    }

    #[must_use]
    pub fn last_submitted_fence(&self) -> u64 {
        self.state().last_submitted_fence
    }

    /// Records a submission signalling `current_fence_value` and returns that value.
    pub fn advance(state: &mut FenceState) -> u64 {
        state.last_submitted_fence = state.current_fence_value;
        state.current_fence_value += 1;
        state.last_submitted_fence
    }

    /// Returns without a kernel call when the counter already reached `target`,
    /// otherwise issues exactly one blocking `wait(fence_handle, target)`.
    ///
    /// # Errors
    /// Propagates the error of the wait call.
    pub fn wait_from_cpu<F>(&self, target: u64, wait: F) -> NeoResult<()>
    where
        F: FnOnce(u64, u64) -> NeoResult<()>,
    {
        let current = self.cpu_value();
        if current >= target {
            return Ok(());
        }
        let handle = self.fence_handle();
        trace!(handle, current, target, "blocking fence wait");
        wait(handle, target)
    }
}
