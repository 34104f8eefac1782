use crate::error::{NeoError, NeoResult};
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Zeroed, aligned host memory owned by an allocation.
#[derive(Debug)]
pub struct HostMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the memory is uniquely owned and only handed out as raw pointers whose
// synchronization is the caller's responsibility, same as GPU-shared memory.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// # Errors
    /// Returns [`NeoError::OutOfMemory`] if the system allocator fails.
    pub fn allocate(size: usize, alignment: usize) -> NeoResult<Self> {
        let layout = Layout::from_size_align(size.max(1), alignment.max(1))
            .map_err(|e| NeoError::General(format!("invalid host layout: {e}")))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(NeoError::OutOfMemory)?;
        Ok(Self { ptr, layout })
    }

    #[must_use]
    pub const fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.layout.size()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
