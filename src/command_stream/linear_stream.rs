use crate::memory::GraphicsAllocation;
use std::ptr::NonNull;
use std::sync::Arc;

/// Append-only writer over a CPU-visible allocation.
#[derive(Debug)]
pub struct LinearStream {
    allocation: Arc<GraphicsAllocation>,
    base: NonNull<u8>,
    used: usize,
    max: usize,
}

// SAFETY: a stream and the patch streams from `at_offset` over the same allocation
// are written only from the thread owning the CSR, and a patch lands before the
// patched region is submitted. Moving that ownership to another thread is sound.
unsafe impl Send for LinearStream {}

impl LinearStream {
    /// Command buffers are always host backed; anything else is a driver bug.
    #[must_use]
    pub fn new(allocation: Arc<GraphicsAllocation>) -> Self {
        let base = allocation.cpu_ptr();
        crate::unrecoverable_if!(base.is_none());
        let base = base.unwrap_or(NonNull::dangling());
        let max = allocation.size();
        Self {
            allocation,
            base,
            used: 0,
            max,
        }
    }

    /// Stream positioned at `offset`, used to patch already written commands.
    #[must_use]
    pub fn at_offset(allocation: Arc<GraphicsAllocation>, offset: usize) -> Self {
        let mut stream = Self::new(allocation);
        stream.set_used(offset);
        stream
    }

    #[must_use]
    pub const fn graphics_allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max
    }

    #[must_use]
    pub const fn available(&self) -> usize {
        self.max - self.used
    }

    #[must_use]
    pub fn gpu_base(&self) -> u64 {
        self.allocation.gpu_address()
    }

    #[must_use]
    pub fn current_gpu_address(&self) -> u64 {
        self.gpu_base() + self.used as u64
    }

    pub fn set_used(&mut self, used: usize) {
        crate::unrecoverable_if!(used > self.max);
        self.used = used;
    }

    /// Reserves `size` bytes and returns them for writing.
    pub fn get_space(&mut self, size: usize) -> &mut [u8] {
        crate::unrecoverable_if!(size > self.available());
        // SAFETY: `used + size <= max`, which is within the host allocation.
        let slice =
            unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(self.used), size) };
        self.used += size;
        slice
    }

    pub fn write_dword(&mut self, value: u32) {
        self.get_space(4).copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_dwords(&mut self, values: &[u32]) {
        let space = self.get_space(values.len() * 4);
        for (chunk, value) in space.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Pads with `MI_NOOP` up to the next multiple of `alignment`.
    pub fn align_to(&mut self, alignment: usize) {
        let padding = self.used.next_multiple_of(alignment) - self.used;
        self.get_space(padding).fill(0);
    }

    /// Bytes written so far.
    #[must_use]
    pub fn used_bytes(&self) -> &[u8] {
        // SAFETY: the first `used` bytes are within the allocation.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.used) }
    }

    /// Starts over in a new buffer.
    pub fn replace_buffer(&mut self, allocation: Arc<GraphicsAllocation>) {
        *self = Self::new(allocation);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectHeapType {
    DynamicState,
    IndirectObject,
    SurfaceState,
}

/// A state heap referenced through `STATE_BASE_ADDRESS`.
#[derive(Debug)]
pub struct IndirectHeap {
    heap_type: IndirectHeapType,
    stream: LinearStream,
}

impl IndirectHeap {
    #[must_use]
    pub fn new(heap_type: IndirectHeapType, allocation: Arc<GraphicsAllocation>) -> Self {
        Self {
            heap_type,
            stream: LinearStream::new(allocation),
        }
    }

    #[must_use]
    pub const fn heap_type(&self) -> IndirectHeapType {
        self.heap_type
    }

    #[must_use]
    pub fn gpu_base(&self) -> u64 {
        self.stream.gpu_base()
    }

    #[must_use]
    pub const fn graphics_allocation(&self) -> &Arc<GraphicsAllocation> {
        self.stream.graphics_allocation()
    }

    pub fn stream_mut(&mut self) -> &mut LinearStream {
        &mut self.stream
    }
}
