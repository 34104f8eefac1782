use crate::utils::align_up;
use std::collections::BTreeMap;
use tracing::error;

/// Strategy for handing out GPU virtual address ranges.
pub trait ApertureAllocator {
    /// Reserve a virtual address range within this aperture.
    fn allocate_va(&mut self, size: usize, align: usize) -> Option<u64>;

    /// Free a previously reserved virtual address range.
    fn free_va(&mut self, addr: u64, size: usize);

    /// Get the aperture's base and limit (exclusive).
    fn bounds(&self) -> (u64, u64);

    fn contains(&self, addr: u64) -> bool {
        let (base, limit) = self.bounds();
        (base..limit).contains(&addr)
    }
}

/// A first-fit range allocator over one GPU VA heap.
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,
    align: u64,
    guard_pages: u64,

    // Start Address -> Size, including guards
    allocations: BTreeMap<u64, u64>,
}

impl Aperture {
    #[must_use]
    pub fn new(base: u64, limit: u64, align: u64, guard_pages: u64) -> Self {
        Self {
            base,
            limit,
            align,
            guard_pages,
            allocations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn used_ranges(&self) -> usize {
        self.allocations.len()
    }
}

impl ApertureAllocator for Aperture {
    fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    fn allocate_va(&mut self, size: usize, align: usize) -> Option<u64> {
        let align = (align as u64).max(self.align);
        let guard_size = self.guard_pages * crate::utils::MEMORY_PAGE_SIZE as u64;
        let request_size = align_up(size as u64, self.align) + guard_size * 2;

        // The returned address (after the leading guard) must honour `align`.
        let mut candidate = align_up(self.base + guard_size, align) - guard_size;

        for (&start, &len) in &self.allocations {
            if start >= candidate && start - candidate >= request_size {
                break;
            }
            let end = start + len;
            if end > candidate {
                candidate = align_up(end + guard_size, align) - guard_size;
            }
        }

        if candidate.checked_add(request_size)? > self.limit {
            return None;
        }
        self.allocations.insert(candidate, request_size);
        Some(candidate + guard_size)
    }

    fn free_va(&mut self, addr: u64, _size: usize) {
        let tracked_start = addr - self.guard_pages * crate::utils::MEMORY_PAGE_SIZE as u64;
        if self.allocations.remove(&tracked_start).is_none() {
            error!(gpu_va = format_args!("{addr:#x}"), "freeing untracked GPU VA");
        }
    }
}
