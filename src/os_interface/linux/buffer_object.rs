use crate::drm::ioctl::{EXEC_OBJECT_PINNED, EXEC_OBJECT_SUPPORTS_48B_ADDRESS, EXEC_OBJECT_WRITE, ExecObject};
use crate::error::NeoResult;
use crate::memory::MAX_OS_CONTEXTS;
use crate::os_interface::linux::drm::Drm;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{trace, warn};

/// Upper bound on VMs (sub-devices) one context spans.
pub const MAX_VM_HANDLES: usize = 4;

/// Exclusive owner of one GEM handle.
///
/// The handle is closed when the object is dropped. Binding state is tracked per
/// (OS context, VM handle index) because the same object may be bound into several
/// address spaces at once; a bound entry remembers the VM it was bound into.
#[derive(Debug)]
pub struct BufferObject {
    drm: Arc<Drm>,
    handle: u32,
    size: u64,
    gpu_address: u64,
    bind_info: Mutex<Vec<[Option<u32>; MAX_VM_HANDLES]>>,
}

impl BufferObject {
    #[must_use]
    pub fn new(drm: Arc<Drm>, handle: u32, size: u64, gpu_address: u64) -> Self {
        Self {
            drm,
            handle,
            size,
            gpu_address,
            bind_info: Mutex::new(vec![[None; MAX_VM_HANDLES]; MAX_OS_CONTEXTS]),
        }
    }

    #[must_use]
    pub const fn handle(&self) -> u32 {
        self.handle
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    fn slot(context_id: u32, vm_handle_id: u32) -> (usize, usize) {
        crate::unrecoverable_if!(context_id as usize >= MAX_OS_CONTEXTS);
        crate::unrecoverable_if!(vm_handle_id as usize >= MAX_VM_HANDLES);
        (context_id as usize, vm_handle_id as usize)
    }

    #[must_use]
    pub fn is_bound(&self, context_id: u32, vm_handle_id: u32) -> bool {
        let (ctx, vm) = Self::slot(context_id, vm_handle_id);
        self.bind_info.lock().unwrap_or_else(PoisonError::into_inner)[ctx][vm].is_some()
    }

    /// Binds into `vm_id` unless already bound for this (context, VM handle) pair.
    ///
    /// The state lock is not held across the ioctl.
    ///
    /// # Errors
    /// Propagates the kernel bind failure; the entry stays unbound.
    pub fn bind(&self, context_id: u32, vm_handle_id: u32, vm_id: u32) -> NeoResult<()> {
        if self.is_bound(context_id, vm_handle_id) {
            return Ok(());
        }
        self.drm
            .vm_bind(vm_id, self.handle, self.gpu_address, self.size)?;
        let (ctx, vm) = Self::slot(context_id, vm_handle_id);
        self.bind_info.lock().unwrap_or_else(PoisonError::into_inner)[ctx][vm] = Some(vm_id);
        trace!(handle = self.handle, context_id, vm_id, "bound buffer object");
        Ok(())
    }

    /// # Errors
    /// Propagates the kernel unbind failure; the entry stays bound.
    pub fn unbind(&self, context_id: u32, vm_handle_id: u32, vm_id: u32) -> NeoResult<()> {
        if !self.is_bound(context_id, vm_handle_id) {
            return Ok(());
        }
        self.drm
            .vm_unbind(vm_id, self.handle, self.gpu_address, self.size)?;
        let (ctx, vm) = Self::slot(context_id, vm_handle_id);
        self.bind_info.lock().unwrap_or_else(PoisonError::into_inner)[ctx][vm] = None;
        trace!(handle = self.handle, context_id, vm_id, "unbound buffer object");
        Ok(())
    }

    /// `(context, VM handle, VM id)` for every live binding.
    #[must_use]
    pub fn bindings(&self) -> Vec<(u32, u32, u32)> {
        let info = self.bind_info.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::new();
        for (ctx, row) in info.iter().enumerate() {
            for (vm, bound) in row.iter().enumerate() {
                if let Some(vm_id) = *bound {
                    out.push((ctx as u32, vm as u32, vm_id));
                }
            }
        }
        out
    }

    /// Unbinds every live binding, stopping at the first failure.
    ///
    /// # Errors
    /// Propagates the kernel unbind failure.
    pub fn unbind_all(&self) -> NeoResult<()> {
        for (ctx, vm, vm_id) in self.bindings() {
            self.unbind(ctx, vm, vm_id)?;
        }
        Ok(())
    }

    /// Soft-pinned exec entry at the object's GPU address.
    #[must_use]
    pub fn exec_object(&self, writable: bool) -> ExecObject {
        let mut flags = EXEC_OBJECT_PINNED | EXEC_OBJECT_SUPPORTS_48B_ADDRESS;
        if writable {
            flags |= EXEC_OBJECT_WRITE;
        }
        ExecObject {
            handle: self.handle,
            offset: self.gpu_address,
            flags,
            ..Default::default()
        }
    }

    /// # Errors
    /// Propagates the `GEM_WAIT` failure.
    pub fn wait(&self, timeout_ns: i64) -> NeoResult<()> {
        self.drm.wait_bo(self.handle, timeout_ns)
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        trace!(handle = self.handle, "closing gem handle");
        if let Err(e) = self.drm.gem_close(self.handle) {
            warn!(handle = self.handle, error = %e, "GEM_CLOSE failed");
        }
    }
}
