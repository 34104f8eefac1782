//! Retrying wrapper over the raw [`DrmDevice`] ioctl surface.

use crate::drm::DrmDevice;
use crate::drm::ioctl::{
    ContextCreateExtArgs, ContextParamArgs, ExecObject, Execbuffer2Args, GemCreateArgs,
    GemUserptrArgs, GemWaitArgs, I915_CONTEXT_MIN_USER_PRIORITY, I915_CONTEXT_PARAM_PRIORITY,
    I915_CONTEXT_PARAM_RECOVERABLE, I915_CONTEXT_PARAM_VM, I915_PARAM_CHIPSET_ID,
    I915_PARAM_HAS_EXEC_SOFTPIN, I915_REG_READ_8B_WA, PRELIM_I915_GEM_VM_BIND_IMMEDIATE,
    PRELIM_I915_PARAM_HAS_VM_BIND, RCS_TIMESTAMP_REGISTER, RegReadArgs, VmBindArgs,
    VmControlArgs,
};
use crate::error::{NeoError, NeoResult};
use crate::hw::HardwareInfo;
use crate::settings::DebugSettings;
use std::io;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Kernel objects and capabilities of one i915 device.
#[derive(Debug)]
pub struct Drm {
    device: Arc<dyn DrmDevice>,
    hw_info: HardwareInfo,
    chipset_id: i32,
    vm_bind_available: bool,
    per_context_vm_required: bool,
    // One VM per sub-device, shared by every context unless per-context VMs are used.
    virtual_memory_ids: Vec<u32>,
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINTR | libc::EAGAIN | libc::EBUSY)
    )
}

impl Drm {
    /// Queries capabilities and creates the shared VMs.
    ///
    /// # Errors
    /// Fails when the kernel lacks soft-pinning or VM creation fails.
    pub fn new(
        device: Arc<dyn DrmDevice>,
        hw_info: HardwareInfo,
        settings: &DebugSettings,
    ) -> NeoResult<Arc<Self>> {
        let mut drm = Self {
            device,
            hw_info,
            chipset_id: 0,
            vm_bind_available: false,
            per_context_vm_required: settings.per_context_vm,
            virtual_memory_ids: Vec::new(),
        };

        drm.chipset_id = drm.get_param(I915_PARAM_CHIPSET_ID, "I915_PARAM_CHIPSET_ID")?;
        if drm.get_param(I915_PARAM_HAS_EXEC_SOFTPIN, "I915_PARAM_HAS_EXEC_SOFTPIN")? == 0 {
            return Err(NeoError::Unsupported("kernel without soft-pin support".into()));
        }

        // Older kernels reject the prelim param with EINVAL.
        let kernel_vm_bind = drm
            .device
            .get_param(PRELIM_I915_PARAM_HAS_VM_BIND)
            .is_ok_and(|v| v > 0);
        drm.vm_bind_available = settings.use_vm_bind.unwrap_or(kernel_vm_bind);

        if !drm.per_context_vm_required {
            for _ in 0..drm.hw_info.sub_device_count.max(1) {
                let vm_id = drm.create_vm()?;
                drm.virtual_memory_ids.push(vm_id);
            }
        }

        debug!(
            chipset_id = format_args!("{:#x}", drm.chipset_id),
            vm_bind = drm.vm_bind_available,
            per_context_vm = drm.per_context_vm_required,
            vms = ?drm.virtual_memory_ids,
            "initialized drm"
        );
        Ok(Arc::new(drm))
    }

    /// Runs `f` until it returns something other than `EINTR`/`EAGAIN`/`EBUSY`.
    fn ioctl_retry<T>(
        &self,
        request: &'static str,
        mut f: impl FnMut(&dyn DrmDevice) -> io::Result<T>,
    ) -> NeoResult<T> {
        loop {
            match f(self.device.as_ref()) {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) => {
                    trace!(request, error = %e, "retrying ioctl");
                }
                Err(e) => {
                    error!(request, error = %e, "ioctl failed");
                    return Err(NeoError::from_ioctl(request, e));
                }
            }
        }
    }

    fn get_param(&self, param: i32, name: &'static str) -> NeoResult<i32> {
        self.ioctl_retry(name, |d| d.get_param(param))
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn DrmDevice> {
        &self.device
    }

    #[must_use]
    pub const fn hw_info(&self) -> &HardwareInfo {
        &self.hw_info
    }

    #[must_use]
    pub const fn chipset_id(&self) -> i32 {
        self.chipset_id
    }

    #[must_use]
    pub const fn is_vm_bind_available(&self) -> bool {
        self.vm_bind_available
    }

    #[must_use]
    pub const fn is_per_context_vm_required(&self) -> bool {
        self.per_context_vm_required
    }

    /// Shared VM of `sub_device`; `None` when every context owns its VMs.
    #[must_use]
    pub fn virtual_memory_id(&self, sub_device: u32) -> Option<u32> {
        self.virtual_memory_ids.get(sub_device as usize).copied()
    }

    // ========================================================================
    // VMs and contexts
    // ========================================================================

    /// # Errors
    /// Propagates the `GEM_VM_CREATE` failure.
    pub fn create_vm(&self) -> NeoResult<u32> {
        let mut args = VmControlArgs::default();
        self.ioctl_retry("DRM_IOCTL_I915_GEM_VM_CREATE", |d| d.vm_create(&mut args))?;
        Ok(args.vm_id)
    }

    pub fn destroy_vm(&self, vm_id: u32) {
        if let Err(e) = self.ioctl_retry("DRM_IOCTL_I915_GEM_VM_DESTROY", |d| d.vm_destroy(vm_id)) {
            warn!(vm_id, error = %e, "failed to destroy vm");
        }
    }

    /// Creates a hardware context bound to `vm_id`.
    ///
    /// # Errors
    /// Context creation and VM assignment failures are fatal.
    pub fn create_context(&self, vm_id: u32, low_priority: bool) -> NeoResult<u32> {
        let mut args = ContextCreateExtArgs::default();
        self.ioctl_retry("DRM_IOCTL_I915_GEM_CONTEXT_CREATE_EXT", |d| {
            d.context_create_ext(&mut args)
        })?;
        let ctx_id = args.ctx_id;

        let set = |param: u64, value: u64| {
            let mut p = ContextParamArgs {
                ctx_id,
                size: 0,
                param,
                value,
            };
            self.ioctl_retry("DRM_IOCTL_I915_GEM_CONTEXT_SETPARAM", |d| {
                d.context_set_param(&mut p)
            })
        };

        let configured = set(I915_CONTEXT_PARAM_VM, u64::from(vm_id))
            .and_then(|()| set(I915_CONTEXT_PARAM_RECOVERABLE, 0))
            .and_then(|()| {
                if low_priority {
                    set(
                        I915_CONTEXT_PARAM_PRIORITY,
                        I915_CONTEXT_MIN_USER_PRIORITY as u64,
                    )
                } else {
                    Ok(())
                }
            });
        if let Err(e) = configured {
            self.destroy_context(ctx_id);
            return Err(e);
        }
        Ok(ctx_id)
    }

    pub fn destroy_context(&self, ctx_id: u32) {
        if let Err(e) = self.ioctl_retry("DRM_IOCTL_I915_GEM_CONTEXT_DESTROY", |d| {
            d.context_destroy(ctx_id)
        }) {
            warn!(ctx_id, error = %e, "failed to destroy context");
        }
    }

    // ========================================================================
    // Buffer objects
    // ========================================================================

    /// # Errors
    /// `ENOMEM`/`ENOSPC` map to [`NeoError::OutOfMemory`].
    pub fn gem_create(&self, size: u64) -> NeoResult<u32> {
        let mut args = GemCreateArgs {
            size,
            ..Default::default()
        };
        self.ioctl_retry("DRM_IOCTL_I915_GEM_CREATE", |d| d.gem_create(&mut args))?;
        Ok(args.handle)
    }

    /// Wraps existing host memory in a buffer object.
    ///
    /// # Errors
    /// `ENOMEM`/`ENOSPC` map to [`NeoError::OutOfMemory`].
    pub fn gem_userptr(&self, ptr: *mut u8, size: u64) -> NeoResult<u32> {
        let mut args = GemUserptrArgs {
            user_ptr: ptr as u64,
            user_size: size,
            ..Default::default()
        };
        self.ioctl_retry("DRM_IOCTL_I915_GEM_USERPTR", |d| d.gem_userptr(&mut args))?;
        Ok(args.handle)
    }

    /// # Errors
    /// Propagates the `GEM_CLOSE` failure.
    pub fn gem_close(&self, handle: u32) -> NeoResult<()> {
        self.ioctl_retry("DRM_IOCTL_GEM_CLOSE", |d| d.gem_close(handle))
    }

    /// Blocks until the kernel retires all work referencing `handle`.
    ///
    /// # Errors
    /// A device reset surfaces here as an ioctl error.
    pub fn wait_bo(&self, handle: u32, timeout_ns: i64) -> NeoResult<()> {
        let mut args = GemWaitArgs {
            bo_handle: handle,
            flags: 0,
            timeout_ns,
        };
        self.ioctl_retry("DRM_IOCTL_I915_GEM_WAIT", |d| d.gem_wait(&mut args))
    }

    /// # Errors
    /// Any non-transient errno is a failed submission.
    pub fn exec(&self, args: &mut Execbuffer2Args, objects: &mut [ExecObject]) -> NeoResult<()> {
        self.ioctl_retry("DRM_IOCTL_I915_GEM_EXECBUFFER2", |d| d.execbuffer2(args, objects))
    }

    /// # Errors
    /// Propagates the bind failure.
    pub fn vm_bind(&self, vm_id: u32, handle: u32, gpu_address: u64, length: u64) -> NeoResult<()> {
        let mut args = VmBindArgs {
            vm_id,
            handle,
            start: gpu_address,
            offset: 0,
            length,
            flags: PRELIM_I915_GEM_VM_BIND_IMMEDIATE,
            extensions: 0,
        };
        self.ioctl_retry("PRELIM_DRM_IOCTL_I915_GEM_VM_BIND", |d| d.vm_bind(&mut args))
    }

    /// # Errors
    /// Propagates the unbind failure.
    pub fn vm_unbind(&self, vm_id: u32, handle: u32, gpu_address: u64, length: u64) -> NeoResult<()> {
        let mut args = VmBindArgs {
            vm_id,
            handle,
            start: gpu_address,
            offset: 0,
            length,
            flags: 0,
            extensions: 0,
        };
        self.ioctl_retry("PRELIM_DRM_IOCTL_I915_GEM_VM_UNBIND", |d| d.vm_unbind(&mut args))
    }

    /// Reads the render engine timestamp register.
    ///
    /// # Errors
    /// Fails when the kernel rejects the register read.
    pub fn read_gpu_timestamp(&self) -> NeoResult<u64> {
        let mut args = RegReadArgs {
            offset: RCS_TIMESTAMP_REGISTER | I915_REG_READ_8B_WA,
            val: 0,
        };
        self.ioctl_retry("DRM_IOCTL_I915_REG_READ", |d| d.reg_read(&mut args))?;
        Ok(args.val)
    }
}

impl Drop for Drm {
    fn drop(&mut self) {
        for vm_id in std::mem::take(&mut self.virtual_memory_ids) {
            self.destroy_vm(vm_id);
        }
    }
}
