use crate::drm::ioctl::{
    ContextCreateExtArgs, ContextDestroyArgs, ContextParamArgs, DRM_IOCTL_GEM_CLOSE,
    DRM_IOCTL_I915_GEM_CONTEXT_CREATE_EXT, DRM_IOCTL_I915_GEM_CONTEXT_DESTROY,
    DRM_IOCTL_I915_GEM_CONTEXT_SETPARAM, DRM_IOCTL_I915_GEM_CREATE,
    DRM_IOCTL_I915_GEM_EXECBUFFER2, DRM_IOCTL_I915_GEM_USERPTR, DRM_IOCTL_I915_GEM_VM_CREATE,
    DRM_IOCTL_I915_GEM_VM_DESTROY, DRM_IOCTL_I915_GEM_WAIT, DRM_IOCTL_I915_GETPARAM,
    DRM_IOCTL_I915_REG_READ, ExecObject, Execbuffer2Args, GemCloseArgs, GemCreateArgs,
    GemUserptrArgs, GemWaitArgs, GetParamArgs, PRELIM_DRM_IOCTL_I915_GEM_VM_BIND,
    PRELIM_DRM_IOCTL_I915_GEM_VM_UNBIND, RegReadArgs, VmBindArgs, VmControlArgs,
};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

/// The raw i915 ioctl surface used by the submission core.
///
/// Every method issues exactly one ioctl and reports the raw `errno` on failure.
/// Retrying transient errors is the caller's job (see [`crate::os_interface::linux::drm::Drm`]).
pub trait DrmDevice: Send + Sync + fmt::Debug {
    fn get_param(&self, param: i32) -> io::Result<i32>;

    fn gem_create(&self, args: &mut GemCreateArgs) -> io::Result<()>;

    fn gem_userptr(&self, args: &mut GemUserptrArgs) -> io::Result<()>;

    fn gem_close(&self, handle: u32) -> io::Result<()>;

    fn gem_wait(&self, args: &mut GemWaitArgs) -> io::Result<()>;

    /// Submits a batch. `objects` backs `args.buffers_ptr`; the batch buffer is the last entry.
    fn execbuffer2(&self, args: &mut Execbuffer2Args, objects: &mut [ExecObject])
    -> io::Result<()>;

    fn context_create_ext(&self, args: &mut ContextCreateExtArgs) -> io::Result<()>;

    fn context_destroy(&self, ctx_id: u32) -> io::Result<()>;

    fn context_set_param(&self, args: &mut ContextParamArgs) -> io::Result<()>;

    fn vm_create(&self, args: &mut VmControlArgs) -> io::Result<()>;

    fn vm_destroy(&self, vm_id: u32) -> io::Result<()>;

    fn vm_bind(&self, args: &mut VmBindArgs) -> io::Result<()>;

    fn vm_unbind(&self, args: &mut VmBindArgs) -> io::Result<()>;

    fn reg_read(&self, args: &mut RegReadArgs) -> io::Result<()>;
}

/// A handle to a DRM render node (`/dev/dri/renderD*`).
///
/// The file descriptor is wrapped in an `Arc`, so the handle is cheap to clone and share
/// with buffer objects and contexts that outlive the initial probe.
#[derive(Clone, Debug)]
pub struct DrmFile {
    pub file: Arc<File>,
}

impl DrmFile {
    /// Opens a DRM render node.
    ///
    /// # Errors
    /// Returns an error if the node cannot be opened (driver not loaded, permissions).
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Opens the first render node (`renderD128`..`renderD191`) that accepts an i915 query.
    pub fn open_first_render_node() -> io::Result<Self> {
        for minor in 128..192 {
            let path = format!("/dev/dri/renderD{minor}");
            let Ok(device) = Self::open(&path) else {
                continue;
            };
            if device.get_param(crate::drm::ioctl::I915_PARAM_CHIPSET_ID).is_ok() {
                return Ok(device);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no i915 render node found",
        ))
    }

    /// Generic unsafe helper to execute an IOCTL.
    ///
    /// # Safety
    /// The caller must ensure that `arg` points to valid memory appropriate for the specific `cmd`.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl DrmDevice for DrmFile {
    fn get_param(&self, param: i32) -> io::Result<i32> {
        let mut value: i32 = 0;
        let mut args = GetParamArgs {
            param,
            pad: 0,
            value: &raw mut value as u64,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GETPARAM, &mut args)?;
        }
        Ok(value)
    }

    fn gem_create(&self, args: &mut GemCreateArgs) -> io::Result<()> {
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_CREATE, args) }
    }

    fn gem_userptr(&self, args: &mut GemUserptrArgs) -> io::Result<()> {
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_USERPTR, args) }
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        let mut args = GemCloseArgs { handle, pad: 0 };
        unsafe { self.ioctl(DRM_IOCTL_GEM_CLOSE, &mut args) }
    }

    fn gem_wait(&self, args: &mut GemWaitArgs) -> io::Result<()> {
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_WAIT, args) }
    }

    fn execbuffer2(
        &self,
        args: &mut Execbuffer2Args,
        objects: &mut [ExecObject],
    ) -> io::Result<()> {
        args.buffers_ptr = objects.as_mut_ptr() as u64;
        args.buffer_count = u32::try_from(objects.len())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_EXECBUFFER2, args) }
    }

    fn context_create_ext(&self, args: &mut ContextCreateExtArgs) -> io::Result<()> {
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_CONTEXT_CREATE_EXT, args) }
    }

    fn context_destroy(&self, ctx_id: u32) -> io::Result<()> {
        let mut args = ContextDestroyArgs { ctx_id, pad: 0 };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_CONTEXT_DESTROY, &mut args) }
    }

    fn context_set_param(&self, args: &mut ContextParamArgs) -> io::Result<()> {
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_CONTEXT_SETPARAM, args) }
    }

    fn vm_create(&self, args: &mut VmControlArgs) -> io::Result<()> {
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_VM_CREATE, args) }
    }

    fn vm_destroy(&self, vm_id: u32) -> io::Result<()> {
        let mut args = VmControlArgs {
            vm_id,
            ..Default::default()
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_VM_DESTROY, &mut args) }
    }

    fn vm_bind(&self, args: &mut VmBindArgs) -> io::Result<()> {
        unsafe { self.ioctl(PRELIM_DRM_IOCTL_I915_GEM_VM_BIND, args) }
    }

    fn vm_unbind(&self, args: &mut VmBindArgs) -> io::Result<()> {
        unsafe { self.ioctl(PRELIM_DRM_IOCTL_I915_GEM_VM_UNBIND, args) }
    }

    fn reg_read(&self, args: &mut RegReadArgs) -> io::Result<()> {
        unsafe { self.ioctl(DRM_IOCTL_I915_REG_READ, args) }
    }
}

impl AsRawFd for DrmFile {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
