use crate::utils::{iow, iowr};

// ===============================================================================================
// Constants and Versioning
// ===============================================================================================

pub const DRM_IOCTL_BASE: u32 = 0x64; // 'd'
pub const DRM_COMMAND_BASE: u32 = 0x40;

const fn drm_iow<T>(nr: u32) -> u32 {
    iow::<T>(DRM_IOCTL_BASE, nr)
}

const fn drm_iowr<T>(nr: u32) -> u32 {
    iowr::<T>(DRM_IOCTL_BASE, nr)
}

// ===============================================================================================
// GEM Objects
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCloseArgs {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCreateArgs {
    pub size: u64,
    pub handle: u32,
    pub pad: u32,
}

pub const I915_USERPTR_READ_ONLY: u32 = 0x1;
pub const I915_USERPTR_UNSYNCHRONIZED: u32 = 0x8000_0000;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemUserptrArgs {
    pub user_ptr: u64,
    pub user_size: u64,
    pub flags: u32,
    pub handle: u32,
}

/// Wait until the object is idle. A negative `timeout_ns` waits forever.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemWaitArgs {
    pub bo_handle: u32,
    pub flags: u32,
    pub timeout_ns: i64,
}

// ===============================================================================================
// Submission
// ===============================================================================================

pub const EXEC_OBJECT_WRITE: u64 = 1 << 2;
pub const EXEC_OBJECT_SUPPORTS_48B_ADDRESS: u64 = 1 << 3;
pub const EXEC_OBJECT_PINNED: u64 = 1 << 4;

pub const I915_EXEC_RING_MASK: u64 = 0x3f;
pub const I915_EXEC_DEFAULT: u64 = 0;
pub const I915_EXEC_RENDER: u64 = 1;
pub const I915_EXEC_BSD: u64 = 2;
pub const I915_EXEC_BLT: u64 = 3;
pub const I915_EXEC_VEBOX: u64 = 4;
pub const I915_EXEC_NO_RELOC: u64 = 1 << 11;
pub const I915_EXEC_HANDLE_LUT: u64 = 1 << 12;
pub const I915_EXEC_BATCH_FIRST: u64 = 1 << 18;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ExecObject {
    pub handle: u32,
    pub relocation_count: u32,
    pub relocs_ptr: u64,
    pub alignment: u64,
    /// Soft-pinned GPU virtual address.
    pub offset: u64,
    pub flags: u64,
    pub rsvd1: u64,
    pub rsvd2: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct Execbuffer2Args {
    pub buffers_ptr: u64,
    pub buffer_count: u32,
    pub batch_start_offset: u32,
    pub batch_len: u32,
    pub dr1: u32,
    pub dr4: u32,
    pub num_cliprects: u32,
    pub cliprects_ptr: u64,
    pub flags: u64,
    /// Hardware context id.
    pub rsvd1: u64,
    pub rsvd2: u64,
}

// ===============================================================================================
// Contexts and Address Spaces
// ===============================================================================================

pub const I915_CONTEXT_PARAM_PRIORITY: u64 = 0x6;
pub const I915_CONTEXT_PARAM_RECOVERABLE: u64 = 0x8;
pub const I915_CONTEXT_PARAM_VM: u64 = 0x9;

pub const I915_CONTEXT_MIN_USER_PRIORITY: i64 = -1023;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ContextCreateExtArgs {
    pub ctx_id: u32,
    pub flags: u32,
    pub extensions: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ContextDestroyArgs {
    pub ctx_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ContextParamArgs {
    pub ctx_id: u32,
    pub size: u32,
    pub param: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct VmControlArgs {
    pub extensions: u64,
    pub flags: u32,
    pub vm_id: u32,
}

pub const PRELIM_I915_GEM_VM_BIND_IMMEDIATE: u64 = 1 << 0;
pub const PRELIM_I915_GEM_VM_BIND_READONLY: u64 = 1 << 1;

/// Argument of the prelim VM bind/unbind ioctls. `start` is the GPU VA the object is bound at.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct VmBindArgs {
    pub vm_id: u32,
    pub handle: u32,
    pub start: u64,
    pub offset: u64,
    pub length: u64,
    pub flags: u64,
    pub extensions: u64,
}

// ===============================================================================================
// Queries
// ===============================================================================================

pub const I915_PARAM_CHIPSET_ID: i32 = 4;
pub const I915_PARAM_REVISION: i32 = 32;
pub const I915_PARAM_HAS_EXEC_SOFTPIN: i32 = 37;
pub const PRELIM_I915_PARAM_HAS_VM_BIND: i32 = (1 << 16) | 3;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetParamArgs {
    pub param: i32,
    pub pad: u32,
    /// Pointer to an `i32` receiving the value.
    pub value: u64,
}

pub const RCS_TIMESTAMP_REGISTER: u64 = 0x2358;
/// Requests a full 64-bit read of a split timestamp register.
pub const I915_REG_READ_8B_WA: u64 = 1;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct RegReadArgs {
    pub offset: u64,
    pub val: u64,
}

// ===============================================================================================
// IOCTL Definitions
// ===============================================================================================

pub const DRM_IOCTL_GEM_CLOSE: u32 = drm_iow::<GemCloseArgs>(0x09);

pub const DRM_IOCTL_I915_GETPARAM: u32 = drm_iowr::<GetParamArgs>(DRM_COMMAND_BASE + 0x06);
pub const DRM_IOCTL_I915_GEM_CREATE: u32 = drm_iowr::<GemCreateArgs>(DRM_COMMAND_BASE + 0x1b);
pub const DRM_IOCTL_I915_GEM_EXECBUFFER2: u32 =
    drm_iow::<Execbuffer2Args>(DRM_COMMAND_BASE + 0x29);
pub const DRM_IOCTL_I915_GEM_WAIT: u32 = drm_iowr::<GemWaitArgs>(DRM_COMMAND_BASE + 0x2c);
pub const DRM_IOCTL_I915_GEM_CONTEXT_CREATE_EXT: u32 =
    drm_iowr::<ContextCreateExtArgs>(DRM_COMMAND_BASE + 0x2d);
pub const DRM_IOCTL_I915_GEM_CONTEXT_DESTROY: u32 =
    drm_iow::<ContextDestroyArgs>(DRM_COMMAND_BASE + 0x2e);
pub const DRM_IOCTL_I915_REG_READ: u32 = drm_iowr::<RegReadArgs>(DRM_COMMAND_BASE + 0x31);
pub const DRM_IOCTL_I915_GEM_USERPTR: u32 = drm_iowr::<GemUserptrArgs>(DRM_COMMAND_BASE + 0x33);
pub const DRM_IOCTL_I915_GEM_CONTEXT_SETPARAM: u32 =
    drm_iowr::<ContextParamArgs>(DRM_COMMAND_BASE + 0x35);
pub const DRM_IOCTL_I915_GEM_VM_CREATE: u32 = drm_iowr::<VmControlArgs>(DRM_COMMAND_BASE + 0x3a);
pub const DRM_IOCTL_I915_GEM_VM_DESTROY: u32 = drm_iow::<VmControlArgs>(DRM_COMMAND_BASE + 0x3b);
pub const PRELIM_DRM_IOCTL_I915_GEM_VM_BIND: u32 =
    drm_iowr::<VmBindArgs>(DRM_COMMAND_BASE + 0x5d);
pub const PRELIM_DRM_IOCTL_I915_GEM_VM_UNBIND: u32 =
    drm_iowr::<VmBindArgs>(DRM_COMMAND_BASE + 0x5e);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_struct_sizes() {
        assert_eq!(std::mem::size_of::<ExecObject>(), 56);
        assert_eq!(std::mem::size_of::<Execbuffer2Args>(), 64);
        assert_eq!(std::mem::size_of::<GemWaitArgs>(), 16);
        assert_eq!(std::mem::size_of::<GetParamArgs>(), 16);
    }

    #[test]
    fn well_known_request_numbers() {
        assert_eq!(DRM_IOCTL_GEM_CLOSE, 0x4008_6409);
        assert_eq!(DRM_IOCTL_I915_GEM_EXECBUFFER2, 0x4040_6469);
        assert_eq!(DRM_IOCTL_I915_GEM_WAIT, 0xc010_646c);
    }
}
