use crate::error::{NeoError, NeoResult};
use std::fmt;

pub type D3dkmtHandle = u32;

/// Raw `NTSTATUS` returned by the D3DKMT thunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtStatus(pub i32);

#[allow(clippy::cast_possible_wrap)]
impl NtStatus {
    pub const SUCCESS: Self = Self(0);
    pub const TIMEOUT: Self = Self(0x0000_0102);
    pub const UNSUCCESSFUL: Self = Self(0xC000_0001_u32 as i32);
    pub const NO_MEMORY: Self = Self(0xC000_0017_u32 as i32);
    pub const INVALID_PARAMETER: Self = Self(0xC000_000D_u32 as i32);
    pub const GRAPHICS_NO_VIDEO_MEMORY: Self = Self(0xC01E_0100_u32 as i32);
    pub const DEVICE_REMOVED: Self = Self(0xC000_02B6_u32 as i32);

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }

    #[must_use]
    pub const fn is_out_of_memory(self) -> bool {
        self.0 == Self::NO_MEMORY.0 || self.0 == Self::GRAPHICS_NO_VIDEO_MEMORY.0
    }

    /// Converts the status into the crate error taxonomy.
    pub fn check(self, call: &'static str) -> NeoResult<()> {
        if self.is_success() {
            Ok(())
        } else if self.is_out_of_memory() {
            Err(NeoError::OutOfMemory)
        } else {
            Err(NeoError::Ddi { call, status: self })
        }
    }
}

impl fmt::Display for NtStatus {
    #[allow(clippy::cast_sign_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0 as u32)
    }
}

// ===============================================================================================
// Allocations
// ===============================================================================================

#[derive(Debug, Default, Clone)]
pub struct CreateAllocationArgs {
    pub device: D3dkmtHandle,
    pub size: u64,
    /// CPU address of existing system memory backing the allocation, 0 for video memory.
    pub host_ptr: u64,
    /// Opaque resource descriptor produced by the graphics memory manager.
    pub resource_info: u64,
    pub allocation_handle: D3dkmtHandle,
    pub resource_handle: D3dkmtHandle,
}

#[derive(Debug, Default, Clone)]
pub struct MapGpuVirtualAddressArgs {
    pub device: D3dkmtHandle,
    pub allocation: D3dkmtHandle,
    pub preferred_address: u64,
    pub minimum_address: u64,
    pub maximum_address: u64,
    pub size: u64,
    pub virtual_address: u64,
    pub paging_fence_value: u64,
}

#[derive(Debug, Default, Clone)]
pub struct MakeResidentArgs {
    pub device: D3dkmtHandle,
    pub handles: Vec<D3dkmtHandle>,
    /// Tells the kernel no further trimming is possible on the UMD side.
    pub cant_trim_further: bool,
    pub paging_fence_value: u64,
    pub num_bytes_to_trim: u64,
}

#[derive(Debug, Default, Clone)]
pub struct EvictArgs {
    pub device: D3dkmtHandle,
    pub handles: Vec<D3dkmtHandle>,
    pub num_bytes_to_trim: u64,
}

#[derive(Debug, Default, Clone)]
pub struct LockArgs {
    pub device: D3dkmtHandle,
    pub handle: D3dkmtHandle,
    pub data: u64,
}

// ===============================================================================================
// Submission
// ===============================================================================================

/// Private driver data attached to every `D3DKMTSubmitCommand`.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommandBufferHeader {
    pub needs_mid_batch_pre_emption_support: bool,
    pub requires_coherency: bool,
    pub uses_resource_streamer: bool,
    pub umd_requested_slice_state: u32,
    pub umd_requested_subslice_count: u32,
    pub umd_requested_eu_count: u32,
    pub monitor_fence_va: u64,
    pub monitor_fence_value: u64,
}

#[derive(Debug, Default, Clone)]
pub struct SubmitCommandArgs {
    pub context: D3dkmtHandle,
    pub command_buffer: u64,
    pub command_length: u32,
    pub header: CommandBufferHeader,
}

#[derive(Debug, Default, Clone)]
pub struct CreateContextArgs {
    pub device: D3dkmtHandle,
    pub node_ordinal: u32,
    pub engine_affinity: u32,
    pub low_priority: bool,
    pub preemption_disabled: bool,
    pub context: D3dkmtHandle,
}

/// Monitored fence creation. On success the kernel reports both a CPU-readable and a
/// GPU-writable view of the same 64-bit counter.
#[derive(Debug, Default, Clone)]
pub struct CreateMonitoredFenceArgs {
    pub device: D3dkmtHandle,
    pub initial_fence_value: u64,
    pub sync_object: D3dkmtHandle,
    pub fence_value_cpu_va: u64,
    pub fence_value_gpu_va: u64,
}

#[derive(Debug, Default, Clone)]
pub struct WaitFromCpuArgs {
    pub device: D3dkmtHandle,
    pub objects: Vec<D3dkmtHandle>,
    pub fence_values: Vec<u64>,
}

/// The D3DKMT entry points used by the Windows shim.
///
/// Implemented over `gdi32.dll` on Windows; tests provide a recording implementation.
pub trait Gdi: Send + Sync + fmt::Debug {
    fn create_allocation(&self, args: &mut CreateAllocationArgs) -> NtStatus;

    fn destroy_allocation(&self, device: D3dkmtHandle, handles: &[D3dkmtHandle]) -> NtStatus;

    fn map_gpu_virtual_address(&self, args: &mut MapGpuVirtualAddressArgs) -> NtStatus;

    fn make_resident(&self, args: &mut MakeResidentArgs) -> NtStatus;

    fn evict(&self, args: &mut EvictArgs) -> NtStatus;

    fn lock(&self, args: &mut LockArgs) -> NtStatus;

    fn unlock(&self, device: D3dkmtHandle, handle: D3dkmtHandle) -> NtStatus;

    fn create_context(&self, args: &mut CreateContextArgs) -> NtStatus;

    fn destroy_context(&self, context: D3dkmtHandle) -> NtStatus;

    fn create_monitored_fence(&self, args: &mut CreateMonitoredFenceArgs) -> NtStatus;

    fn destroy_synchronization_object(&self, handle: D3dkmtHandle) -> NtStatus;

    fn submit_command(&self, args: &SubmitCommandArgs) -> NtStatus;

    fn wait_for_synchronization_object_from_cpu(&self, args: &WaitFromCpuArgs) -> NtStatus;

    /// KM-DAF validation hook; only called when KM-DAF is enabled.
    fn kmdaf_notify_lock(&self, _handle: D3dkmtHandle) {}
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(NtStatus::SUCCESS.check("x").is_ok());
        assert!(matches!(
            NtStatus::GRAPHICS_NO_VIDEO_MEMORY.check("x"),
            Err(NeoError::OutOfMemory)
        ));
        assert!(matches!(
            NtStatus::DEVICE_REMOVED.check("D3DKMTSubmitCommand"),
            Err(NeoError::Ddi { call: "D3DKMTSubmitCommand", .. })
        ));
        assert_eq!(NtStatus::NO_MEMORY.to_string(), "0xc0000017");
    }
}
