//! Typed wrappers over the D3DKMT calls of one adapter device.

use crate::error::{NeoError, NeoResult};
use crate::hw::HardwareInfo;
use crate::memory::GraphicsAllocation;
use crate::os_interface::fence::{MonitoredFence, TagAddress};
use crate::os_interface::windows::residency_controller::WddmResidencyController;
use crate::os_interface::windows::temporary_resources::WddmResidentTemporaryResources;
use crate::settings::DebugSettings;
use crate::wddm::gdi::{
    CommandBufferHeader, CreateAllocationArgs, CreateContextArgs, CreateMonitoredFenceArgs,
    D3dkmtHandle, EvictArgs, Gdi, LockArgs, MakeResidentArgs, MapGpuVirtualAddressArgs, NtStatus,
    SubmitCommandArgs, WaitFromCpuArgs,
};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, error, warn};

/// A failed `D3DKMTMakeResident`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MakeResidentError {
    pub status: NtStatus,
    /// How much the kernel asks the UMD to trim before retrying.
    pub bytes_to_trim: u64,
}

pub(crate) fn make_resident_handles(
    gdi: &dyn Gdi,
    device: D3dkmtHandle,
    handles: &[D3dkmtHandle],
    cant_trim_further: bool,
) -> Result<u64, MakeResidentError> {
    let mut args = MakeResidentArgs {
        device,
        handles: handles.to_vec(),
        cant_trim_further,
        ..Default::default()
    };
    let status = gdi.make_resident(&mut args);
    if status.is_success() {
        Ok(args.paging_fence_value)
    } else {
        Err(MakeResidentError {
            status,
            bytes_to_trim: args.num_bytes_to_trim,
        })
    }
}

pub(crate) fn evict_handles(
    gdi: &dyn Gdi,
    device: D3dkmtHandle,
    handles: &[D3dkmtHandle],
) -> NeoResult<u64> {
    let mut args = EvictArgs {
        device,
        handles: handles.to_vec(),
        num_bytes_to_trim: 0,
    };
    gdi.evict(&mut args).check("D3DKMTEvict")?;
    Ok(args.num_bytes_to_trim)
}

#[derive(Debug)]
pub struct Wddm {
    gdi: Arc<dyn Gdi>,
    device: D3dkmtHandle,
    hw_info: HardwareInfo,
    kmdaf_enabled: bool,
    temporary_resources: WddmResidentTemporaryResources,
    residency_controllers: Mutex<Vec<Weak<WddmResidencyController>>>,
}

impl Wddm {
    #[must_use]
    pub fn new(
        gdi: Arc<dyn Gdi>,
        device: D3dkmtHandle,
        hw_info: HardwareInfo,
        settings: &DebugSettings,
    ) -> Arc<Self> {
        let temporary_resources = WddmResidentTemporaryResources::new(
            Arc::clone(&gdi),
            device,
            settings.temporary_resource_make_resident_attempts,
        );
        debug!(device, kmdaf = settings.use_kmd_daf, "initialized wddm");
        Arc::new(Self {
            gdi,
            device,
            hw_info,
            kmdaf_enabled: settings.use_kmd_daf,
            temporary_resources,
            residency_controllers: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn gdi(&self) -> &dyn Gdi {
        self.gdi.as_ref()
    }

    #[must_use]
    pub const fn device(&self) -> D3dkmtHandle {
        self.device
    }

    #[must_use]
    pub const fn hw_info(&self) -> &HardwareInfo {
        &self.hw_info
    }

    #[must_use]
    pub const fn is_kmdaf_enabled(&self) -> bool {
        self.kmdaf_enabled
    }

    #[must_use]
    pub const fn temporary_resources(&self) -> &WddmResidentTemporaryResources {
        &self.temporary_resources
    }

    /// Tracks `controller` so freed allocations can be dropped from its trim list.
    pub fn register_residency_controller(&self, controller: &Arc<WddmResidencyController>) {
        let mut controllers = self
            .residency_controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        controllers.retain(|c| c.strong_count() > 0);
        controllers.push(Arc::downgrade(controller));
    }

    /// Removes `allocation` from the trim candidate list of every live context.
    pub fn remove_from_trim_candidate_lists(&self, allocation: &GraphicsAllocation) {
        let controllers: Vec<_> = self
            .residency_controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for controller in controllers {
            controller.remove_from_trim_candidate_list_if_used(allocation);
        }
    }

    // ========================================================================
    // Allocations
    // ========================================================================

    /// Returns `(allocation handle, resource handle)`.
    ///
    /// # Errors
    /// Out of video memory maps to [`NeoError::OutOfMemory`].
    pub fn create_allocation(
        &self,
        size: u64,
        host_ptr: Option<*mut u8>,
    ) -> NeoResult<(D3dkmtHandle, D3dkmtHandle)> {
        let mut args = CreateAllocationArgs {
            device: self.device,
            size,
            host_ptr: host_ptr.map_or(0, |p| p as u64),
            ..Default::default()
        };
        self.gdi
            .create_allocation(&mut args)
            .check("D3DKMTCreateAllocation")?;
        Ok((args.allocation_handle, args.resource_handle))
    }

    pub fn destroy_allocations(&self, handles: &[D3dkmtHandle]) {
        let status = self.gdi.destroy_allocation(self.device, handles);
        if !status.is_success() {
            warn!(%status, ?handles, "D3DKMTDestroyAllocation2 failed");
        }
    }

    /// # Errors
    /// Propagates the DDI failure.
    pub fn map_gpu_virtual_address(
        &self,
        handle: D3dkmtHandle,
        preferred_address: u64,
        bounds: (u64, u64),
        size: u64,
    ) -> NeoResult<u64> {
        let mut args = MapGpuVirtualAddressArgs {
            device: self.device,
            allocation: handle,
            preferred_address,
            minimum_address: bounds.0,
            maximum_address: bounds.1,
            size,
            ..Default::default()
        };
        self.gdi
            .map_gpu_virtual_address(&mut args)
            .check("D3DKMTMapGpuVirtualAddress")?;
        Ok(args.virtual_address)
    }

    /// Returns the paging fence value on success.
    ///
    /// # Errors
    /// Carries the status and the kernel's trim request.
    pub fn make_resident(
        &self,
        handles: &[D3dkmtHandle],
        cant_trim_further: bool,
    ) -> Result<u64, MakeResidentError> {
        make_resident_handles(self.gdi.as_ref(), self.device, handles, cant_trim_further)
    }

    /// # Errors
    /// Propagates the DDI failure.
    pub fn evict(&self, handles: &[D3dkmtHandle]) -> NeoResult<u64> {
        evict_handles(self.gdi.as_ref(), self.device, handles)
    }

    /// # Errors
    /// Propagates the DDI failure.
    pub fn lock(&self, handle: D3dkmtHandle) -> NeoResult<NonNull<u8>> {
        let mut args = LockArgs {
            device: self.device,
            handle,
            data: 0,
        };
        self.gdi.lock(&mut args).check("D3DKMTLock2")?;
        if self.kmdaf_enabled {
            self.gdi.kmdaf_notify_lock(handle);
        }
        NonNull::new(args.data as *mut u8)
            .ok_or_else(|| NeoError::General("D3DKMTLock2 returned a null pointer".into()))
    }

    pub fn unlock(&self, handle: D3dkmtHandle) {
        let status = self.gdi.unlock(self.device, handle);
        if !status.is_success() {
            warn!(%status, handle, "D3DKMTUnlock2 failed");
        }
    }

    // ========================================================================
    // Contexts, fences, submission
    // ========================================================================

    /// # Errors
    /// Context creation failure is fatal.
    pub fn create_context(
        &self,
        node_ordinal: u32,
        low_priority: bool,
        preemption_disabled: bool,
    ) -> NeoResult<D3dkmtHandle> {
        let mut args = CreateContextArgs {
            device: self.device,
            node_ordinal,
            engine_affinity: 0,
            low_priority,
            preemption_disabled,
            context: 0,
        };
        self.gdi
            .create_context(&mut args)
            .check("D3DKMTCreateContextVirtual")?;
        Ok(args.context)
    }

    pub fn destroy_context(&self, context: D3dkmtHandle) {
        let status = self.gdi.destroy_context(context);
        if !status.is_success() {
            warn!(%status, context, "D3DKMTDestroyContext failed");
        }
    }

    /// # Errors
    /// Fails if the kernel does not return a CPU mapping for the counter.
    pub fn create_monitored_fence(&self) -> NeoResult<MonitoredFence> {
        let mut args = CreateMonitoredFenceArgs {
            device: self.device,
            ..Default::default()
        };
        self.gdi
            .create_monitored_fence(&mut args)
            .check("D3DKMTCreateSynchronizationObject2")?;
        let Some(cpu) = NonNull::new(args.fence_value_cpu_va as *mut AtomicU64) else {
            self.destroy_synchronization_object(args.sync_object);
            return Err(NeoError::General("monitored fence without CPU address".into()));
        };
        // SAFETY: the kernel keeps the mapping alive until the sync object is destroyed,
        // which happens only after the owning fence is dropped.
        let tag = unsafe { TagAddress::from_raw(cpu) };
        Ok(MonitoredFence::new(
            u64::from(args.sync_object),
            tag,
            args.fence_value_gpu_va,
        ))
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn destroy_monitored_fence(&self, fence: &MonitoredFence) {
        self.destroy_synchronization_object(fence.fence_handle() as D3dkmtHandle);
    }

    fn destroy_synchronization_object(&self, handle: D3dkmtHandle) {
        let status = self.gdi.destroy_synchronization_object(handle);
        if !status.is_success() {
            warn!(%status, handle, "D3DKMTDestroySynchronizationObject failed");
        }
    }

    /// # Errors
    /// Any failure is a failed submission.
    pub fn submit(
        &self,
        command_buffer: u64,
        length: usize,
        header: &CommandBufferHeader,
        context: D3dkmtHandle,
    ) -> NeoResult<()> {
        let args = SubmitCommandArgs {
            context,
            command_buffer,
            command_length: u32::try_from(length)
                .map_err(|_| NeoError::SubmissionFailed("command buffer too large".into()))?,
            header: *header,
        };
        let status = self.gdi.submit_command(&args);
        if !status.is_success() {
            error!(%status, context, "D3DKMTSubmitCommand failed");
            return Err(NeoError::SubmissionFailed(format!("D3DKMTSubmitCommand: {status}")));
        }
        Ok(())
    }

    /// No-op when the fence already reached `value`; otherwise one blocking DDI wait.
    ///
    /// # Errors
    /// Device removal surfaces here.
    #[allow(clippy::cast_possible_truncation)]
    pub fn wait_from_cpu(&self, value: u64, fence: &MonitoredFence) -> NeoResult<()> {
        fence.wait_from_cpu(value, |handle, target| {
            let args = WaitFromCpuArgs {
                device: self.device,
                objects: vec![handle as D3dkmtHandle],
                fence_values: vec![target],
            };
            let status = self.gdi.wait_for_synchronization_object_from_cpu(&args);
            if status == NtStatus::DEVICE_REMOVED {
                error!(handle, target, "device removed while waiting on fence");
                return Err(NeoError::GpuHang);
            }
            status.check("D3DKMTWaitForSynchronizationObjectFromCpu")
        })
    }
}
