use crate::error::NeoResult;
use crate::hw::{EngineDescriptor, EngineType, EngineUsage, HardwareOps, PreemptionMode};
use crate::os_interface::linux::OsContextLinux;
use crate::os_interface::windows::OsContextWin;
use crate::os_interface::{DeviceBitfield, OsInterface};
use crate::settings::DebugSettings;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub enum OsContextKind {
    Linux(OsContextLinux),
    Windows(OsContextWin),
}

/// One hardware engine queue registered with the kernel driver.
#[derive(Debug)]
pub struct OsContext {
    context_id: u32,
    root_device_index: u32,
    device_bitfield: DeviceBitfield,
    engine: EngineDescriptor,
    preemption_mode: PreemptionMode,
    direct_submission_active: AtomicBool,
    kind: OsContextKind,
}

impl OsContext {
    /// # Errors
    /// Kernel context or fence creation failures are returned as is.
    pub fn create(
        os_interface: &OsInterface,
        context_id: u32,
        root_device_index: u32,
        device_bitfield: DeviceBitfield,
        engine: EngineDescriptor,
        preemption_mode: PreemptionMode,
    ) -> NeoResult<Arc<Self>> {
        let kind = match os_interface {
            OsInterface::Drm(drm) => OsContextKind::Linux(OsContextLinux::new(
                Arc::clone(drm),
                engine,
                device_bitfield,
            )?),
            OsInterface::Wddm(wddm) => OsContextKind::Windows(OsContextWin::new(
                Arc::clone(wddm),
                context_id,
                engine,
                preemption_mode,
            )?),
        };
        Ok(Arc::new(Self {
            context_id,
            root_device_index,
            device_bitfield,
            engine,
            preemption_mode,
            direct_submission_active: AtomicBool::new(false),
            kind,
        }))
    }

    #[must_use]
    pub const fn context_id(&self) -> u32 {
        self.context_id
    }

    #[must_use]
    pub const fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    #[must_use]
    pub const fn device_bitfield(&self) -> DeviceBitfield {
        self.device_bitfield
    }

    #[must_use]
    pub const fn engine(&self) -> EngineDescriptor {
        self.engine
    }

    #[must_use]
    pub const fn engine_type(&self) -> EngineType {
        self.engine.engine_type
    }

    #[must_use]
    pub const fn preemption_mode(&self) -> PreemptionMode {
        self.preemption_mode
    }

    #[must_use]
    pub fn is_low_priority(&self) -> bool {
        self.engine.usage == EngineUsage::LowPriority
    }

    #[must_use]
    pub const fn kind(&self) -> &OsContextKind {
        &self.kind
    }

    #[must_use]
    pub const fn linux(&self) -> Option<&OsContextLinux> {
        match &self.kind {
            OsContextKind::Linux(ctx) => Some(ctx),
            OsContextKind::Windows(_) => None,
        }
    }

    #[must_use]
    pub const fn windows(&self) -> Option<&OsContextWin> {
        match &self.kind {
            OsContextKind::Windows(ctx) => Some(ctx),
            OsContextKind::Linux(_) => None,
        }
    }

    /// Direct submission is limited to the render and copy engines unless the
    /// engine mask setting says otherwise, and needs VM bind on Linux.
    #[must_use]
    pub fn is_direct_submission_supported(
        &self,
        hw_ops: &dyn HardwareOps,
        settings: &DebugSettings,
    ) -> bool {
        if settings.enable_direct_submission == Some(false) || !hw_ops.is_direct_submission_supported()
        {
            return false;
        }
        let default_mask = EngineType::Rcs.bit() | EngineType::Bcs.bit();
        let mask = settings.direct_submission_engines.unwrap_or(default_mask);
        if mask & self.engine_type().bit() == 0 {
            return false;
        }
        match &self.kind {
            OsContextKind::Linux(ctx) => ctx.drm().is_vm_bind_available(),
            OsContextKind::Windows(_) => true,
        }
    }

    pub fn set_direct_submission_active(&self, active: bool) {
        self.direct_submission_active.store(active, Ordering::Release);
    }

    #[must_use]
    pub fn is_direct_submission_active(&self) -> bool {
        self.direct_submission_active.load(Ordering::Acquire)
    }
}
